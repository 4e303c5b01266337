use crate::config::{BBoxMode, ImageFormat};
use crate::errors::Result;
use std::io::Write;

/// What the show interceptor needs from a plotting library.
///
/// Implementations wrap whatever holds the "current figure". The interceptor
/// only ever talks to the library through these three calls.
pub trait PlottingCapability: Send {
    /// Select a named visual style
    fn select_style(&mut self, name: &str) -> Result<()>;

    /// Render the currently active figure into `out`
    fn render_current_figure(
        &mut self,
        out: &mut dyn Write,
        format: ImageFormat,
        bbox: BBoxMode,
    ) -> Result<()>;

    /// Close the current figure and free whatever it holds
    fn release_current_figure(&mut self) -> Result<()>;
}

impl<C: PlottingCapability + ?Sized> PlottingCapability for Box<C> {
    fn select_style(&mut self, name: &str) -> Result<()> {
        (**self).select_style(name)
    }

    fn render_current_figure(
        &mut self,
        out: &mut dyn Write,
        format: ImageFormat,
        bbox: BBoxMode,
    ) -> Result<()> {
        (**self).render_current_figure(out, format, bbox)
    }

    fn release_current_figure(&mut self) -> Result<()> {
        (**self).release_current_figure()
    }
}
