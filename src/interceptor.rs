use crate::buffer::ImageBuffer;
use crate::capability::PlottingCapability;
use crate::config::{CaptureSettings, Theme};
use crate::data_uri;
use crate::sink::{CaptureDiagnostic, CaptureReport, CaptureStage, FigureSink, ThemeOutcome};
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Replacement for the plotting library's `show`.
///
/// Renders the current figure, appends it to the image buffer as a PNG data
/// URI and closes the figure. Never fails: when the library is missing or a
/// step errors, a diagnostic is returned and an (possibly empty) entry is
/// still appended.
pub struct ShowInterceptor<C> {
    capability: Option<C>,
    settings: CaptureSettings,
}

impl<C: PlottingCapability> ShowInterceptor<C> {
    /// `None` means the plotting library failed to load
    pub fn new(capability: Option<C>) -> Self {
        Self {
            capability,
            settings: CaptureSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn capability(&self) -> Option<&C> {
        self.capability.as_ref()
    }

    pub fn capability_mut(&mut self) -> Option<&mut C> {
        self.capability.as_mut()
    }

    pub fn apply_theme(&mut self, is_dark: bool) -> ThemeOutcome {
        let Some(capability) = self.capability.as_mut() else {
            return ThemeOutcome::Skipped;
        };
        let style = Theme::from_dark_mode(is_dark).style_name();
        match capability.select_style(style) {
            Ok(()) => ThemeOutcome::Applied,
            Err(e) => ThemeOutcome::Failed(CaptureDiagnostic::new(CaptureStage::Theme, e.to_string())),
        }
    }

    pub fn capture_and_append(&mut self, images: &mut ImageBuffer) -> CaptureReport {
        let mut diagnostics = Vec::new();
        let format = self.settings.format;

        let bytes = {
            let mut buf = Cursor::new(Vec::new());
            if let Some(capability) = self.capability.as_mut() {
                if let Err(e) = capability.render_current_figure(&mut buf, format, self.settings.bbox) {
                    diagnostics.push(CaptureDiagnostic::new(CaptureStage::Render, e.to_string()));
                    // Partial output is not a usable image
                    buf.get_mut().clear();
                }
            }
            read_from_start(&mut buf).unwrap_or_else(|e| {
                diagnostics.push(CaptureDiagnostic::new(CaptureStage::Render, e.to_string()));
                Vec::new()
            })
        };

        let index = images.push(data_uri::encode(format, &bytes));

        if let Some(capability) = self.capability.as_mut() {
            if let Err(e) = capability.release_current_figure() {
                diagnostics.push(CaptureDiagnostic::new(CaptureStage::Release, e.to_string()));
            }
        }

        CaptureReport { index, diagnostics }
    }
}

fn read_from_start(buf: &mut Cursor<Vec<u8>>) -> std::io::Result<Vec<u8>> {
    buf.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::with_capacity(buf.get_ref().len());
    buf.read_to_end(&mut bytes)?;
    Ok(bytes)
}

impl<C: PlottingCapability> FigureSink for ShowInterceptor<C> {
    fn publish(&mut self, images: &mut ImageBuffer) -> CaptureReport {
        self.capture_and_append(images)
    }

    fn apply_theme(&mut self, theme: Theme) -> ThemeOutcome {
        ShowInterceptor::apply_theme(self, theme.is_dark())
    }
}
