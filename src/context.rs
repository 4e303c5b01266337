use crate::buffer::ImageBuffer;
use crate::config::Theme;
use crate::sink::{CaptureDiagnostic, CaptureReport, DiagnosticSender, FigureSink, ThemeOutcome};
use tracing::debug;
use uuid::Uuid;

/// Whether a figure sink is bound as the display entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    NotInstalled,
    /// Carries the id assigned when the sink was installed
    Installed(Uuid),
}

struct InstalledSink {
    id: Uuid,
    sink: Box<dyn FigureSink>,
}

/// Per-session state shared between the host and user code.
///
/// The host calls [`begin`](Self::begin) before each execution and
/// [`finish`](Self::finish) after it; in between, user-facing code calls
/// [`show`](Self::show) to display the current figure.
#[derive(Default)]
pub struct ExecutionContext {
    images: ImageBuffer,
    theme: Theme,
    display: Option<InstalledSink>,
    diagnostics: Option<DiagnosticSender>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward suppressed failures to `sender` in addition to debug logs
    pub fn with_diagnostics(mut self, sender: DiagnosticSender) -> Self {
        self.diagnostics = Some(sender);
        self
    }

    /// Bind `sink` as the display entry point.
    ///
    /// Only the first call binds; later calls keep the existing sink and
    /// return its state unchanged.
    pub fn install_hook<S: FigureSink + 'static>(&mut self, sink: S) -> HookState {
        if let Some(installed) = &self.display {
            debug!("display hook already installed ({})", installed.id);
            return HookState::Installed(installed.id);
        }
        let id = Uuid::new_v4();
        self.display = Some(InstalledSink {
            id,
            sink: Box::new(sink),
        });
        debug!("installed display hook {}", id);
        HookState::Installed(id)
    }

    pub fn hook_state(&self) -> HookState {
        match &self.display {
            Some(installed) => HookState::Installed(installed.id),
            None => HookState::NotInstalled,
        }
    }

    /// Start a new execution: clear captured images and apply the theme
    pub fn begin(&mut self, theme: Theme) -> ThemeOutcome {
        self.images.clear();
        self.theme = theme;

        let outcome = match self.display.as_mut() {
            Some(installed) => installed.sink.apply_theme(theme),
            None => ThemeOutcome::Skipped,
        };
        if let ThemeOutcome::Failed(diagnostic) = &outcome {
            self.report_diagnostic(diagnostic.clone());
        }
        outcome
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    /// The display entry point. Returns `None` when no hook is installed.
    pub fn show(&mut self) -> Option<CaptureReport> {
        let installed = self.display.as_mut()?;
        let report = installed.sink.publish(&mut self.images);
        for diagnostic in &report.diagnostics {
            self.report_diagnostic(diagnostic.clone());
        }
        Some(report)
    }

    /// Record an image captured outside the installed sink (e.g. by a
    /// Python process running the same hook)
    pub fn record_image(&mut self, data_uri: String) -> usize {
        self.images.push(data_uri)
    }

    pub fn images(&self) -> &ImageBuffer {
        &self.images
    }

    /// Hand suppressed failures to the host's diagnostic channel, if any
    pub fn report_diagnostic(&self, diagnostic: CaptureDiagnostic) {
        debug!(
            "suppressed {:?} failure: {}",
            diagnostic.stage, diagnostic.message
        );
        if let Some(sender) = &self.diagnostics {
            // A dropped receiver just means nobody is listening
            let _ = sender.send(diagnostic);
        }
    }

    /// End the execution and hand the captured images to the host
    pub fn finish(&mut self) -> Vec<String> {
        self.images.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_uri::{DataUri, PNG_DATA_URI_PREFIX, PNG_MAGIC};
    use crate::interceptor::testing::FakePlot;
    use crate::interceptor::ShowInterceptor;
    use crate::sink::{diagnostic_channel, CaptureStage};

    #[test]
    fn test_install_hook_is_idempotent() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.hook_state(), HookState::NotInstalled);

        let first = ctx.install_hook(ShowInterceptor::new(Some(FakePlot::new())));
        let second = ctx.install_hook(ShowInterceptor::<FakePlot>::new(None));

        assert_eq!(first, second);
        assert_eq!(ctx.hook_state(), first);

        // The first interceptor (with a working plot) is still the one bound
        ctx.begin(Theme::Light);
        ctx.show();
        assert!(DataUri::parse(ctx.images().get(0).unwrap()).unwrap().is_png());
    }

    #[test]
    fn test_show_without_hook_is_noop() {
        let mut ctx = ExecutionContext::new();
        assert!(ctx.show().is_none());
        assert!(ctx.images().is_empty());
        assert_eq!(ctx.begin(Theme::Dark), ThemeOutcome::Skipped);
    }

    #[test]
    fn test_two_show_calls_yield_two_png_images() {
        let mut ctx = ExecutionContext::new();
        ctx.install_hook(ShowInterceptor::new(Some(FakePlot::new())));

        ctx.record_image("left over from a previous run".to_string());
        ctx.begin(Theme::Light);
        assert!(ctx.images().is_empty());

        ctx.show();
        ctx.show();

        let images = ctx.finish();
        assert_eq!(images.len(), 2);
        for uri in &images {
            assert!(uri.starts_with(PNG_DATA_URI_PREFIX));
            let bytes = DataUri::parse(uri).unwrap().decode().unwrap();
            assert!(!bytes.is_empty());
            assert!(bytes.starts_with(PNG_MAGIC));
        }
        assert!(ctx.images().is_empty());
    }

    #[test]
    fn test_begin_applies_theme_once() {
        let plot = FakePlot::new();
        let log = plot.log.clone();
        let mut ctx = ExecutionContext::new();
        ctx.install_hook(ShowInterceptor::new(Some(plot)));

        assert_eq!(ctx.begin(Theme::Dark), ThemeOutcome::Applied);
        assert_eq!(ctx.theme(), Theme::Dark);
        assert_eq!(log.lock().unwrap().styles, vec!["dark_background".to_string()]);
    }

    #[test]
    fn test_diagnostics_reach_channel() {
        let (tx, mut rx) = diagnostic_channel();
        let mut plot = FakePlot::new();
        plot.known_styles = vec![];
        plot.fail_render = true;

        let mut ctx = ExecutionContext::new().with_diagnostics(tx);
        ctx.install_hook(ShowInterceptor::new(Some(plot)));

        assert!(matches!(ctx.begin(Theme::Dark), ThemeOutcome::Failed(_)));
        let report = ctx.show().unwrap();
        assert_eq!(report.diagnostics.len(), 1);

        assert_eq!(rx.try_recv().unwrap().stage, CaptureStage::Theme);
        assert_eq!(rx.try_recv().unwrap().stage, CaptureStage::Render);
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.images().len(), 1);
    }
}
