use crate::buffer::ImageBuffer;
use crate::config::Theme;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Which part of figure handling a suppressed failure came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStage {
    /// Binding the capture function as the display entry point
    Hook,
    Theme,
    Render,
    Release,
}

/// A failure that was absorbed instead of interrupting user code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureDiagnostic {
    pub stage: CaptureStage,
    pub message: String,
}

impl CaptureDiagnostic {
    pub fn new(stage: CaptureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

pub type DiagnosticSender = UnboundedSender<CaptureDiagnostic>;
pub type DiagnosticReceiver = UnboundedReceiver<CaptureDiagnostic>;

/// Create the optional channel a host can attach to an execution context
pub fn diagnostic_channel() -> (DiagnosticSender, DiagnosticReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Result of applying a theme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThemeOutcome {
    Applied,
    /// No plotting library, nothing to style
    Skipped,
    Failed(CaptureDiagnostic),
}

/// Result of one display call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureReport {
    /// Index of the appended entry in the image buffer
    pub index: usize,
    pub diagnostics: Vec<CaptureDiagnostic>,
}

impl CaptureReport {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Destination for figures when user code asks to display one.
///
/// Installed into an [`ExecutionContext`](crate::context::ExecutionContext) in
/// place of the plotting library's GUI `show`.
pub trait FigureSink: Send {
    /// Publish the current figure into `images`
    fn publish(&mut self, images: &mut ImageBuffer) -> CaptureReport;

    /// Apply the execution's theme before any figure is drawn
    fn apply_theme(&mut self, _theme: Theme) -> ThemeOutcome {
        ThemeOutcome::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_match_python_side() {
        let stages = [
            (CaptureStage::Hook, "\"hook\""),
            (CaptureStage::Theme, "\"theme\""),
            (CaptureStage::Render, "\"render\""),
            (CaptureStage::Release, "\"release\""),
        ];
        for (stage, name) in stages {
            assert_eq!(serde_json::to_string(&stage).unwrap(), name);
        }
        let parsed: CaptureDiagnostic =
            serde_json::from_str(r#"{"stage": "hook", "message": "AttributeError: show"}"#).unwrap();
        assert_eq!(parsed.stage, CaptureStage::Hook);
    }
}
