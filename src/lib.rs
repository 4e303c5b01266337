//! Capture matplotlib figures from sandboxed Python as PNG data URIs.
//!
//! User code running in a headless worker has no window to `show()` a figure
//! in. This crate replaces the display entry point with a sink that renders
//! the current figure, appends it to the execution's image buffer as a
//! `data:image/png;base64,...` string, and closes the figure.
//!
//! The capture contract is plain Rust ([`ShowInterceptor`],
//! [`ExecutionContext`], [`PlottingCapability`], [`FigureSink`]). The
//! [`NativePythonEngine`] realises the same contract inside a long-lived
//! Python child process: a generated preamble is loaded once, then each
//! cell runs in the same globals.
//!
//! # Example
//! ```rust,ignore
//! use figcap::{ExecutionOptions, ExecutionRequest, ExecutionSession, NativePythonEngine};
//!
//! let engine = NativePythonEngine::new()?;
//! let mut session = ExecutionSession::new(Box::new(engine), ExecutionOptions::default());
//! let request = ExecutionRequest::new("cell-1", "import matplotlib.pyplot as plt\nplt.plot([1, 2])\nplt.show()")
//!     .dark_mode(true);
//! let result = session.run(&request).await?;
//! assert_eq!(result.images.len(), 1);
//! ```

pub mod buffer;
pub mod capability;
pub mod config;
pub mod context;
pub mod data_uri;
pub mod engine;
pub mod errors;
pub mod interceptor;
pub mod native;
pub mod packages;
pub mod preamble;
pub mod session;
pub mod sink;
pub mod stdout_images;

pub use buffer::ImageBuffer;
pub use capability::PlottingCapability;
pub use config::{BBoxMode, CaptureSettings, ImageFormat, ImportPolicy, ResourceLimits, SecurityProfile, Theme};
pub use context::{ExecutionContext, HookState};
pub use data_uri::{DataUri, PNG_DATA_URI_PREFIX};
pub use engine::{EngineCapabilities, ExecutionOptions, ExecutionOutput, ExecutionRequest, PythonEngine};
pub use errors::{CaptureError, ErrorCategory, Result};
pub use interceptor::ShowInterceptor;
pub use native::NativePythonEngine;
pub use session::{EngineFactory, ExecutionResult, ExecutionSession, SessionPool};
pub use sink::{
    diagnostic_channel, CaptureDiagnostic, CaptureReport, CaptureStage, DiagnosticReceiver,
    DiagnosticSender, FigureSink, ThemeOutcome,
};
