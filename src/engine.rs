use crate::config::{CaptureSettings, ImportPolicy, Theme};
use crate::context::ExecutionContext;
use crate::errors::Result;
use crate::sink::CaptureDiagnostic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One cell's worth of code to run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub cell_id: String,
    pub code: String,
    #[serde(default)]
    pub is_dark_mode: bool,
    /// Packages the host expects to be importable, on top of those detected
    #[serde(default)]
    pub packages: Vec<String>,
    /// Global names whose `repr` should be reported after execution
    #[serde(default)]
    pub python_variables: Vec<String>,
}

impl ExecutionRequest {
    pub fn new(cell_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            code: code.into(),
            is_dark_mode: false,
            packages: Vec::new(),
            python_variables: Vec::new(),
        }
    }

    pub fn dark_mode(mut self, is_dark: bool) -> Self {
        self.is_dark_mode = is_dark;
        self
    }

    pub fn theme(&self) -> Theme {
        Theme::from_dark_mode(self.is_dark_mode)
    }
}

/// Options for Python code execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Wall clock timeout
    pub timeout: Duration,
    /// Import policy
    pub import_policy: ImportPolicy,
    /// How figures are rendered when user code calls `show`
    pub capture: CaptureSettings,
    /// Environment variables to set
    pub env_vars: BTreeMap<String, String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(35),
            import_policy: ImportPolicy::default(),
            capture: CaptureSettings::default(),
            env_vars: BTreeMap::new(),
        }
    }
}

/// What a finished execution produced. Captured images are left in the
/// [`ExecutionContext`] for the host to collect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    /// Names of functions defined at module level
    pub functions: Vec<String>,
    /// `repr` of each requested variable
    pub variables: BTreeMap<String, String>,
    /// Failures absorbed while theming or capturing figures
    pub diagnostics: Vec<CaptureDiagnostic>,
}

/// Capabilities of a Python execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// Engine name
    pub name: String,
    /// Whether matplotlib could be imported
    pub matplotlib: bool,
    /// Maximum memory in MB
    pub max_memory_mb: usize,
    /// Maximum CPU time in seconds
    pub max_cpu_seconds: u64,
}

/// Trait for Python execution engines
#[async_trait]
pub trait PythonEngine: Send + Sync {
    /// Validate code before execution
    async fn validate(&self, code: &str) -> Result<()>;

    /// Execute a request, recording captured figures into `ctx`
    async fn execute(
        &mut self,
        request: &ExecutionRequest,
        ctx: &mut ExecutionContext,
        options: &ExecutionOptions,
    ) -> Result<ExecutionOutput>;

    /// Get engine capabilities
    fn capabilities(&self) -> EngineCapabilities;

    /// Shutdown the engine
    async fn shutdown(&mut self) -> Result<()>;
}
