use figcap::{
    CaptureError, ErrorCategory, ExecutionOptions, ExecutionRequest, NativePythonEngine,
    PythonEngine, SecurityProfile, SessionPool,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

const DEFAULT_NOTEBOOK: &str = "global";

#[derive(Debug, Clone)]
struct WorkerConfig {
    python_path: Option<PathBuf>,
    timeout: Duration,
    profile: SecurityProfile,
}

impl WorkerConfig {
    fn from_env_and_args() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let mut python_path = std::env::var("FIGCAP_PYTHON_PATH").ok().map(PathBuf::from);
        let mut timeout_seconds = std::env::var("FIGCAP_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(30);
        let mut profile = std::env::var("FIGCAP_PROFILE")
            .ok()
            .and_then(|v| SecurityProfile::parse(&v))
            .unwrap_or_default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--python-path" => {
                    if let Some(v) = args.get(i + 1) {
                        python_path = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--timeout" => {
                    if let Some(v) = args.get(i + 1).and_then(|v| v.parse::<u64>().ok()) {
                        timeout_seconds = v;
                    }
                    i += 2;
                }
                "--profile" => {
                    if let Some(p) = args.get(i + 1).and_then(|v| SecurityProfile::parse(v)) {
                        profile = p;
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }

        Self {
            python_path,
            timeout: Duration::from_secs(timeout_seconds.clamp(1, 600)),
            profile,
        }
    }

    fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout: self.timeout,
            import_policy: self.profile.to_import_policy(),
            ..Default::default()
        }
    }

    fn create_engine(&self) -> figcap::Result<Box<dyn PythonEngine>> {
        let limits = self.profile.resource_limits();
        let engine = match &self.python_path {
            Some(path) => NativePythonEngine::with_python_path_and_limits(path.clone(), limits)?,
            None => NativePythonEngine::with_limits(limits)?,
        };
        Ok(Box::new(engine))
    }
}

fn default_notebook() -> String {
    DEFAULT_NOTEBOOK.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerRequest {
    Execute {
        #[serde(rename = "notebookId", default = "default_notebook")]
        notebook_id: String,
        #[serde(flatten)]
        request: ExecutionRequest,
    },
    Reset {
        #[serde(rename = "notebookId")]
        notebook_id: Option<String>,
    },
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerResponse {
    #[serde(rename_all = "camelCase")]
    Result {
        cell_id: String,
        stdout: String,
        stderr: String,
        stdout_images: Vec<String>,
        python_functions: Vec<String>,
        python_variables: BTreeMap<String, String>,
        diagnostics: Vec<figcap::CaptureDiagnostic>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        cell_id: Option<String>,
        message: String,
        category: ErrorCategory,
    },
    #[serde(rename_all = "camelCase")]
    Reset {
        notebook_id: Option<String>,
        existed: bool,
    },
}

fn error_response(cell_id: Option<String>, err: &CaptureError) -> WorkerResponse {
    WorkerResponse::Error {
        cell_id,
        message: err.to_string(),
        category: err.category(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "figcap_worker=info,figcap=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = WorkerConfig::from_env_and_args();
    tracing::info!(
        "figcap-worker starting (python={:?}, profile={:?}, timeout={:?})",
        cfg.python_path,
        cfg.profile,
        cfg.timeout
    );

    let factory_cfg = cfg.clone();
    let mut pool = SessionPool::new(
        Box::new(move || factory_cfg.create_engine()),
        cfg.execution_options(),
    );

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid request line: {} | err={}", line, e);
                let err = CaptureError::JsonError(e);
                write_response(&mut stdout, &error_response(None, &err)).await?;
                continue;
            }
        };

        let response = match request {
            WorkerRequest::Execute {
                notebook_id,
                request,
            } => match pool.execute(&notebook_id, &request).await {
                Ok(result) => WorkerResponse::Result {
                    cell_id: result.cell_id,
                    stdout: result.output.stdout,
                    stderr: result.output.stderr,
                    stdout_images: result.images,
                    python_functions: result.output.functions,
                    python_variables: result.output.variables,
                    diagnostics: result.output.diagnostics,
                },
                Err(e) => {
                    tracing::warn!("cell {} failed: {}", request.cell_id, e);
                    error_response(Some(request.cell_id.clone()), &e)
                }
            },
            WorkerRequest::Reset { notebook_id } => {
                let existed = match &notebook_id {
                    Some(id) => pool.reset(id).await,
                    None => {
                        let existed = !pool.is_empty();
                        pool.reset_all().await;
                        existed
                    }
                };
                WorkerResponse::Reset {
                    notebook_id,
                    existed,
                }
            }
            WorkerRequest::Shutdown => {
                pool.reset_all().await;
                break;
            }
        };

        write_response(&mut stdout, &response).await?;
    }

    pool.reset_all().await;
    Ok(())
}

async fn write_response(stdout: &mut io::Stdout, response: &WorkerResponse) -> anyhow::Result<()> {
    let s = serde_json::to_string(response)?;
    stdout.write_all(s.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
