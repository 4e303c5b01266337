use crate::{
    config::{CaptureSettings, ImportPolicy, ResourceLimits},
    context::ExecutionContext,
    engine::{EngineCapabilities, ExecutionOptions, ExecutionOutput, ExecutionRequest, PythonEngine},
    errors::{CaptureError, Result},
    packages::detect_required_packages,
    preamble,
    sink::CaptureDiagnostic,
    stdout_images,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const VALIDATE_SCRIPT: &str = r#"
import ast
import sys
try:
    ast.parse(sys.stdin.buffer.read().decode('utf-8'))
    print("OK")
except SyntaxError as e:
    print(f"SYNTAX_ERROR: {e}")
"#;

/// How much interpreter stderr is kept for error reports
const STDERR_TAIL_BYTES: usize = 8 * 1024;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// JSON block printed by the driver after each frame
#[derive(Debug, Default, Deserialize)]
struct PythonResult {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    error: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    diagnostics: Vec<CaptureDiagnostic>,
    #[serde(default)]
    functions: Vec<String>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

/// Options baked into an interpreter when it boots
#[derive(Debug, Clone, PartialEq, Eq)]
struct BootKey {
    capture: CaptureSettings,
    import_policy: ImportPolicy,
    env_vars: BTreeMap<String, String>,
}

impl BootKey {
    fn from_options(options: &ExecutionOptions) -> Self {
        Self {
            capture: options.capture.clone(),
            import_policy: options.import_policy.clone(),
            env_vars: options.env_vars.clone(),
        }
    }
}

/// Collects the stdout lines answering one frame.
///
/// Only lines equal to the frame's marker lines delimit the result; anything
/// else before the start marker was written straight to the process stdout.
struct ReplyReader {
    start: String,
    end: String,
    in_block: bool,
    block: String,
    stray: Vec<String>,
}

impl ReplyReader {
    fn new(nonce: &str) -> Self {
        let (start, end) = preamble::output_markers(nonce);
        Self {
            start,
            end,
            in_block: false,
            block: String::new(),
            stray: Vec::new(),
        }
    }

    /// Feed one line; true once the end marker has been read
    fn push(&mut self, line: String) -> bool {
        if !self.in_block {
            if line == self.start {
                self.in_block = true;
            } else if !line.trim().is_empty() {
                self.stray.push(line);
            }
            return false;
        }
        if line == self.end {
            return true;
        }
        if !self.block.is_empty() {
            self.block.push('\n');
        }
        self.block.push_str(&line);
        false
    }
}

/// A Python process running the frame driver, holding one notebook's globals
struct Interpreter {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<String>>,
    stderr_task: JoinHandle<()>,
    pid: Option<u32>,
    boot: BootKey,
}

impl Interpreter {
    /// Send one script and wait for its result
    async fn exchange(&mut self, script: &str) -> Result<(PythonResult, Vec<String>)> {
        let nonce = Uuid::new_v4().simple().to_string();
        self.stdin.write_all(&preamble::frame(&nonce, script)).await?;
        self.stdin.flush().await?;

        let mut reader = ReplyReader::new(&nonce);
        loop {
            match self.stdout.next_line().await? {
                Some(line) => {
                    if reader.push(line) {
                        break;
                    }
                }
                None => return Err(self.exit_error().await),
            }
        }

        let parsed = serde_json::from_str::<PythonResult>(&reader.block)?;
        Ok((parsed, reader.stray))
    }

    /// Map an interpreter that closed its stdout to an error
    async fn exit_error(&mut self) -> CaptureError {
        let status = self.child.wait().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.stderr_task).await;
        let tail = self
            .stderr_tail
            .lock()
            .map(|tail| tail.clone())
            .unwrap_or_default();

        if tail.contains("MemoryError") {
            return CaptureError::MemoryLimitExceeded;
        }
        match status {
            Ok(_) if !tail.trim().is_empty() => CaptureError::RuntimeError(tail.trim().to_string()),
            Ok(status) => match status.code() {
                Some(code) => CaptureError::ProcessExitCode(code),
                None => CaptureError::InternalError("Python process killed by signal".to_string()),
            },
            Err(e) => CaptureError::IoError(e),
        }
    }

    /// Close stdin so the driver returns, killing it if it does not exit
    async fn shutdown(self) {
        let Interpreter {
            mut child,
            stdin,
            stderr_task,
            pid,
            ..
        } = self;
        drop(stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("interpreter exited: {}", status),
            _ => {
                warn!("interpreter did not exit after stdin closed, killing it");
                kill_process_group(pid);
                let _ = child.kill().await;
            }
        }
        stderr_task.abort();
    }

    /// Kill the interpreter and everything it spawned
    async fn terminate(mut self) {
        kill_process_group(self.pid);
        let _ = self.child.kill().await;
        self.stderr_task.abort();
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

fn append_tail(tail: &Mutex<String>, line: &str) {
    if let Ok(mut tail) = tail.lock() {
        tail.push_str(line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("python stderr: {}", line);
        append_tail(&tail, &line);
    }
}

/// Python in a long-lived child process, with the matplotlib capture
/// preamble loaded once and every cell run in the same globals
pub struct NativePythonEngine {
    python_path: PathBuf,
    limits: ResourceLimits,
    matplotlib: bool,
    interpreter: Option<Interpreter>,
}

impl NativePythonEngine {
    /// Create a new native Python engine (finds Python in PATH)
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| CaptureError::PythonNotFound)?;

        Ok(Self::from_parts(python_path, ResourceLimits::default()))
    }

    /// Create with explicit Python path (for bundled Python)
    pub fn with_python_path(python_path: PathBuf) -> Result<Self> {
        if !python_path.exists() {
            return Err(CaptureError::PythonNotFound);
        }

        Ok(Self::from_parts(python_path, ResourceLimits::default()))
    }

    /// Create with custom resource limits
    pub fn with_limits(limits: ResourceLimits) -> Result<Self> {
        let mut engine = Self::new()?;
        engine.limits = limits;
        Ok(engine)
    }

    /// Create with bundled Python and custom limits
    pub fn with_python_path_and_limits(
        python_path: PathBuf,
        limits: ResourceLimits,
    ) -> Result<Self> {
        let mut engine = Self::with_python_path(python_path)?;
        engine.limits = limits;
        Ok(engine)
    }

    fn from_parts(python_path: PathBuf, limits: ResourceLimits) -> Self {
        Self {
            python_path,
            limits,
            // Assumed until `detect_matplotlib` says otherwise
            matplotlib: true,
            interpreter: None,
        }
    }

    /// Get the Python executable path being used
    pub fn python_path(&self) -> &PathBuf {
        &self.python_path
    }

    /// Whether a booted interpreter is waiting for the next cell
    pub fn is_running(&self) -> bool {
        self.interpreter.is_some()
    }

    /// Check whether the interpreter can import matplotlib and remember it
    /// for [`PythonEngine::capabilities`]
    pub async fn detect_matplotlib(&mut self) -> bool {
        let status = Command::new(&self.python_path)
            .arg("-c")
            .arg("import matplotlib")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        self.matplotlib = matches!(status, Ok(s) if s.success());
        if !self.matplotlib {
            warn!(
                "matplotlib not importable with {:?}; show() will capture empty images",
                self.python_path
            );
        }
        self.matplotlib
    }

    /// Reject requests whose imports the policy forbids before running them
    fn check_packages(&self, request: &ExecutionRequest, options: &ExecutionOptions) -> Result<()> {
        let detected = detect_required_packages(&request.code);
        let requested = request.packages.iter().map(String::as_str);
        for package in detected.into_iter().chain(requested) {
            let module = import_name(package);
            if !options.import_policy.is_allowed(module) {
                return Err(CaptureError::ImportNotAllowed(module.to_string()));
            }
        }
        Ok(())
    }

    /// Start the driver and load the preamble into it
    async fn spawn_interpreter(&self, options: &ExecutionOptions) -> Result<Interpreter> {
        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-c")
            .arg(preamble::driver_script())
            .arg(preamble::DRIVER_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg");

        // Set thread limits
        cmd.env("OMP_NUM_THREADS", self.limits.max_threads.to_string())
            .env("OPENBLAS_NUM_THREADS", self.limits.max_threads.to_string())
            .env("MKL_NUM_THREADS", self.limits.max_threads.to_string());
        for (key, value) in &options.env_vars {
            cmd.env(key, value);
        }

        self.apply_resource_limits(&mut cmd, &self.limits);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(CaptureError::InternalError(
                    "Python stdio was not captured".to_string(),
                ))
            }
        };
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_task = tokio::spawn(drain_stderr(stderr, stderr_tail.clone()));

        let mut interpreter = Interpreter {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
            stderr_task,
            pid,
            boot: BootKey::from_options(options),
        };

        let boot = preamble::boot_script(&options.capture, &options.import_policy);
        let booted = tokio::time::timeout(options.timeout, interpreter.exchange(&boot)).await;
        let failure = match booted {
            Ok(Ok((parsed, _))) => match parsed.error {
                None => {
                    info!("python interpreter started (pid {:?})", pid);
                    return Ok(interpreter);
                }
                Some(error) => CaptureError::InternalError(format!("preamble failed: {}", error)),
            },
            Ok(Err(e)) => e,
            Err(_) => CaptureError::Timeout,
        };
        warn!("python interpreter failed to start: {}", failure);
        interpreter.terminate().await;
        Err(failure)
    }

    /// Reuse the running interpreter if it was booted with the same options
    async fn take_interpreter(&mut self, options: &ExecutionOptions) -> Result<Interpreter> {
        match self.interpreter.take() {
            Some(interpreter) if interpreter.boot == BootKey::from_options(options) => Ok(interpreter),
            Some(interpreter) => {
                info!("execution options changed, restarting python interpreter");
                interpreter.shutdown().await;
                self.spawn_interpreter(options).await
            }
            None => self.spawn_interpreter(options).await,
        }
    }

    /// Apply resource limits to the command.
    ///
    /// The limits cover the whole interpreter, so CPU time accumulates
    /// across the cells it runs.
    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command, limits: &ResourceLimits) {
        let cpu_seconds = limits.cpu_seconds;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = limits.memory_mb * 1024 * 1024;
        #[cfg(not(target_os = "macos"))]
        let max_processes = limits.max_processes;

        unsafe {
            cmd.pre_exec(move || {
                // New process group so a timeout can kill everything at once
                libc::setpgid(0, 0);

                // macOS doesn't support RLIMIT_AS properly
                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: max_processes as libc::rlim_t,
                        rlim_max: max_processes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_NPROC, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command, _limits: &ResourceLimits) {
        // Only the wall clock timeout applies here
    }
}

/// Module name a package is imported under
fn import_name(package: &str) -> &str {
    match package {
        "pillow" => "PIL",
        other => other,
    }
}

/// Move captured figures into the context and build the host-facing output.
///
/// Hook-captured images come first, then any image data URIs the code
/// printed, which are removed from the returned stdout. `stray` lines were
/// written to the process stdout directly and are put in front of the
/// captured text.
fn record_result(
    parsed: PythonResult,
    stray: &[String],
    ctx: &mut ExecutionContext,
) -> Result<ExecutionOutput> {
    for image in parsed.images {
        ctx.record_image(image);
    }
    let stdout = if stray.is_empty() {
        parsed.stdout
    } else {
        format!("{}\n{}", stray.join("\n"), parsed.stdout)
    };
    let printed = stdout_images::parse_stdout(&stdout);
    for image in printed.images {
        ctx.record_image(image);
    }
    for diagnostic in &parsed.diagnostics {
        ctx.report_diagnostic(diagnostic.clone());
    }

    if let Some(error) = parsed.error.filter(|e| !e.is_empty()) {
        if error.starts_with("MemoryError") {
            return Err(CaptureError::MemoryLimitExceeded);
        }
        return Err(CaptureError::RuntimeError(error));
    }

    Ok(ExecutionOutput {
        stdout: printed.text,
        stderr: parsed.stderr,
        functions: parsed.functions,
        variables: parsed.variables,
        diagnostics: parsed.diagnostics,
    })
}

#[async_trait]
impl PythonEngine for NativePythonEngine {
    async fn validate(&self, code: &str) -> Result<()> {
        let mut child = Command::new(&self.python_path)
            .arg("-c")
            .arg(VALIDATE_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take();
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(code.as_bytes()).await?;
        }
        let mut verdict = String::new();
        if let Some(stdout) = stdout.as_mut() {
            stdout.read_to_string(&mut verdict).await?;
        }
        child.wait().await?;

        if verdict.starts_with("SYNTAX_ERROR:") {
            return Err(CaptureError::SyntaxError(
                verdict.trim_start_matches("SYNTAX_ERROR: ").trim_end().to_string(),
            ));
        }

        Ok(())
    }

    async fn execute(
        &mut self,
        request: &ExecutionRequest,
        ctx: &mut ExecutionContext,
        options: &ExecutionOptions,
    ) -> Result<ExecutionOutput> {
        let execution_id = Uuid::new_v4();
        info!(
            "[{}] executing cell {} ({} bytes)",
            execution_id,
            request.cell_id,
            request.code.len()
        );

        self.check_packages(request, options)?;
        self.validate(&request.code).await?;

        let mut interpreter = self.take_interpreter(options).await?;
        let script = preamble::cell_script(request.theme(), &request.code, &request.python_variables);
        let reply = tokio::time::timeout(options.timeout, interpreter.exchange(&script)).await;

        match reply {
            Ok(Ok((parsed, stray))) => {
                debug!(
                    "[{}] {} image(s), {} diagnostic(s)",
                    execution_id,
                    parsed.images.len(),
                    parsed.diagnostics.len()
                );
                self.interpreter = Some(interpreter);
                record_result(parsed, &stray, ctx)
            }
            Ok(Err(e)) => {
                warn!("[{}] interpreter lost: {}", execution_id, e);
                interpreter.terminate().await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    "[{}] timed out after {:?}, killing process group",
                    execution_id, options.timeout
                );
                interpreter.terminate().await;
                Err(CaptureError::Timeout)
            }
        }
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "Native Python (figure capture)".to_string(),
            matplotlib: self.matplotlib,
            max_memory_mb: self.limits.memory_mb,
            max_cpu_seconds: self.limits.cpu_seconds,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(interpreter) = self.interpreter.take() {
            interpreter.shutdown().await;
        }
        Ok(())
    }
}
