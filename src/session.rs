use crate::context::ExecutionContext;
use crate::engine::{ExecutionOptions, ExecutionOutput, ExecutionRequest, PythonEngine};
use crate::errors::Result;
use crate::sink::DiagnosticSender;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{info, warn};

/// Output of one execution together with the figures it displayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub cell_id: String,
    pub output: ExecutionOutput,
    /// Data URIs in the order user code displayed them
    pub images: Vec<String>,
}

/// One notebook's execution context and engine
pub struct ExecutionSession {
    context: ExecutionContext,
    engine: Box<dyn PythonEngine>,
    options: ExecutionOptions,
}

impl ExecutionSession {
    pub fn new(engine: Box<dyn PythonEngine>, options: ExecutionOptions) -> Self {
        Self {
            context: ExecutionContext::new(),
            engine,
            options,
        }
    }

    pub fn with_diagnostics(mut self, sender: DiagnosticSender) -> Self {
        self.context = self.context.with_diagnostics(sender);
        self
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Run a request. The image buffer is cleared before and drained after,
    /// so images never leak between executions, even failed ones.
    pub async fn run(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.context.begin(request.theme());
        let result = self
            .engine
            .execute(request, &mut self.context, &self.options)
            .await;
        let images = self.context.finish();

        let output = result?;
        Ok(ExecutionResult {
            cell_id: request.cell_id.clone(),
            output,
            images,
        })
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.engine.shutdown().await
    }
}

pub type EngineFactory = Box<dyn Fn() -> Result<Box<dyn PythonEngine>> + Send + Sync>;

/// Sessions keyed by notebook id, created on first use
pub struct SessionPool {
    sessions: HashMap<String, ExecutionSession>,
    factory: EngineFactory,
    options: ExecutionOptions,
}

impl SessionPool {
    pub fn new(factory: EngineFactory, options: ExecutionOptions) -> Self {
        Self {
            sessions: HashMap::new(),
            factory,
            options,
        }
    }

    /// Get the notebook's session, creating it if needed
    pub fn session(&mut self, notebook_id: &str) -> Result<&mut ExecutionSession> {
        match self.sessions.entry(notebook_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let engine = (self.factory)()?;
                info!(
                    "created session for notebook {} ({})",
                    notebook_id,
                    engine.capabilities().name
                );
                Ok(entry.insert(ExecutionSession::new(engine, self.options.clone())))
            }
        }
    }

    pub async fn execute(
        &mut self,
        notebook_id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        self.session(notebook_id)?.run(request).await
    }

    /// Drop a notebook's session. Returns whether one existed.
    pub async fn reset(&mut self, notebook_id: &str) -> bool {
        let Some(mut session) = self.sessions.remove(notebook_id) else {
            return false;
        };
        if let Err(e) = session.shutdown().await {
            warn!("failed to shut down session {}: {}", notebook_id, e);
        }
        true
    }

    pub async fn reset_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.reset(&id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
