//! # Evaluation Engines
//!
//! The supervisor talks to interpreters only through two traits:
//!
//! - [`Engine`]: shared per daemon. Creates sessions, supplies the prelude,
//!   and delivers cancellation.
//! - [`EngineSession`]: one per context key. Evaluates source text.
//!
//! Evaluations run on a blocking worker thread. They receive an
//! [`EvalContext`] carrying the output buffer and the cancellation signal.
//! Engines are expected to poll [`EvalContext::is_cancelled`] or register an
//! interrupt hook; nothing forcibly stops a worker that does neither.

pub mod script;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::capture::CaptureBuffer;
use crate::config::{EngineConfig, EngineKind};
use crate::value::Value;

/// Result of evaluating one chunk of source.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Finished; `Some` when the source produced a value.
    Completed(Option<Value>),
    /// The source is an unterminated statement; retry with more appended.
    Incomplete,
    /// The language reported an error, already rendered as text.
    Failed(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("failed to create session: {0}")]
    Session(String),
    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Source evaluated once in every new session before its first request.
    fn prelude(&self) -> Option<String> {
        None
    }

    fn new_session(&self) -> EngineResult<Box<dyn EngineSession>>;

    /// Asks an in-flight evaluation to stop.
    fn cancel(&self, ctx: &EvalContext) {
        ctx.cancel();
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait EngineSession: Send + 'static {
    fn evaluate(&mut self, source: &str, ctx: &EvalContext) -> EngineResult<Evaluation>;
}

type Interrupt = Box<dyn FnOnce() + Send>;

/// Per-evaluation environment handed to [`EngineSession::evaluate`].
#[derive(Clone)]
pub struct EvalContext {
    output: CaptureBuffer,
    cancellation: CancellationToken,
    interrupts: Arc<Mutex<Vec<Interrupt>>>,
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl EvalContext {
    pub fn new(output: CaptureBuffer, cancellation: CancellationToken) -> Self {
        Self {
            output,
            cancellation,
            interrupts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn output(&self) -> &CaptureBuffer {
        &self.output
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Registers a hook run when the evaluation is cancelled. Runs
    /// immediately if cancellation already happened.
    pub fn on_cancel<F>(&self, interrupt: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut interrupts = self
            .interrupts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_cancelled() {
            drop(interrupts);
            interrupt();
        } else {
            interrupts.push(Box::new(interrupt));
        }
    }

    pub fn cancel(&self) {
        let pending = {
            let mut interrupts = self
                .interrupts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.cancellation.cancel();
            std::mem::take(&mut *interrupts)
        };
        for interrupt in pending {
            interrupt();
        }
    }
}

/// Builds the engine selected in the configuration.
pub fn build_engine(config: &EngineConfig) -> Arc<dyn Engine> {
    match config.kind {
        EngineKind::Script => {
            let engine = match &config.prelude {
                Some(prelude) => script::ScriptEngine::with_prelude(prelude.clone()),
                None => script::ScriptEngine::new(),
            };
            Arc::new(engine)
        }
    }
}
