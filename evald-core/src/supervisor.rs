//! # Execution Supervisor
//!
//! Runs one chunk of source against one [`Session`] under a deadline.
//!
//! ## Request lifecycle
//!
//! 1. The session state is locked for the whole request, which serializes
//!    requests per key in arrival order.
//! 2. The chunk joins the pending source and the joined text is evaluated on a
//!    blocking worker with a fresh capture buffer. A session's prelude runs on
//!    that worker before its first evaluation.
//! 3. If the deadline passes, the engine is asked to cancel and the worker gets
//!    `cancel_grace` to wind down. A worker that does not stop in time is
//!    abandoned: it keeps the engine handle, and later requests for the key
//!    wait for it under their own deadlines.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{SupervisorConfig, TimeoutPolicy};
use crate::engine::{Engine, EngineError, EngineResult, EvalContext, Evaluation};
use crate::formatter::format_value;
use crate::session::{Session, SessionState, SharedEngineSlot};

pub const CONTINUE_MARKER: &str = "(continue...)";
pub const TIMED_OUT_MARKER: &str = "(timed out)";
pub const PROBABLY_TIMED_OUT_MARKER: &str = "(timed out... probably?)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// Captured output followed by the formatted value, if one was produced.
    Output(String),
    /// The statement is incomplete; pending source was kept.
    Continue,
    /// Captured output followed by the language's error text.
    Failed(String),
    /// The worker stopped within the cancellation grace period.
    TimedOut,
    /// The worker was abandoned while still running.
    ProbablyTimedOut,
    /// A failure outside the language itself, such as an engine panic.
    Internal(String),
}

impl EvalOutcome {
    pub fn text(&self) -> &str {
        match self {
            EvalOutcome::Output(text) | EvalOutcome::Failed(text) | EvalOutcome::Internal(text) => {
                text
            }
            EvalOutcome::Continue => CONTINUE_MARKER,
            EvalOutcome::TimedOut => TIMED_OUT_MARKER,
            EvalOutcome::ProbablyTimedOut => PROBABLY_TIMED_OUT_MARKER,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            EvalOutcome::Output(text) | EvalOutcome::Failed(text) | EvalOutcome::Internal(text) => {
                text
            }
            other => other.text().to_string(),
        }
    }

    /// Whether the evaluation ran to a definite answer.
    pub fn is_finished(&self) -> bool {
        matches!(self, EvalOutcome::Output(_) | EvalOutcome::Failed(_))
    }
}

pub struct Supervisor {
    engine: Arc<dyn Engine>,
    config: SupervisorConfig,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Supervisor {
    pub fn new(engine: Arc<dyn Engine>, config: SupervisorConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Effective deadline for a request; `None` waits forever.
    pub fn deadline(&self, timeout_ms: u32) -> Option<Duration> {
        let requested = (timeout_ms > 0).then(|| Duration::from_millis(u64::from(timeout_ms)));
        match (requested, self.config.timeout_cap) {
            (Some(requested), Some(cap)) => Some(requested.min(cap)),
            (requested, cap) => requested.or(cap),
        }
    }

    #[instrument(level = "debug", skip(self, session, chunk), fields(key = %session.key()))]
    pub async fn run(&self, session: &Session, chunk: &str, timeout_ms: u32) -> EvalOutcome {
        let mut state = session.lock_state().await;
        session.touch();

        state.pending.push(chunk.to_string());
        let source = state.pending_source();

        let output = session.capture().begin();
        let ctx = EvalContext::new(output.clone(), CancellationToken::new());
        let worker_ctx = ctx.clone();
        let slot = session.engine_slot();
        let prelude = self.engine.prelude();
        let mut worker = tokio::task::spawn_blocking(move || {
            evaluate_on_worker(&slot, prelude.as_deref(), &source, &worker_ctx)
        });

        let joined = match self.deadline(timeout_ms) {
            None => (&mut worker).await,
            Some(deadline) => match tokio::time::timeout(deadline, &mut worker).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!(deadline_ms = deadline.as_millis() as u64, "deadline passed, cancelling");
                    self.engine.cancel(&ctx);
                    let stopped = tokio::time::timeout(self.config.cancel_grace, &mut worker)
                        .await
                        .is_ok();
                    self.apply_timeout_policy(&mut state);
                    session.touch();
                    if stopped {
                        return EvalOutcome::TimedOut;
                    }
                    warn!("worker did not stop after cancellation, abandoning it");
                    return EvalOutcome::ProbablyTimedOut;
                }
            },
        };
        session.touch();

        let evaluation = match joined {
            Ok(evaluation) => evaluation,
            Err(join_error) => {
                state.pending.clear();
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                warn!(%message, "evaluation worker failed");
                output.writeln(&format!("internal error: {message}"));
                return EvalOutcome::Internal(output.take());
            }
        };

        match evaluation {
            Ok(Evaluation::Incomplete) => EvalOutcome::Continue,
            Ok(Evaluation::Completed(value)) => {
                state.pending.clear();
                let mut text = output.take();
                if let Some(value) = value {
                    text.push_str(&format_value(Some(&value)));
                }
                EvalOutcome::Output(text)
            }
            Ok(Evaluation::Failed(error)) => {
                state.pending.clear();
                let mut text = output.take();
                text.push_str(&error);
                EvalOutcome::Failed(text)
            }
            Err(error) => {
                state.pending.clear();
                debug!(%error, "engine returned an error");
                let mut text = output.take();
                text.push_str(&error.to_string());
                EvalOutcome::Failed(text)
            }
        }
    }

    fn apply_timeout_policy(&self, state: &mut SessionState) {
        match self.config.timeout_policy {
            TimeoutPolicy::Discard => state.pending.clear(),
            // Back to the state before this chunk, so the caller can resend it.
            TimeoutPolicy::Preserve => {
                state.pending.pop();
            }
        }
    }
}

fn evaluate_on_worker(
    slot: &SharedEngineSlot,
    prelude: Option<&str>,
    source: &str,
    ctx: &EvalContext,
) -> EngineResult<Evaluation> {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    // Waited behind an abandoned worker past this request's deadline.
    ctx.checkpoint()?;

    if !slot.prelude_applied {
        if let Some(prelude) = prelude {
            match slot.session.evaluate(prelude, ctx) {
                Ok(Evaluation::Completed(_)) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Ok(other) => warn!(?other, "prelude did not complete"),
                Err(error) => warn!(%error, "prelude failed"),
            }
            ctx.output().clear();
        }
        slot.prelude_applied = true;
    }

    slot.session.evaluate(source, ctx)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "evaluation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::OutputCapture;
    use crate::engine::{EngineSession, MockEngineSession};
    use crate::value::Value;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Engine whose sessions are handed out from a queue of mocks.
    struct MockedEngine {
        prelude: Option<String>,
        sessions: Mutex<Vec<MockEngineSession>>,
    }

    impl Engine for MockedEngine {
        fn name(&self) -> &str {
            "mocked"
        }

        fn prelude(&self) -> Option<String> {
            self.prelude.clone()
        }

        fn new_session(&self) -> EngineResult<Box<dyn EngineSession>> {
            self.sessions
                .lock()
                .unwrap()
                .pop()
                .map(|mock| Box::new(mock) as Box<dyn EngineSession>)
                .ok_or_else(|| EngineError::Session("no mock left".to_string()))
        }
    }

    fn setup(mock: MockEngineSession, prelude: Option<&str>, config: SupervisorConfig) -> (Supervisor, Session) {
        let engine = Arc::new(MockedEngine {
            prelude: prelude.map(str::to_string),
            sessions: Mutex::new(vec![mock]),
        });
        let session = Session::new(
            "k".to_string(),
            engine.new_session().unwrap(),
            OutputCapture::new(1024),
        );
        (Supervisor::new(engine, config), session)
    }

    fn grace(ms: u64) -> SupervisorConfig {
        SupervisorConfig {
            cancel_grace: Duration::from_millis(ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completed_value_follows_output() {
        let mut mock = MockEngineSession::new();
        mock.expect_evaluate()
            .withf(|source, _| source == "1 + 1")
            .times(1)
            .returning(|_, ctx| {
                ctx.output().writeln("side effect");
                Ok(Evaluation::Completed(Some(Value::List(vec![Value::Int(2)]))))
            });
        let (supervisor, session) = setup(mock, None, SupervisorConfig::default());

        let outcome = supervisor.run(&session, "1 + 1", 0).await;
        assert_eq!(outcome, EvalOutcome::Output("side effect\n{ 2 }".to_string()));
        assert!(outcome.is_finished());
    }

    #[tokio::test]
    async fn test_incomplete_keeps_pending_until_completion() {
        let mut seq = Sequence::new();
        let mut mock = MockEngineSession::new();
        mock.expect_evaluate()
            .withf(|source, _| source == "if x {")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Evaluation::Incomplete));
        mock.expect_evaluate()
            .withf(|source, _| source == "if x {\n}")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Evaluation::Completed(None)));
        let (supervisor, session) = setup(mock, None, SupervisorConfig::default());

        assert_eq!(supervisor.run(&session, "if x {", 0).await, EvalOutcome::Continue);
        assert_eq!(session.lock_state().await.pending.len(), 1);
        assert_eq!(
            supervisor.run(&session, "}", 0).await,
            EvalOutcome::Output(String::new())
        );
        assert!(session.lock_state().await.pending.is_empty());
    }

    #[tokio::test]
    async fn test_failures_clear_pending() {
        let mut seq = Sequence::new();
        let mut mock = MockEngineSession::new();
        mock.expect_evaluate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, ctx| {
                ctx.output().write_str("partial ");
                Ok(Evaluation::Failed("error: boom".to_string()))
            });
        mock.expect_evaluate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(EngineError::Internal("backend crashed".to_string())));
        let (supervisor, session) = setup(mock, None, SupervisorConfig::default());

        assert_eq!(
            supervisor.run(&session, "a", 0).await,
            EvalOutcome::Failed("partial error: boom".to_string())
        );
        assert_eq!(
            supervisor.run(&session, "b", 0).await,
            EvalOutcome::Failed("backend crashed".to_string())
        );
        assert!(session.lock_state().await.pending.is_empty());
    }

    /// Panics on its first evaluation, then answers `true`.
    #[derive(Default)]
    struct PanicsOnce {
        calls: usize,
    }

    impl EngineSession for PanicsOnce {
        fn evaluate(&mut self, _source: &str, _ctx: &EvalContext) -> EngineResult<Evaluation> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("engine exploded");
            }
            Ok(Evaluation::Completed(Some(Value::Bool(true))))
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let engine: Arc<dyn Engine> = Arc::new(MockedEngine {
            prelude: None,
            sessions: Mutex::new(vec![]),
        });
        let supervisor = Supervisor::new(engine, SupervisorConfig::default());
        let session = Session::new(
            "k".to_string(),
            Box::new(PanicsOnce::default()),
            OutputCapture::new(1024),
        );

        let outcome = supervisor.run(&session, "x", 0).await;
        assert_eq!(
            outcome,
            EvalOutcome::Internal("internal error: engine exploded\n".to_string())
        );
        assert!(!outcome.is_finished());
        // The poisoned engine handle is still usable.
        assert_eq!(
            supervisor.run(&session, "y", 0).await,
            EvalOutcome::Output("true".to_string())
        );
    }

    #[tokio::test]
    async fn test_cooperative_timeout() {
        let mut mock = MockEngineSession::new();
        mock.expect_evaluate().times(1).returning(|_, ctx| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(EngineError::Cancelled)
        });
        let (supervisor, session) = setup(mock, None, grace(500));

        let started = Instant::now();
        let outcome = supervisor.run(&session, "loop", 50).await;
        let elapsed = started.elapsed();
        assert_eq!(outcome, EvalOutcome::TimedOut);
        assert_eq!(outcome.text(), TIMED_OUT_MARKER);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_uncooperative_worker_is_abandoned() {
        let mut seq = Sequence::new();
        let mut mock = MockEngineSession::new();
        mock.expect_evaluate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, ctx| {
                std::thread::sleep(Duration::from_millis(300));
                ctx.output().write_str("late output");
                Ok(Evaluation::Completed(None))
            });
        mock.expect_evaluate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Evaluation::Completed(Some(Value::Int(7)))));
        let (supervisor, session) = setup(mock, None, grace(20));

        assert_eq!(
            supervisor.run(&session, "stuck", 20).await,
            EvalOutcome::ProbablyTimedOut
        );
        // Waits for the abandoned worker, never sees its output.
        assert_eq!(
            supervisor.run(&session, "next", 0).await,
            EvalOutcome::Output("7".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_engine_is_free_skips_evaluation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockEngineSession::new();
        mock.expect_evaluate().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(Evaluation::Completed(None))
        });
        let (supervisor, session) = setup(mock, None, grace(150));

        // Cancelled at 10ms, still running when the grace period ends.
        assert_eq!(
            supervisor.run(&session, "slow", 10).await,
            EvalOutcome::ProbablyTimedOut
        );
        // Cancelled while queued behind the abandoned worker; gets the engine
        // within its grace period and gives up without evaluating.
        assert_eq!(
            supervisor.run(&session, "queued", 10).await,
            EvalOutcome::TimedOut
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_policies() {
        for (policy, expected) in [
            (TimeoutPolicy::Discard, Vec::<String>::new()),
            (TimeoutPolicy::Preserve, vec!["open".to_string()]),
        ] {
            let mut seq = Sequence::new();
            let mut mock = MockEngineSession::new();
            mock.expect_evaluate()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(Evaluation::Incomplete));
            mock.expect_evaluate()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, ctx| {
                    while !ctx.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    Err(EngineError::Cancelled)
                });
            let config = SupervisorConfig {
                timeout_policy: policy,
                ..grace(500)
            };
            let (supervisor, session) = setup(mock, None, config);

            assert_eq!(supervisor.run(&session, "open", 0).await, EvalOutcome::Continue);
            assert_eq!(supervisor.run(&session, "spin", 20).await, EvalOutcome::TimedOut);
            assert_eq!(session.lock_state().await.pending, expected, "{policy}");
        }
    }

    #[tokio::test]
    async fn test_prelude_runs_once_and_is_silent() {
        let mut seq = Sequence::new();
        let mut mock = MockEngineSession::new();
        mock.expect_evaluate()
            .withf(|source, _| source == "let setup = 1;")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, ctx| {
                ctx.output().writeln("prelude noise");
                Ok(Evaluation::Completed(None))
            });
        mock.expect_evaluate()
            .withf(|source, _| source != "let setup = 1;")
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Evaluation::Completed(Some(Value::Int(1)))));
        let (supervisor, session) = setup(mock, Some("let setup = 1;"), SupervisorConfig::default());

        assert_eq!(supervisor.run(&session, "a", 0).await, EvalOutcome::Output("1".to_string()));
        assert_eq!(supervisor.run(&session, "b", 0).await, EvalOutcome::Output("1".to_string()));
    }

    #[test]
    fn test_deadline_cap() {
        let engine: Arc<dyn Engine> = Arc::new(MockedEngine {
            prelude: None,
            sessions: Mutex::new(vec![]),
        });
        let uncapped = Supervisor::new(engine.clone(), SupervisorConfig::default());
        assert_eq!(uncapped.deadline(0), None);
        assert_eq!(uncapped.deadline(250), Some(Duration::from_millis(250)));

        let capped = Supervisor::new(
            engine,
            SupervisorConfig {
                timeout_cap: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        assert_eq!(capped.deadline(0), Some(Duration::from_secs(1)));
        assert_eq!(capped.deadline(5000), Some(Duration::from_secs(1)));
        assert_eq!(capped.deadline(10), Some(Duration::from_millis(10)));
    }
}
