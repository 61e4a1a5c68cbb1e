//! # Session
//!
//! One persistent evaluation context per [`ContextKey`]. A session pairs the
//! engine's per-key state with the source lines still waiting for their
//! statement to be completed.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use crate::capture::OutputCapture;
use crate::engine::EngineSession;

pub type ContextKey = String;

/// Request-scoped state, guarded for the full duration of one request.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Lines accepted so far for a statement that is not yet complete.
    pub pending: Vec<String>,
}

impl SessionState {
    pub fn pending_source(&self) -> String {
        self.pending.join("\n")
    }
}

/// The engine half of a session. Locked by the worker thread that evaluates.
pub struct EngineSlot {
    pub session: Box<dyn EngineSession>,
    pub prelude_applied: bool,
}

impl std::fmt::Debug for EngineSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSlot")
            .field("prelude_applied", &self.prelude_applied)
            .finish_non_exhaustive()
    }
}

pub type SharedEngineSlot = Arc<Mutex<EngineSlot>>;

#[derive(Debug)]
pub struct Session {
    key: ContextKey,
    state: AsyncMutex<SessionState>,
    engine: SharedEngineSlot,
    capture: OutputCapture,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

impl Session {
    pub fn new(key: ContextKey, engine: Box<dyn EngineSession>, capture: OutputCapture) -> Self {
        let now = Instant::now();
        Self {
            key,
            state: AsyncMutex::new(SessionState::default()),
            engine: Arc::new(Mutex::new(EngineSlot {
                session: engine,
                prelude_applied: false,
            })),
            capture,
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capture(&self) -> &OutputCapture {
        &self.capture
    }

    pub fn engine_slot(&self) -> SharedEngineSlot {
        self.engine.clone()
    }

    /// Waits for exclusive use of the session. Waiters are served in the
    /// order they called this.
    pub async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// A session is busy while a request holds its state.
    pub fn is_busy(&self) -> bool {
        self.state.try_lock().is_err()
    }

    fn last_used_guard(&self) -> MutexGuard<'_, Instant> {
        self.last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn touch(&self) {
        *self.last_used_guard() = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used_guard()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngineSession;

    fn session() -> Session {
        Session::new(
            "chan".to_string(),
            Box::new(MockEngineSession::new()),
            OutputCapture::new(64),
        )
    }

    #[tokio::test]
    async fn test_busy_while_state_is_held() {
        let session = session();
        assert!(!session.is_busy());
        {
            let mut state = session.lock_state().await;
            state.pending.push("if x {".to_string());
            state.pending.push("1 }".to_string());
            assert_eq!(state.pending_source(), "if x {\n1 }");
            assert!(session.is_busy());
        }
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_touch_resets_idle_time() {
        let session = session();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.idle_for() >= Duration::from_millis(20));
        session.touch();
        assert!(session.idle_for() < Duration::from_millis(20));
        assert!(session.age() >= Duration::from_millis(20));
        assert_eq!(session.key(), "chan");
    }
}
