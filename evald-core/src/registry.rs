//! # Session Registry
//!
//! Sole owner of the key → [`Session`] map. Sessions are created lazily on
//! first use and, unless eviction is configured, live as long as the daemon.
//!
//! Eviction (both off by default):
//! - `max_sessions`: creating a session beyond the cap drops the least
//!   recently used idle session.
//! - `idle_ttl`: a background sweeper drops sessions unused for that long.
//!
//! A session that is referenced outside the registry (a request holds it) is
//! never evicted.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::capture::OutputCapture;
use crate::config::RegistryConfig;
use crate::engine::{Engine, EngineResult};
use crate::session::{ContextKey, Session};

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<ContextKey, Arc<Session>>>,
    engine: Arc<dyn Engine>,
    capture: OutputCapture,
    config: RegistryConfig,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("engine", &self.engine.name())
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}

fn is_idle(session: &Arc<Session>) -> bool {
    Arc::strong_count(session) == 1 && !session.is_busy()
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn Engine>, capture: OutputCapture, config: RegistryConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            engine,
            capture,
            config,
        }
    }

    /// Returns the session for `key`, creating it on first use. Concurrent
    /// callers for the same key always get the same session.
    #[instrument(level = "debug", skip(self))]
    pub fn get_or_create(&self, key: &str) -> EngineResult<Arc<Session>> {
        let (session, created) = match self.sessions.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let engine_session = self.engine.new_session()?;
                let session = Arc::new(Session::new(
                    key.to_string(),
                    engine_session,
                    self.capture,
                ));
                entry.insert(session.clone());
                info!(key, engine = self.engine.name(), "created session");
                (session, true)
            }
        };
        session.touch();

        if created {
            self.enforce_capacity();
        }
        Ok(session)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.sessions.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn keys(&self) -> Vec<ContextKey> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn enforce_capacity(&self) {
        let Some(max_sessions) = self.config.max_sessions else {
            return;
        };

        while self.sessions.len() > max_sessions {
            let oldest = self
                .sessions
                .iter()
                .filter(|entry| is_idle(entry.value()))
                .min_by_key(|entry| entry.value().last_used())
                .map(|entry| entry.key().clone());

            let Some(key) = oldest else {
                debug!(max_sessions, "no idle session to evict");
                return;
            };
            if self
                .sessions
                .remove_if(&key, |_, session| is_idle(session))
                .is_some()
            {
                info!(key = %key, max_sessions, "evicted least recently used session");
            }
        }
    }

    /// Drops sessions idle for longer than `idle_ttl`. Returns how many went.
    pub fn sweep_idle(&self) -> usize {
        let Some(ttl) = self.config.idle_ttl else {
            return 0;
        };

        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !is_idle(session) || session.idle_for() < ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(removed, ttl_ms = ttl.as_millis() as u64, "swept idle sessions");
        }
        removed
    }

    /// Starts the periodic idle sweeper when `idle_ttl` is configured.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        self.config.idle_ttl?;
        let registry = self.clone();
        let period = self.config.sweep_interval;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep_idle();
            }
        }))
    }
}
