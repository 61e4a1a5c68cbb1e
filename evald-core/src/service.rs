//! # Eval Service
//!
//! The request handler shared by every transport: maps one decoded
//! [`Request`] to exactly one [`Response`].

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::capture::OutputCapture;
use crate::codec::{Protocol, Request, Response};
use crate::config::DaemonConfig;
use crate::engine::{Engine, build_engine};
use crate::registry::SessionRegistry;
use crate::supervisor::{EvalOutcome, Supervisor};

/// Session key used for every request of the legacy protocol.
pub const LEGACY_KEY: &str = "";

#[derive(Debug, Clone)]
pub struct EvalService {
    protocol: Protocol,
    registry: SessionRegistry,
    supervisor: Arc<Supervisor>,
}

impl EvalService {
    pub fn new(engine: Arc<dyn Engine>, config: &DaemonConfig) -> Self {
        let capture = OutputCapture::new(config.supervisor.max_output_bytes);
        Self {
            protocol: config.protocol,
            registry: SessionRegistry::new(engine.clone(), capture, config.registry.clone()),
            supervisor: Arc::new(Supervisor::new(engine, config.supervisor.clone())),
        }
    }

    /// Builds the service with the engine named in the configuration.
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(build_engine(&config.engine), config)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    #[instrument(level = "debug", skip(self, request), fields(key = %request.key, timeout_ms = request.timeout_ms))]
    pub async fn handle(&self, request: Request) -> Response {
        if request.code.trim().is_empty() {
            debug!("empty request");
            return Response::success(String::new());
        }

        let key = match self.protocol {
            Protocol::Keyed => request.key.as_str(),
            Protocol::Legacy => LEGACY_KEY,
        };
        let session = match self.registry.get_or_create(key) {
            Ok(session) => session,
            Err(error) => {
                warn!(%error, "could not create session");
                return Response::failure(format!("internal error: {error}"));
            }
        };

        let outcome = self
            .supervisor
            .run(&session, &request.code, request.timeout_ms)
            .await;
        debug!(?outcome, "request finished");
        response_for(outcome)
    }
}

fn response_for(outcome: EvalOutcome) -> Response {
    if outcome.is_finished() {
        Response::success(outcome.into_text())
    } else {
        Response::failure(outcome.into_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::supervisor::{CONTINUE_MARKER, TIMED_OUT_MARKER};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn service(protocol: Protocol) -> EvalService {
        EvalService::from_config(&DaemonConfig {
            protocol,
            supervisor: SupervisorConfig {
                cancel_grace: Duration::from_millis(500),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_empty_request_skips_registry() {
        let service = service(Protocol::Keyed);
        for code in ["", "   ", "\n\t "] {
            let response = service.handle(Request::new(0, "k", code)).await;
            assert_eq!(response, Response::success(""));
        }
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_keyed_sessions_are_isolated() {
        let service = service(Protocol::Keyed);
        service.handle(Request::new(0, "a", "let x = 1;")).await;
        service.handle(Request::new(0, "b", "let x = 2;")).await;

        assert_eq!(service.handle(Request::new(0, "a", "x")).await.text, "1");
        assert_eq!(service.handle(Request::new(0, "b", "x")).await.text, "2");
        assert_eq!(service.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_legacy_uses_one_session() {
        let service = service(Protocol::Legacy);
        service.handle(Request::new(0, "ignored", "let y = 5;")).await;
        let response = service.handle(Request::new(0, "other", "y * 2")).await;
        assert_eq!(response, Response::success("10"));
        assert_eq!(service.registry().keys(), vec![LEGACY_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_success_flags() {
        let service = service(Protocol::Legacy);
        let cases = [
            ("print(\"hi\")", true, "hi\n"),
            ("missing", true, "error: undefined variable `missing`"),
            ("if true {", false, CONTINUE_MARKER),
            ("}", true, ""),
        ];
        for (code, success, text) in cases {
            let response = service.handle(Request::new(0, "", code)).await;
            assert_eq!(response, Response { success, text: text.to_string() }, "{code}");
        }

        let response = service.handle(Request::new(30, "", "while true { }")).await;
        assert_eq!(response, Response::failure(TIMED_OUT_MARKER));
    }
}
