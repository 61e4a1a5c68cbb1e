//! # Connection Dispatcher
//!
//! Accepts connections and runs one task per connection. Each connection is a
//! persistent stream of request/response pairs; requests on one connection
//! are answered in order.

use evald_core::codec::{FrameError, ServerCodec};
use evald_core::error::{Error, InternalResult};
use evald_core::EvalService;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::listener::Acceptor;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    service: EvalService,
    max_frame_len: usize,
}

impl Dispatcher {
    pub fn new(service: EvalService, max_frame_len: usize) -> Self {
        Self {
            service,
            max_frame_len,
        }
    }

    pub fn service(&self) -> &EvalService {
        &self.service
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn run<A: Acceptor>(&self, mut acceptor: A, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("dispatcher shutting down");
                    return;
                }
                accepted = acceptor.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Transient failures such as running out of descriptors.
                    error!(%err, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };

            let connection_id = uuid::Uuid::new_v4().to_string();
            let span = info_span!("connection", id = %connection_id, %peer);
            let dispatcher = self.clone();
            tokio::spawn(
                async move {
                    debug!("connection accepted");
                    if let Err(err) = dispatcher.serve_connection(stream).await {
                        warn!(%err, "connection closed with error");
                    } else {
                        debug!("connection closed");
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Serves one connection until the peer closes it or sends a bad frame.
    pub async fn serve_connection<S>(&self, stream: S) -> InternalResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let codec = ServerCodec::new(self.service.protocol(), self.max_frame_len);
        let mut framed = Framed::new(stream, codec);

        while let Some(frame) = framed.next().await {
            let request = match frame {
                Ok(request) => request,
                Err(FrameError::Io(err)) => return Err(Error::Io(err)),
                Err(err) => {
                    // Malformed input gets no response.
                    return Err(Error::Frame(err));
                }
            };
            let response = self.service.handle(request).await;
            framed.send(response).await?;
        }
        Ok(())
    }
}
