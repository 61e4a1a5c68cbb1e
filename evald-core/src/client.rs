//! Caller side of the wire protocol over a persistent Unix socket connection.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::{ClientCodec, Protocol, Request, Response};
use crate::config::CodecConfig;
use crate::error::{Error, InternalResult};

pub struct Client<S = UnixStream> {
    framed: Framed<S, ClientCodec>,
    protocol: Protocol,
}

impl Client<UnixStream> {
    pub async fn connect<P: AsRef<Path>>(path: P, protocol: Protocol) -> InternalResult<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        debug!(path = %path.display(), %protocol, "connected to daemon");
        Ok(Self::new(stream, protocol))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, protocol: Protocol) -> Self {
        Self::with_max_frame_len(stream, protocol, CodecConfig::default().max_frame_len)
    }

    pub fn with_max_frame_len(stream: S, protocol: Protocol, max_frame_len: usize) -> Self {
        Self {
            framed: Framed::new(stream, ClientCodec::new(protocol, max_frame_len)),
            protocol,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Sends one request and waits for its response.
    pub async fn send(&mut self, request: Request) -> InternalResult<Response> {
        self.framed.send(request).await?;
        match self.framed.next().await {
            Some(response) => Ok(response?),
            None => Err(Error::ConnectionClosed),
        }
    }

    pub async fn eval(
        &mut self,
        key: &str,
        code: &str,
        timeout_ms: u32,
    ) -> InternalResult<Response> {
        self.send(Request::new(timeout_ms, key, code)).await
    }
}
