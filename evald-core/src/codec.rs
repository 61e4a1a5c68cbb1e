//! # Framing Codec
//!
//! Byte layouts of the two wire-protocol variants. All integers are
//! little-endian `u32`.
//!
//! ```text
//! keyed request   timeout | key_len | code_len | key | code
//! keyed response  len | text
//!
//! legacy request  timeout | code_len | code
//! legacy response success(u8) | len | text
//! ```
//!
//! The pure functions ([`decode_request`], [`decode_response`]) take an
//! immutable buffer and report `Ok(None)` while a frame is still incomplete,
//! so they never fail on short reads. [`ServerCodec`] and [`ClientCodec`]
//! adapt them to `tokio_util::codec` for stream transports.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const U32_LEN: usize = 4;

/// Wire-protocol variant spoken on a connection.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    /// Multi-session: requests carry a context key, responses carry text only.
    #[default]
    Keyed,
    /// Single-session: no context key, responses carry a success flag.
    Legacy,
}

impl Protocol {
    fn request_header_len(self) -> usize {
        match self {
            Protocol::Keyed => 3 * U32_LEN,
            Protocol::Legacy => 2 * U32_LEN,
        }
    }

    fn response_header_len(self) -> usize {
        match self {
            Protocol::Keyed => U32_LEN,
            Protocol::Legacy => 1 + U32_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    /// Deadline in milliseconds, `0` means no deadline.
    pub timeout_ms: u32,
    /// Context key; always empty on the legacy protocol.
    pub key: String,
    pub code: String,
}

impl Request {
    pub fn new(timeout_ms: u32, key: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            timeout_ms,
            key: key.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Only transmitted on the legacy protocol.
    pub success: bool,
    pub text: String,
}

impl Response {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Frame too large: declared {declared} bytes, limit {limit}")]
    TooLarge { declared: usize, limit: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FrameResult<T> = Result<T, FrameError>;

/// Decodes one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or `None` when
/// `buf` does not yet hold a whole frame.
pub fn decode_request(
    buf: &[u8],
    protocol: Protocol,
    max_frame_len: usize,
) -> FrameResult<Option<(Request, usize)>> {
    let header_len = protocol.request_header_len();
    if buf.len() < header_len {
        return Ok(None);
    }

    let mut header = &buf[..header_len];
    let timeout_ms = header.get_u32_le();
    let key_len = match protocol {
        Protocol::Keyed => header.get_u32_le() as usize,
        Protocol::Legacy => 0,
    };
    let code_len = header.get_u32_le() as usize;

    let declared = key_len
        .checked_add(code_len)
        .ok_or_else(|| FrameError::Malformed("payload length overflow".to_string()))?;
    if declared > max_frame_len {
        return Err(FrameError::TooLarge {
            declared,
            limit: max_frame_len,
        });
    }

    let total = header_len + declared;
    if buf.len() < total {
        return Ok(None);
    }

    let key_end = header_len + key_len;
    let key = String::from_utf8_lossy(&buf[header_len..key_end]).into_owned();
    let code = String::from_utf8_lossy(&buf[key_end..total]).into_owned();

    Ok(Some((
        Request {
            timeout_ms,
            key,
            code,
        },
        total,
    )))
}

pub fn encode_request(request: &Request, protocol: Protocol, dst: &mut BytesMut) {
    let key = request.key.as_bytes();
    let code = request.code.as_bytes();
    match protocol {
        Protocol::Keyed => {
            dst.reserve(protocol.request_header_len() + key.len() + code.len());
            dst.put_u32_le(request.timeout_ms);
            dst.put_u32_le(key.len() as u32);
            dst.put_u32_le(code.len() as u32);
            dst.put_slice(key);
            dst.put_slice(code);
        }
        Protocol::Legacy => {
            dst.reserve(protocol.request_header_len() + code.len());
            dst.put_u32_le(request.timeout_ms);
            dst.put_u32_le(code.len() as u32);
            dst.put_slice(code);
        }
    }
}

pub fn encode_response(response: &Response, protocol: Protocol, dst: &mut BytesMut) {
    let text = response.text.as_bytes();
    dst.reserve(protocol.response_header_len() + text.len());
    if protocol == Protocol::Legacy {
        dst.put_u8(u8::from(response.success));
    }
    dst.put_u32_le(text.len() as u32);
    dst.put_slice(text);
}

/// Decodes one response from the front of `buf`. Keyed responses carry no
/// flag and decode as successful.
pub fn decode_response(
    buf: &[u8],
    protocol: Protocol,
    max_frame_len: usize,
) -> FrameResult<Option<(Response, usize)>> {
    let header_len = protocol.response_header_len();
    if buf.len() < header_len {
        return Ok(None);
    }

    let mut header = &buf[..header_len];
    let success = match protocol {
        Protocol::Keyed => true,
        Protocol::Legacy => match header.get_u8() {
            0 => false,
            1 => true,
            flag => {
                return Err(FrameError::Malformed(format!(
                    "unexpected success flag {flag}"
                )));
            }
        },
    };
    let len = header.get_u32_le() as usize;
    if len > max_frame_len {
        return Err(FrameError::TooLarge {
            declared: len,
            limit: max_frame_len,
        });
    }

    let total = header_len + len;
    if buf.len() < total {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf[header_len..total]).into_owned();
    Ok(Some((Response { success, text }, total)))
}

/// Daemon side: decodes requests, encodes responses.
#[derive(Debug, Clone, Copy)]
pub struct ServerCodec {
    protocol: Protocol,
    max_frame_len: usize,
}

impl ServerCodec {
    pub fn new(protocol: Protocol, max_frame_len: usize) -> Self {
        Self {
            protocol,
            max_frame_len,
        }
    }
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> FrameResult<Option<Request>> {
        match decode_request(src, self.protocol, self.max_frame_len)? {
            Some((request, consumed)) => {
                src.advance(consumed);
                Ok(Some(request))
            }
            None => {
                src.reserve(self.protocol.request_header_len());
                Ok(None)
            }
        }
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> FrameResult<()> {
        encode_response(&item, self.protocol, dst);
        Ok(())
    }
}

/// Caller side: encodes requests, decodes responses.
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    protocol: Protocol,
    max_frame_len: usize,
}

impl ClientCodec {
    pub fn new(protocol: Protocol, max_frame_len: usize) -> Self {
        Self {
            protocol,
            max_frame_len,
        }
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> FrameResult<Option<Response>> {
        match decode_response(src, self.protocol, self.max_frame_len)? {
            Some((response, consumed)) => {
                src.advance(consumed);
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> FrameResult<()> {
        encode_request(&item, self.protocol, dst);
        Ok(())
    }
}
