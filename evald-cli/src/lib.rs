//! Command line client for the evald daemon.
//!
//! [`read_code`] collects a program for one-shot evaluation and [`Repl`]
//! drives an interactive session over a persistent connection.

use std::path::Path;

use evald_core::client::Client;
use evald_core::codec::Response;
use evald_core::supervisor::CONTINUE_MARKER;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const PROMPT: &str = "> ";
pub const CONTINUE_PROMPT: &str = "... ";

#[derive(Error, Debug)]
pub enum CliError {
    #[error("daemon request failed: {0}")]
    Daemon(#[from] evald_core::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no code given")]
    NoCode,
}

pub type CliResult<T> = Result<T, CliError>;

/// Takes code from the argument, then the file, then all of `stdin`.
pub async fn read_code<R>(code: Option<String>, file: Option<&Path>, mut stdin: R) -> CliResult<String>
where
    R: AsyncRead + Unpin,
{
    if let Some(code) = code {
        return Ok(code);
    }
    if let Some(path) = file {
        return Ok(tokio::fs::read_to_string(path).await?);
    }
    let mut buf = String::new();
    stdin.read_to_string(&mut buf).await?;
    if buf.trim().is_empty() {
        return Err(CliError::NoCode);
    }
    Ok(buf)
}

/// Text as it should appear on a terminal.
pub fn display_text(response: &Response) -> String {
    let mut text = response.text.clone();
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

pub fn is_continuation(response: &Response) -> bool {
    response.text == CONTINUE_MARKER
}

/// Line oriented session bound to one context key.
pub struct Repl<S> {
    client: Client<S>,
    key: String,
    timeout_ms: u32,
}

impl<S> Repl<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: Client<S>, key: impl Into<String>, timeout_ms: u32) -> Self {
        Self {
            client,
            key: key.into(),
            timeout_ms,
        }
    }

    /// Sends every input line as one chunk until `input` ends.
    ///
    /// The continuation marker is not echoed; it only switches the prompt.
    pub async fn run<I, O>(&mut self, input: I, output: &mut O) -> CliResult<()>
    where
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut prompt = PROMPT;
        loop {
            output.write_all(prompt.as_bytes()).await?;
            output.flush().await?;

            let Some(line) = lines.next_line().await? else {
                output.write_all(b"\n").await?;
                output.flush().await?;
                return Ok(());
            };

            let response = self.client.eval(&self.key, &line, self.timeout_ms).await?;
            if is_continuation(&response) {
                debug!(key = %self.key, "input incomplete");
                prompt = CONTINUE_PROMPT;
                continue;
            }
            prompt = PROMPT;
            output.write_all(display_text(&response).as_bytes()).await?;
        }
    }
}
