use thiserror::Error;

use crate::codec::FrameError;
use crate::config::ConfigError;
use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
