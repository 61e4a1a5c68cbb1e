//! evald daemon
//!
//! Serves an [`evald_core::EvalService`] over a Unix socket, an inherited
//! listening descriptor, or stdin/stdout.

pub mod dispatcher;
pub mod listener;
pub mod server;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub use server::{ServerConfig, Transport, start_server};

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// `default_level`. Logs go to stderr so stdout stays free for frames.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
