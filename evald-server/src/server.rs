use std::os::fd::RawFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use evald_core::{DaemonConfig, EvalService};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::listener::{Stdio, UnixAcceptor};

/// Where the daemon takes its connections from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Bind a Unix socket at this path.
    Socket(PathBuf),
    /// Listen on a socket inherited from the parent process.
    ListenFd(RawFd),
    /// Serve a single persistent connection over stdin/stdout.
    Stdio,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Socket(path) => write!(f, "socket {}", path.display()),
            Transport::ListenFd(fd) => write!(f, "fd {fd}"),
            Transport::Stdio => f.write_str("stdio"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: Transport,
    pub daemon: DaemonConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Socket(PathBuf::from("/tmp/evald.sock")),
            daemon: DaemonConfig::default(),
        }
    }
}

/// Runs the daemon until `shutdown` is cancelled, or until stdin closes for
/// the stdio transport.
pub async fn start_server(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    config.daemon.validate().context("invalid daemon configuration")?;

    let service = EvalService::from_config(&config.daemon);
    let sweeper = service.registry().spawn_sweeper();
    let dispatcher = Dispatcher::new(service, config.daemon.codec.max_frame_len);
    info!(
        transport = %config.transport,
        protocol = %config.daemon.protocol,
        engine = dispatcher.service().supervisor().engine().name(),
        "starting evald"
    );

    match &config.transport {
        Transport::Stdio => {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                served = dispatcher.serve_connection(Stdio::new()) => {
                    served.context("stdio connection failed")?;
                }
            }
            info!("stdin closed, exiting");
        }
        Transport::Socket(path) => {
            let acceptor = UnixAcceptor::bind(path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            dispatcher.run(acceptor, shutdown).await;
        }
        Transport::ListenFd(fd) => {
            // SAFETY: the fd was handed to us on the command line and is not
            // otherwise used by this process.
            let acceptor = unsafe { UnixAcceptor::from_raw_fd(*fd) }
                .with_context(|| format!("failed to adopt listening fd {fd}"))?;
            dispatcher.run(acceptor, shutdown).await;
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}
