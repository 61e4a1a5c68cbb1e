use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use evald_core::DaemonConfig;
use evald_core::codec::Protocol;
use evald_core::config::TimeoutPolicy;
use evald_server::{ServerConfig, Transport, init_logging, start_server};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Persistent multi-session evaluation daemon
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Unix socket path to listen on
    #[arg(short, long, env = "EVALD_SOCKET", default_value = "/tmp/evald.sock")]
    socket: PathBuf,

    /// Listen on an inherited socket descriptor instead of binding `--socket`
    #[arg(long)]
    listen_fd: Option<RawFd>,

    /// Serve one connection over stdin/stdout and exit at end of input.
    /// Takes precedence over the other transports
    #[arg(long)]
    stdio: bool,

    /// Path to a JSON configuration file
    #[arg(short, long, env = "EVALD_CONFIG")]
    config: Option<PathBuf>,

    /// Wire protocol (keyed, legacy); overrides the configuration file
    #[arg(short, long)]
    protocol: Option<Protocol>,

    /// What to do with pending source on timeout (discard, preserve)
    #[arg(long)]
    timeout_policy: Option<TimeoutPolicy>,

    /// Upper bound for every request's deadline, in milliseconds
    #[arg(long)]
    timeout_cap_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn transport(&self) -> Transport {
        if self.stdio {
            Transport::Stdio
        } else if let Some(fd) = self.listen_fd {
            Transport::ListenFd(fd)
        } else {
            Transport::Socket(self.socket.clone())
        }
    }

    fn daemon_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(policy) = self.timeout_policy {
            config.supervisor.timeout_policy = policy;
        }
        if let Some(cap) = self.timeout_cap_ms {
            config.supervisor.timeout_cap = Some(Duration::from_millis(cap));
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = ServerConfig {
        transport: cli.transport(),
        daemon: cli.daemon_config()?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let shutdown = CancellationToken::new();
    let result = runtime.block_on(async {
        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(err) => warn!(%err, "could not listen for interrupts"),
            }
            signal.cancel();
        });
        start_server(config, shutdown).await
    });

    // Abandoned evaluation workers must not keep the process alive.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}
