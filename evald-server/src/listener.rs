//! Listening endpoints the daemon can serve from.

use std::fs;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Source of incoming connections.
#[async_trait]
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Waits for the next connection and a label describing its peer.
    async fn accept(&mut self) -> io::Result<(Self::Stream, String)>;
}

/// A Unix domain socket listener, optionally owning its socket file.
#[derive(Debug)]
pub struct UnixAcceptor {
    listener: UnixListener,
    path: Option<PathBuf>,
}

impl UnixAcceptor {
    /// Binds `path`, replacing a stale socket file, and opens it to every
    /// local user.
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
        info!(path = %path.display(), "listening on unix socket");
        Ok(Self {
            listener,
            path: Some(path.to_path_buf()),
        })
    }

    /// Adopts an already listening socket inherited from the parent process.
    ///
    /// # Safety
    ///
    /// `fd` must be an open, listening Unix stream socket that nothing else
    /// in this process owns.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: ownership of `fd` is transferred by the caller.
        let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;
        info!(fd, "listening on inherited socket");
        Ok(Self {
            listener,
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), %err, "could not remove socket file");
            }
        }
    }
}

#[async_trait]
impl Acceptor for UnixAcceptor {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<(UnixStream, String)> {
        let (stream, addr) = self.listener.accept().await?;
        let peer = addr
            .as_pathname()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        Ok((stream, peer))
    }
}

/// The process's stdin and stdout joined into one duplex stream.
#[derive(Debug)]
pub struct Stdio {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
}

impl Stdio {
    pub fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for Stdio {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRead for Stdio {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stdio {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}
