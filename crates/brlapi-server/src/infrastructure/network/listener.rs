//! Listening sockets: bind with retry, then accept until shutdown.
//!
//! Each endpoint runs in its own task.  Binding is retried while the address
//! is busy, not yet configured, or on a read-only file system that may be
//! remounted later; any other bind error ends the task.
//!
//! The accept loop wakes every 200 ms to check the shared `running` flag,
//! and spawns one task per accepted client.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::endpoint::Endpoint;
use super::session::run_session;
use super::NetworkError;
use crate::application::server::BrlapiServer;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// `EROFS` on Linux and the BSDs.
const READ_ONLY_FS: i32 = 30;

/// Whether a bind error may go away by itself.
pub fn is_transient_bind_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
    ) || e.raw_os_error() == Some(READ_ONLY_FS)
}

/// A bound listening socket.
pub enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Local {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl BoundListener {
    /// Binds `endpoint` once.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error wrapped in [`NetworkError`].
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, NetworkError> {
        match endpoint {
            Endpoint::Tcp { host, port } => TcpListener::bind((host.as_str(), *port))
                .await
                .map(BoundListener::Tcp)
                .map_err(|source| NetworkError::BindFailed {
                    addr: endpoint.to_string(),
                    source,
                }),
            Endpoint::Local { path } => bind_local(path),
        }
    }

    /// Binds `endpoint`, retrying transient failures every `retry` until it
    /// succeeds or `running` is cleared.  Returns `Ok(None)` on shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient bind error.
    pub async fn bind_with_retry(
        endpoint: &Endpoint,
        retry: Duration,
        running: &AtomicBool,
    ) -> Result<Option<Self>, NetworkError> {
        let mut warned = false;
        while running.load(Ordering::Relaxed) {
            match Self::bind(endpoint).await {
                Ok(listener) => return Ok(Some(listener)),
                Err(NetworkError::BindFailed { source, .. }) if is_transient_bind_error(&source) => {
                    if !warned {
                        warn!(%endpoint, "cannot bind yet, retrying: {source}");
                        warned = true;
                    }
                    sleep(retry).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Removes the socket file of a local listener.
    pub fn cleanup(&self) {
        match self {
            BoundListener::Tcp(_) => {}
            #[cfg(unix)]
            BoundListener::Local { path, .. } => {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("cannot remove {}: {e}", path.display());
                }
            }
        }
    }
}

#[cfg(unix)]
fn bind_local(path: &Path) -> Result<BoundListener, NetworkError> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o1777)
                .create(dir)
                .map_err(|source| NetworkError::SocketDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
    }
    // A socket file left behind by a previous run blocks the bind.
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    let listener =
        tokio::net::UnixListener::bind(path).map_err(|source| NetworkError::BindFailed {
            addr: path.display().to_string(),
            source,
        })?;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
        warn!("cannot open up {}: {e}", path.display());
    }
    Ok(BoundListener::Local {
        listener,
        path: path.to_path_buf(),
    })
}

#[cfg(not(unix))]
fn bind_local(_path: &Path) -> Result<BoundListener, NetworkError> {
    Err(NetworkError::LocalUnsupported)
}

/// Binds one endpoint and serves clients on it until `running` is cleared.
///
/// # Errors
///
/// Returns a bind error that retrying cannot fix.
pub async fn serve_endpoint(
    server: Arc<BrlapiServer>,
    endpoint: Endpoint,
    retry: Duration,
    running: Arc<AtomicBool>,
) -> Result<(), NetworkError> {
    let Some(listener) = BoundListener::bind_with_retry(&endpoint, retry, &running).await? else {
        return Ok(());
    };
    info!(%endpoint, "listening for BrlAPI clients");

    while running.load(Ordering::Relaxed) {
        match &listener {
            BoundListener::Tcp(tcp) => match timeout(ACCEPT_POLL, tcp.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    let server = Arc::clone(&server);
                    tokio::spawn(run_session(server, reader, writer, peer.to_string()));
                }
                Ok(Err(e)) => error!(%endpoint, "accept error: {e}"),
                Err(_) => {}
            },
            #[cfg(unix)]
            BoundListener::Local { listener: unix, .. } => {
                match timeout(ACCEPT_POLL, unix.accept()).await {
                    Ok(Ok((stream, _))) => {
                        let (reader, writer) = stream.into_split();
                        let server = Arc::clone(&server);
                        let peer = format!("local:{endpoint}");
                        tokio::spawn(run_session(server, reader, writer, peer));
                    }
                    Ok(Err(e)) => error!(%endpoint, "accept error: {e}"),
                    Err(_) => {}
                }
            }
        }
    }

    listener.cleanup();
    info!(%endpoint, "stopped listening");
    Ok(())
}
