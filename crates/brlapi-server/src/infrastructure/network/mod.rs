//! Network infrastructure: where clients connect and how their bytes flow.
//!
//! # Sub-modules
//!
//! - **`endpoint`** – Parses the `+`-separated host list (`:0+127.0.0.1:0`)
//!   into local-socket and TCP endpoints.
//!
//! - **`listener`** – Binds one endpoint, retrying while the address is busy,
//!   and runs its accept loop until shutdown.
//!
//! - **`session`** – Drives one client socket: feeds bytes through the packet
//!   framer into the dispatcher and writes queued replies back.
//!
//! - **`maintenance`** – Periodic bookkeeping that must run even when no
//!   socket is active, such as expiring clients that never authenticated.

pub mod endpoint;
pub mod listener;
pub mod maintenance;
pub mod session;

use std::path::PathBuf;

use thiserror::Error;

pub use endpoint::{parse_hosts, Endpoint};
pub use listener::serve_endpoint;
pub use session::run_session;

/// Errors raised while setting up listening sockets.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Binding failed with an error that retrying will not fix.
    #[error("cannot listen on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The local socket directory could not be prepared.
    #[error("cannot prepare socket directory {path}: {source}")]
    SocketDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// More endpoints were listed than the server serves.
    #[error("{count} endpoints given, at most {max} are supported")]
    TooManyEndpoints { count: usize, max: usize },

    /// An entry of the host list could not be parsed.
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    /// Local sockets are not available on this platform.
    #[error("local sockets are not supported on this platform")]
    LocalUnsupported,
}
