//! Application layer: the BrlAPI server's use cases.
//!
//! # What lives here? (for beginners)
//!
//! This layer owns the server's shared state and every decision the server
//! makes: who may connect, what each request does, whose window is shown and
//! who receives a key.  It talks to the outside world only through the
//! driver and host-console traits from `infrastructure::driver` and through
//! each connection's outbox, so it can be tested without sockets or hardware.
//!
//! # Sub-modules
//!
//! - **`server`** – The shared context: connection registry, tty tree, raw
//!   owner and driver, plus connection accept/disconnect and expiry.
//!
//! - **`dispatch`** – Handles one decoded packet: authentication first, then
//!   tty, write, key-mask and raw-mode requests.
//!
//! - **`arbitration`** – Walks the focus path to find the display owner and
//!   the recipient of each key.
//!
//! - **`output`** – The per-cycle hook the host pipeline calls, and the
//!   [`output::ApiDriver`] decorator it calls it through.

pub mod arbitration;
pub mod dispatch;
pub mod output;
pub mod server;

pub use dispatch::Disposition;
pub use output::ApiDriver;
pub use server::{AcceptError, BrlapiServer, ConnectionId, ServerSettings};
