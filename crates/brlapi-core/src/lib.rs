//! # brlapi-core
//!
//! Shared library for the BrlAPI server containing the wire protocol codec,
//! the resumable packet framer, and the pure domain model used to arbitrate a
//! single braille display between many client applications.
//!
//! It has zero dependencies on sockets, threads, or the braille driver.
//!
//! # Architecture overview (for beginners)
//!
//! A braille display is a row of refreshable cells plus a handful of keys.
//! Several programs (a screen reader, an editor plugin, a terminal
//! multiplexer) may want to write to it at the same time.  The BrlAPI server
//! owns the real display and lets those programs ("clients") connect over a
//! socket.  Each client attaches itself to a virtual console ("tty"), and the
//! server decides which client's content is shown and which client receives
//! each key press by following the console focus.
//!
//! This crate (`brlapi-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the socket.  Every packet is an
//!   8-byte header (`size`, `type`) followed by a payload.  The framer turns
//!   a non-blocking byte stream into whole packets; the codec turns payloads
//!   into typed requests and builds responses.
//!
//! - **`domain`** – Pure data structures with no I/O: the range set used for
//!   key masking, the per-client braille window, the key/command constants,
//!   and the tree of virtual consoles.

pub mod domain;
pub mod protocol;

pub use domain::keys::DeliveryMode;
pub use domain::range_set::{RangeSet, RangeSetError};
pub use domain::tty_tree::{TtyId, TtyTree};
pub use domain::window::{BrailleWindow, DisplaySize};
pub use protocol::codec::{encode_packet, Packet, ProtocolError};
pub use protocol::framer::{FrameStatus, FramerError, PacketFramer};
pub use protocol::messages::{ErrorCode, PacketType};
