//! Domain layer: pure data structures shared by the server.
//!
//! # What is the "domain"? (for beginners)
//!
//! The domain is the set of rules that would stay the same no matter how the
//! server talked to the outside world.  Nothing in here opens a socket, spawns
//! a thread, or talks to a braille driver, which is why every type in this
//! module can be tested with plain `#[test]` functions.
//!
//! # Sub-modules
//!
//! - **`range_set`** – A sorted list of disjoint integer intervals.  Each
//!   client keeps one to record which key codes or commands it wants.
//!
//! - **`keys`** – Command and key-code constants, the two delivery modes, and
//!   the default set of commands a new client receives.
//!
//! - **`window`** – The private braille window each client writes into, and
//!   how it is rendered to dot patterns for the real display.
//!
//! - **`tty_tree`** – The tree of virtual consoles.  Nodes are stored in an
//!   arena and addressed by [`tty_tree::TtyId`] handles, so parent links and
//!   client links never form reference cycles.

pub mod keys;
pub mod range_set;
pub mod tty_tree;
pub mod window;
