//! Protocol module containing packet types, the binary codec, and the framer.

pub mod codec;
pub mod framer;
pub mod messages;

pub use codec::{encode_packet, Packet, ProtocolError};
pub use framer::{FrameStatus, FramerError, PacketFramer};
pub use messages::*;
