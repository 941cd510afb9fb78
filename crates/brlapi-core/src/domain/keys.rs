//! Key delivery modes, command constants, and the default unmask policy.
//!
//! A driver reports key presses either as device-specific *keycodes* or as
//! generic *commands*.  A command is a 32-bit value laid out as
//! `[flags:8][block:8][argument:8]` in its low 24 bits: plain commands have a
//! zero block, while block commands such as "switch to console N" put N in
//! the argument byte.

use crate::domain::range_set::{RangeSet, RangeSetError};

/// Argument byte of a block command.
pub const ARG_MASK: u32 = 0x0000_00FF;
/// Block selector of a block command.
pub const BLOCK_MASK: u32 = 0x0000_FF00;
/// Modifier flags carried above the block.
pub const FLAG_MASK: u32 = 0x00FF_0000;
/// Part of a command that identifies it, flags stripped.
pub const COMMAND_MASK: u32 = BLOCK_MASK | ARG_MASK;
/// Largest keycode or command value a client can be sent by default.
pub const KEYCODE_MAX: u32 = 0xFFFF;

/// Plain commands referenced by the server.
pub mod command {
    pub const NOOP: u32 = 0;
    pub const SWITCHVT_PREV: u32 = 63;
    pub const SWITCHVT_NEXT: u32 = 64;
    pub const CSRJMP_VERT: u32 = 65;
    pub const PASTE: u32 = 66;
    pub const RESTARTBRL: u32 = 67;
    pub const RESTARTSPEECH: u32 = 68;
    /// Block command: switch to the console in the argument byte.
    pub const BLOCK_SWITCHVT: u32 = 0x0600;
}

/// How a connection wants key events delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Generic driver-independent commands.
    Commands,
    /// Raw device keycodes of the active driver.
    Keycodes,
}

impl DeliveryMode {
    /// Chooses the delivery mode named in a GetTty request.
    ///
    /// An empty name asks for commands.  The active driver's own name asks
    /// for its keycodes, which only works if the driver can report them.
    pub fn from_request(name: &str, driver_name: &str, driver_has_keycodes: bool) -> Option<Self> {
        if name.is_empty() {
            Some(DeliveryMode::Commands)
        } else if driver_has_keycodes && name == driver_name {
            Some(DeliveryMode::Keycodes)
        } else {
            None
        }
    }

    /// Builds the set of values a newly attached client receives.
    ///
    /// Keycode clients start with nothing.  Command clients get every command
    /// except console switching and driver/speech restarts, which the server
    /// keeps for itself.
    ///
    /// # Errors
    ///
    /// Propagates allocation failure from the range set.
    pub fn default_unmasked(self) -> Result<RangeSet, RangeSetError> {
        let mut set = RangeSet::new();
        if self == DeliveryMode::Commands {
            set.add(0, KEYCODE_MAX)?;
            set.remove(command::SWITCHVT_PREV, command::SWITCHVT_NEXT)?;
            set.remove(command::RESTARTBRL, command::RESTARTSPEECH)?;
            set.remove(command::BLOCK_SWITCHVT, command::BLOCK_SWITCHVT | ARG_MASK)?;
        }
        Ok(set)
    }

    /// The value tested against a connection's mask for this event.
    pub fn mask_key(self, command: u32, keycode: u32) -> u32 {
        match self {
            DeliveryMode::Commands => command & COMMAND_MASK,
            DeliveryMode::Keycodes => keycode,
        }
    }
}
