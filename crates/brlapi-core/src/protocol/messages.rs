//! All BrlAPI packet type codes, error codes, and wire constants.
//!
//! Every packet starts with an 8-byte header `[size:4][type:4]`; the type codes
//! are printable ASCII letters so that protocol traces are easy to read.

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version a client must announce in its authentication packet.
pub const PROTOCOL_VERSION: u32 = 7;

/// Size of the packet header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload the server buffers.  Larger packets are discarded.
pub const MAX_PACKET_SIZE: usize = 512;

/// Longest driver or delivery-mode name carried in a request.
pub const MAX_NAME_LENGTH: usize = 31;

/// Magic number a client must send to request raw mode.
pub const RAW_MAGIC: u32 = 0xDEAD_BEEF;

/// Bytes of the original packet that fit in an Exception payload.
pub const EXCEPTION_ECHO_MAX: usize = MAX_PACKET_SIZE - 8;

// ── Packet type codes ─────────────────────────────────────────────────────────

/// Every packet type understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    // Session
    Auth = b'K' as u32,
    // Queries
    GetDriverId = b'd' as u32,
    GetDriverName = b'n' as u32,
    GetDisplaySize = b's' as u32,
    // Tty control
    GetTty = b't' as u32,
    SetFocus = b'F' as u32,
    LeaveTty = b'L' as u32,
    Key = b'k' as u32,
    IgnoreKeyRange = b'm' as u32,
    UnignoreKeyRange = b'u' as u32,
    IgnoreKeySet = b'M' as u32,
    UnignoreKeySet = b'U' as u32,
    Write = b'w' as u32,
    // Raw mode
    GetRaw = b'*' as u32,
    LeaveRaw = b'#' as u32,
    Packet = b'p' as u32,
    // Replies
    Ack = b'A' as u32,
    Error = b'e' as u32,
    Exception = b'E' as u32,
}

impl PacketType {
    /// Returns the on-wire code for this packet type.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PacketType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        let Ok(byte) = u8::try_from(value) else {
            return Err(());
        };
        match byte {
            b'K' => Ok(PacketType::Auth),
            b'd' => Ok(PacketType::GetDriverId),
            b'n' => Ok(PacketType::GetDriverName),
            b's' => Ok(PacketType::GetDisplaySize),
            b't' => Ok(PacketType::GetTty),
            b'F' => Ok(PacketType::SetFocus),
            b'L' => Ok(PacketType::LeaveTty),
            b'k' => Ok(PacketType::Key),
            b'm' => Ok(PacketType::IgnoreKeyRange),
            b'u' => Ok(PacketType::UnignoreKeyRange),
            b'M' => Ok(PacketType::IgnoreKeySet),
            b'U' => Ok(PacketType::UnignoreKeySet),
            b'w' => Ok(PacketType::Write),
            b'*' => Ok(PacketType::GetRaw),
            b'#' => Ok(PacketType::LeaveRaw),
            b'p' => Ok(PacketType::Packet),
            b'A' => Ok(PacketType::Ack),
            b'e' => Ok(PacketType::Error),
            b'E' => Ok(PacketType::Exception),
            _ => Err(()),
        }
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Error codes carried in Error and Exception packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    NoMem = 1,
    TtyBusy = 2,
    RawModeBusy = 3,
    UnknownInstruction = 4,
    IllegalInstruction = 5,
    InvalidParameter = 6,
    InvalidPacket = 7,
    ConnRefused = 8,
    OpNotSupp = 9,
    ProtocolVersion = 13,
    DriverError = 16,
}

impl ErrorCode {
    /// Returns the on-wire code.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::NoMem),
            2 => Ok(ErrorCode::TtyBusy),
            3 => Ok(ErrorCode::RawModeBusy),
            4 => Ok(ErrorCode::UnknownInstruction),
            5 => Ok(ErrorCode::IllegalInstruction),
            6 => Ok(ErrorCode::InvalidParameter),
            7 => Ok(ErrorCode::InvalidPacket),
            8 => Ok(ErrorCode::ConnRefused),
            9 => Ok(ErrorCode::OpNotSupp),
            13 => Ok(ErrorCode::ProtocolVersion),
            16 => Ok(ErrorCode::DriverError),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorCode::Success => "success",
            ErrorCode::NoMem => "not enough memory",
            ErrorCode::TtyBusy => "tty busy",
            ErrorCode::RawModeBusy => "raw mode busy",
            ErrorCode::UnknownInstruction => "unknown instruction",
            ErrorCode::IllegalInstruction => "illegal instruction",
            ErrorCode::InvalidParameter => "invalid parameter",
            ErrorCode::InvalidPacket => "invalid packet",
            ErrorCode::ConnRefused => "connection refused",
            ErrorCode::OpNotSupp => "operation not supported",
            ErrorCode::ProtocolVersion => "protocol version mismatch",
            ErrorCode::DriverError => "driver error",
        };
        f.write_str(text)
    }
}

// ── Write request flags ───────────────────────────────────────────────────────

/// Bit flags selecting which optional fields a Write request carries.
pub mod write_flags {
    pub const DISPLAY_NUMBER: u32 = 0x01;
    pub const REGION: u32 = 0x02;
    pub const TEXT: u32 = 0x04;
    pub const ATTR_AND: u32 = 0x08;
    pub const ATTR_OR: u32 = 0x10;
    pub const CURSOR: u32 = 0x20;
    pub const CHARSET: u32 = 0x40;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_codes_are_ascii_letters() {
        assert_eq!(PacketType::Auth.code(), 0x4B);
        assert_eq!(PacketType::Write.code(), u32::from(b'w'));
        assert_eq!(PacketType::GetRaw.code(), u32::from(b'*'));
    }

    #[test]
    fn test_packet_type_try_from_known_code() {
        assert_eq!(PacketType::try_from(u32::from(b't')), Ok(PacketType::GetTty));
        assert_eq!(PacketType::try_from(u32::from(b'E')), Ok(PacketType::Exception));
    }

    #[test]
    fn test_packet_type_try_from_rejects_unknown_and_wide_codes() {
        assert_eq!(PacketType::try_from(u32::from(b'z')), Err(()));
        assert_eq!(PacketType::try_from(0x0100 | u32::from(b'w')), Err(()));
    }

    #[test]
    fn test_error_code_round_trips_through_u32() {
        for code in [
            ErrorCode::NoMem,
            ErrorCode::RawModeBusy,
            ErrorCode::ProtocolVersion,
            ErrorCode::DriverError,
        ] {
            assert_eq!(ErrorCode::try_from(code.code()), Ok(code));
        }
    }

    #[test]
    fn test_exception_echo_leaves_room_for_header_fields() {
        assert_eq!(EXCEPTION_ECHO_MAX + 8, MAX_PACKET_SIZE);
    }
}
