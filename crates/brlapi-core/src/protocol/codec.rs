//! Binary codec for BrlAPI packets.
//!
//! Wire format:
//! ```text
//! [size:4][type:4][payload:size]
//! ```
//! Header size: 8 bytes. All multi-byte integers are big-endian.  `size`
//! counts payload bytes only.
//!
//! Encoding is infallible: every response the server sends is built here.
//! Decoding turns the payload of a client request into a typed struct and
//! reports every validation failure as a [`ProtocolError`], which knows which
//! wire [`ErrorCode`] it corresponds to.

use encoding_rs::Encoding;
use thiserror::Error;

use crate::protocol::messages::{
    write_flags, ErrorCode, PacketType, EXCEPTION_ECHO_MAX, HEADER_SIZE, MAX_NAME_LENGTH,
    RAW_MAGIC,
};

/// Errors that can occur while decoding a request payload.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The payload could not be parsed (wrong size, trailing bytes, bad text).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A length field inside the payload disagrees with the bytes present.
    #[error("payload length mismatch: declared {declared}, available {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// A field is well-formed but its value is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The request asks for something the server does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    /// Maps the decoding failure to the error code reported to the client.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::InsufficientData { .. }
            | ProtocolError::MalformedPayload(_)
            | ProtocolError::PayloadLengthMismatch { .. } => ErrorCode::InvalidPacket,
            ProtocolError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            ProtocolError::Unsupported(_) => ErrorCode::OpNotSupp,
        }
    }
}

/// One complete packet as read from a client.
///
/// The type is kept as the raw wire value so that unknown types can still be
/// echoed back inside an Exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates a packet from a known type.
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type: packet_type.code(),
            payload,
        }
    }

    /// Returns the decoded packet type, if it is one the server knows.
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::try_from(self.packet_type).ok()
    }

    /// Encodes the packet including its header.
    pub fn encode(&self) -> Vec<u8> {
        encode_packet(self.packet_type, &self.payload)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a packet into a byte vector including the 8-byte header.
///
/// # Examples
///
/// ```rust
/// use brlapi_core::protocol::{encode_packet, PacketType};
///
/// let bytes = encode_packet(PacketType::Ack.code(), &[]);
/// assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, b'A']);
/// ```
pub fn encode_packet(packet_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&packet_type.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Builds an Acknowledge packet.
pub fn ack() -> Vec<u8> {
    encode_packet(PacketType::Ack.code(), &[])
}

/// Builds an Error packet carrying `code`.
pub fn error(code: ErrorCode) -> Vec<u8> {
    encode_packet(PacketType::Error.code(), &code.code().to_be_bytes())
}

/// Builds an Exception packet echoing the offending request.
///
/// The echoed payload is truncated so the whole Exception still fits in one
/// maximum-size packet.
pub fn exception(code: ErrorCode, original_type: u32, original_payload: &[u8]) -> Vec<u8> {
    let echo = &original_payload[..original_payload.len().min(EXCEPTION_ECHO_MAX)];
    let mut payload = Vec::with_capacity(8 + echo.len());
    payload.extend_from_slice(&code.code().to_be_bytes());
    payload.extend_from_slice(&original_type.to_be_bytes());
    payload.extend_from_slice(echo);
    encode_packet(PacketType::Exception.code(), &payload)
}

/// Builds a Key packet delivering `value` to a client.
pub fn key(value: u32) -> Vec<u8> {
    encode_packet(PacketType::Key.code(), &value.to_be_bytes())
}

/// Builds the reply to GetDisplaySize.
pub fn display_size(columns: u32, rows: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&columns.to_be_bytes());
    payload.extend_from_slice(&rows.to_be_bytes());
    encode_packet(PacketType::GetDisplaySize.code(), &payload)
}

/// Builds the reply to GetDriverId / GetDriverName: the string plus a NUL.
pub fn driver_string(reply_type: PacketType, value: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(value.len() + 1);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    encode_packet(reply_type.code(), &payload)
}

/// Builds a raw-mode Packet carrying opaque driver bytes.
pub fn raw_packet(data: &[u8]) -> Vec<u8> {
    encode_packet(PacketType::Packet.code(), data)
}

// ── Request payloads ──────────────────────────────────────────────────────────

/// Payload of the first packet a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest<'a> {
    pub protocol_version: u32,
    pub key: &'a [u8],
}

/// Payload of GetTty: the console path plus the requested delivery-mode name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTtyRequest {
    pub path: Vec<u32>,
    pub mode_name: String,
}

/// Payload of GetRaw: the driver name the client expects to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRawRequest {
    pub driver_name: String,
}

/// A validated Write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCommand {
    /// Flags zero and nothing else: stop showing this client's content.
    Clear,
    /// Update part of the client's window.
    Update(WriteRequest),
}

/// A validated display update.  `region_begin` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub region_begin: usize,
    pub region_size: usize,
    pub text: Option<Vec<char>>,
    pub and_attr: Option<Vec<u8>>,
    pub or_attr: Option<Vec<u8>>,
    pub cursor: Option<usize>,
}

/// Decodes the authentication payload `[u32 version][key bytes]`.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when the version field is missing.
pub fn decode_auth(payload: &[u8]) -> Result<AuthRequest<'_>, ProtocolError> {
    let protocol_version = read_u32(payload, 0)?;
    Ok(AuthRequest {
        protocol_version,
        key: &payload[4..],
    })
}

/// Decodes `[u32 n][n × u32 path][u8 len][name]`.
///
/// # Errors
///
/// An over-long name is an invalid parameter; any size disagreement is a
/// malformed payload.
pub fn decode_get_tty(payload: &[u8]) -> Result<GetTtyRequest, ProtocolError> {
    let count = read_u32(payload, 0)? as usize;
    let names_at = count
        .checked_mul(4)
        .and_then(|n| n.checked_add(4))
        .ok_or_else(|| ProtocolError::MalformedPayload(format!("path of {count} ttys")))?;
    require_len(payload, names_at + 1, "tty path")?;
    let path = (0..count)
        .map(|i| read_u32(payload, 4 + i * 4))
        .collect::<Result<Vec<_>, _>>()?;
    let (mode_name, end) = read_short_name(payload, names_at)?;
    if end != payload.len() {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: end,
            available: payload.len(),
        });
    }
    Ok(GetTtyRequest { path, mode_name })
}

/// Decodes the console number carried by SetFocus.
pub fn decode_set_focus(payload: &[u8]) -> Result<u32, ProtocolError> {
    require_exact(payload, 4, "focus")?;
    read_u32(payload, 0)
}

/// Decodes `[u32 lo][u32 hi]`.
pub fn decode_key_range(payload: &[u8]) -> Result<(u32, u32), ProtocolError> {
    require_exact(payload, 8, "key range")?;
    Ok((read_u32(payload, 0)?, read_u32(payload, 4)?))
}

/// Decodes a list of 32-bit key values.
pub fn decode_key_set(payload: &[u8]) -> Result<Vec<u32>, ProtocolError> {
    if payload.len() % 4 != 0 {
        return Err(ProtocolError::MalformedPayload(format!(
            "key set of {} bytes is not a multiple of 4",
            payload.len()
        )));
    }
    payload
        .chunks_exact(4)
        .map(|chunk| read_u32(chunk, 0))
        .collect()
}

/// Decodes `[u32 magic][u8 len][name]`.
///
/// The magic number is checked before the name so that a client speaking a
/// different raw protocol gets an invalid-parameter answer.
pub fn decode_get_raw(payload: &[u8]) -> Result<GetRawRequest, ProtocolError> {
    if payload.len() <= 4 {
        return Err(ProtocolError::InsufficientData {
            needed: 5,
            available: payload.len(),
        });
    }
    let magic = read_u32(payload, 0)?;
    if magic != RAW_MAGIC {
        return Err(ProtocolError::InvalidParameter(format!(
            "raw magic 0x{magic:08X}"
        )));
    }
    let (driver_name, end) = read_short_name(payload, 4)?;
    if end != payload.len() {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: end,
            available: payload.len(),
        });
    }
    Ok(GetRawRequest { driver_name })
}

/// Decodes and validates a Write payload against a display of `cells` cells.
///
/// Fields appear in flag order: region, text, AND attributes, OR attributes,
/// cursor, charset.  Every field is validated before anything is returned, so
/// the caller can apply the result atomically.
///
/// # Errors
///
/// - [`ProtocolError::Unsupported`] for the display-number field.
/// - [`ProtocolError::InvalidParameter`] for a region outside the display.
/// - [`ProtocolError::MalformedPayload`] for short fields, trailing bytes, an
///   out-of-range cursor, or text that does not decode to exactly the region.
pub fn decode_write(payload: &[u8], cells: usize) -> Result<WriteCommand, ProtocolError> {
    let flags = read_u32(payload, 0)?;
    if payload.len() == 4 && flags == 0 {
        return Ok(WriteCommand::Clear);
    }
    if flags & write_flags::DISPLAY_NUMBER != 0 {
        return Err(ProtocolError::Unsupported("display number".to_string()));
    }

    let mut cursor_at = 4;

    let (region_begin, region_size) = if flags & write_flags::REGION != 0 {
        if payload.len() - cursor_at <= 8 {
            return Err(ProtocolError::MalformedPayload(
                "region needs 8 bytes and a field after it".to_string(),
            ));
        }
        let begin = read_u32(payload, cursor_at)? as usize;
        let size = read_u32(payload, cursor_at + 4)? as usize;
        cursor_at += 8;
        let fits = begin >= 1
            && size > 0
            && begin
                .checked_add(size)
                .map_or(false, |end| end - 1 <= cells);
        if !fits {
            return Err(ProtocolError::InvalidParameter(format!(
                "region {begin}+{size} outside {cells} cells"
            )));
        }
        (begin, size)
    } else {
        (1, cells)
    };

    let mut text_bytes = None;
    if flags & write_flags::TEXT != 0 {
        let len = read_u32(payload, cursor_at)? as usize;
        cursor_at += 4;
        text_bytes = Some(take(payload, &mut cursor_at, len, "text")?);
    }

    let and_attr = if flags & write_flags::ATTR_AND != 0 {
        Some(take(payload, &mut cursor_at, region_size, "and attributes")?.to_vec())
    } else {
        None
    };

    let or_attr = if flags & write_flags::ATTR_OR != 0 {
        Some(take(payload, &mut cursor_at, region_size, "or attributes")?.to_vec())
    } else {
        None
    };

    let cursor = if flags & write_flags::CURSOR != 0 {
        let value = read_u32(payload, cursor_at)? as usize;
        cursor_at += 4;
        if value > cells {
            return Err(ProtocolError::MalformedPayload(format!(
                "cursor {value} beyond {cells} cells"
            )));
        }
        Some(value)
    } else {
        None
    };

    let mut charset = None;
    if flags & write_flags::CHARSET != 0 {
        if text_bytes.is_none() {
            return Err(ProtocolError::MalformedPayload(
                "charset given without text".to_string(),
            ));
        }
        let (name, end) = read_short_name(payload, cursor_at).map_err(|e| match e {
            ProtocolError::InvalidParameter(msg) => ProtocolError::MalformedPayload(msg),
            other => other,
        })?;
        cursor_at = end;
        charset = Some(name);
    }

    if cursor_at != payload.len() {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: cursor_at,
            available: payload.len(),
        });
    }

    let text = match text_bytes {
        Some(bytes) => {
            let chars = decode_text(bytes, charset.as_deref())?;
            if chars.len() != region_size {
                return Err(ProtocolError::MalformedPayload(format!(
                    "text decodes to {} characters for a region of {region_size}",
                    chars.len()
                )));
            }
            Some(chars)
        }
        None => None,
    };

    Ok(WriteCommand::Update(WriteRequest {
        region_begin,
        region_size,
        text,
        and_attr,
        or_attr,
        cursor,
    }))
}

/// Decodes text bytes using the named character set.
///
/// Without a charset the bytes are ISO-8859-1, one character per byte.
/// Named charsets are resolved through the WHATWG label table, except that
/// `ISO-8859-1` and `US-ASCII` keep their strict meanings instead of the
/// windows-1252 alias the web gives them.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] for an unknown charset name or
/// a byte sequence that is not valid in the named charset.
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> Result<Vec<char>, ProtocolError> {
    let name = charset.map(|c| c.trim().to_ascii_lowercase());
    match name.as_deref() {
        None | Some("iso-8859-1" | "iso8859-1" | "iso_8859-1" | "latin1" | "latin-1") => {
            Ok(bytes.iter().map(|&b| char::from(b)).collect())
        }
        Some("us-ascii" | "ascii" | "ansi_x3.4-1968") => {
            if let Some(bad) = bytes.iter().find(|b| !b.is_ascii()) {
                return Err(ProtocolError::MalformedPayload(format!(
                    "byte 0x{bad:02X} is not ASCII"
                )));
            }
            Ok(bytes.iter().map(|&b| char::from(b)).collect())
        }
        Some(label) => {
            let encoding = Encoding::for_label(label.as_bytes()).ok_or_else(|| {
                ProtocolError::MalformedPayload(format!("unknown charset {label:?}"))
            })?;
            encoding
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| text.chars().collect())
                .ok_or_else(|| {
                    ProtocolError::MalformedPayload(format!(
                        "text is not valid {}",
                        encoding.name()
                    ))
                })
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn require_exact(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() != needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: expected {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    if buf.len() < offset + 4 {
        return Err(ProtocolError::InsufficientData {
            needed: offset + 4,
            available: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

/// Takes `len` bytes at `*offset` and advances it.
fn take<'a>(
    buf: &'a [u8],
    offset: &mut usize,
    len: usize,
    context: &str,
) -> Result<&'a [u8], ProtocolError> {
    let start = *offset;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| {
            ProtocolError::MalformedPayload(format!(
                "{context}: {len} bytes at offset {start} exceed payload of {}",
                buf.len()
            ))
        })?;
    *offset = end;
    Ok(&buf[start..end])
}

/// Reads a 1-byte length prefix followed by a name.  Returns the name and the
/// offset just past it.
fn read_short_name(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    require_len(buf, offset + 1, "name length")?;
    let len = buf[offset] as usize;
    if len > MAX_NAME_LENGTH {
        return Err(ProtocolError::InvalidParameter(format!(
            "name of {len} bytes exceeds {MAX_NAME_LENGTH}"
        )));
    }
    let mut at = offset + 1;
    let bytes = take(buf, &mut at, len, "name")?;
    let name = bytes.iter().map(|&b| char::from(b)).collect();
    Ok((name, at))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
