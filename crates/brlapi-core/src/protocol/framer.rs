//! Resumable packet framer.
//!
//! # Why a framer? (for beginners)
//!
//! A socket is a *stream*: one read may return half a header, or the end of
//! one packet and the start of the next.  The framer remembers how far it got
//! through the current packet so that the caller can hand it whatever bytes
//! are available, come back later when more arrive, and eventually receive a
//! whole packet.
//!
//! The framer never blocks.  A source that reports
//! [`std::io::ErrorKind::WouldBlock`] makes [`PacketFramer::read_from`] return
//! [`FrameStatus::Pending`] with all partial state preserved.  A source that
//! reports zero bytes has reached end of stream.
//!
//! # States
//!
//! ```text
//! ReadingHeader ──size ≤ MAX──▶ ReadingContent ──full──▶ packet, reset
//!       │  └─size == 0──────────────────────────────────▶ packet, reset
//!       └─────size > MAX──▶ Discarding ──drained──▶ oversized notice, reset
//! ```

use std::io::{self, Read};

use thiserror::Error;

use crate::protocol::codec::Packet;
use crate::protocol::messages::{HEADER_SIZE, MAX_PACKET_SIZE};

/// Errors returned by the framer.  Both end the connection.
#[derive(Debug, Error)]
pub enum FramerError {
    /// The peer closed the stream.
    #[error("end of stream")]
    Eof,

    /// The underlying read failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Result of one [`PacketFramer::read_from`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not enough bytes yet; call again when the source is readable.
    Pending,
    /// A whole packet was assembled.
    Complete(Packet),
    /// A packet larger than [`MAX_PACKET_SIZE`] was skipped entirely.
    Oversized { packet_type: u32, size: usize },
}

#[derive(Debug)]
enum State {
    ReadingHeader { filled: usize },
    ReadingContent { packet_type: u32, filled: usize },
    Discarding { packet_type: u32, size: usize, remaining: usize },
}

/// Incremental packet assembler for one connection.
#[derive(Debug)]
pub struct PacketFramer {
    state: State,
    header: [u8; HEADER_SIZE],
    content: Vec<u8>,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFramer {
    /// Creates a framer waiting for the first header byte.
    pub fn new() -> Self {
        Self {
            state: State::ReadingHeader { filled: 0 },
            header: [0; HEADER_SIZE],
            content: Vec::new(),
        }
    }

    /// Returns `true` when no partial packet is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::ReadingHeader { filled: 0 })
    }

    /// Reads from `src` until one packet completes or the source would block.
    ///
    /// # Errors
    ///
    /// Returns [`FramerError::Eof`] when `src` returns zero bytes and
    /// [`FramerError::Io`] for any error other than `WouldBlock` or
    /// `Interrupted`.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<FrameStatus, FramerError> {
        loop {
            match self.state {
                State::ReadingHeader { filled } => {
                    let Some(n) = read_some(src, &mut self.header[filled..])? else {
                        return Ok(FrameStatus::Pending);
                    };
                    let filled = filled + n;
                    if filled < HEADER_SIZE {
                        self.state = State::ReadingHeader { filled };
                        continue;
                    }
                    let size = u32::from_be_bytes([
                        self.header[0],
                        self.header[1],
                        self.header[2],
                        self.header[3],
                    ]) as usize;
                    let packet_type = u32::from_be_bytes([
                        self.header[4],
                        self.header[5],
                        self.header[6],
                        self.header[7],
                    ]);
                    if size == 0 {
                        self.reset();
                        return Ok(FrameStatus::Complete(Packet {
                            packet_type,
                            payload: Vec::new(),
                        }));
                    }
                    if size <= MAX_PACKET_SIZE {
                        self.content.clear();
                        self.content.resize(size, 0);
                        self.state = State::ReadingContent {
                            packet_type,
                            filled: 0,
                        };
                    } else {
                        self.state = State::Discarding {
                            packet_type,
                            size,
                            remaining: size,
                        };
                    }
                }
                State::ReadingContent { packet_type, filled } => {
                    let Some(n) = read_some(src, &mut self.content[filled..])? else {
                        return Ok(FrameStatus::Pending);
                    };
                    let filled = filled + n;
                    if filled < self.content.len() {
                        self.state = State::ReadingContent {
                            packet_type,
                            filled,
                        };
                        continue;
                    }
                    let payload = std::mem::take(&mut self.content);
                    self.reset();
                    return Ok(FrameStatus::Complete(Packet {
                        packet_type,
                        payload,
                    }));
                }
                State::Discarding {
                    packet_type,
                    size,
                    remaining,
                } => {
                    let mut scratch = [0u8; MAX_PACKET_SIZE];
                    let want = remaining.min(MAX_PACKET_SIZE);
                    let Some(n) = read_some(src, &mut scratch[..want])? else {
                        return Ok(FrameStatus::Pending);
                    };
                    let remaining = remaining - n;
                    if remaining > 0 {
                        self.state = State::Discarding {
                            packet_type,
                            size,
                            remaining,
                        };
                        continue;
                    }
                    self.reset();
                    return Ok(FrameStatus::Oversized { packet_type, size });
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = State::ReadingHeader { filled: 0 };
    }
}

/// One read attempt.  `Ok(None)` means the source would block.
fn read_some<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<Option<usize>, FramerError> {
    loop {
        match src.read(buf) {
            Ok(0) => return Err(FramerError::Eof),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FramerError::Io(e)),
        }
    }
}

/// A [`Read`] source over bytes already received from an async socket.
///
/// It reports `WouldBlock` once drained, which is what the framer expects
/// from a non-blocking socket with nothing more to read.
#[derive(Debug)]
pub struct ChunkSource<'a> {
    remaining: &'a [u8],
}

impl<'a> ChunkSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { remaining: bytes }
    }

    pub fn is_drained(&self) -> bool {
        self.remaining.is_empty()
    }
}

impl Read for ChunkSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.remaining.len());
        buf[..n].copy_from_slice(&self.remaining[..n]);
        self.remaining = &self.remaining[n..];
        Ok(n)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
