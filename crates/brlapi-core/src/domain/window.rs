//! Per-connection braille window.
//!
//! Each client that holds a tty owns a private copy of the whole display:
//! one character, one AND mask, and one OR mask per cell, plus a cursor.
//! Writes only touch this copy.  When the client owns the real display the
//! window is rendered to dot patterns and handed to the driver.

use crate::protocol::codec::WriteRequest;

/// Dots 7 and 8, used to show the cursor.
pub const CURSOR_DOTS: u8 = 0xC0;

/// First character of the Unicode braille patterns block.
const BRAILLE_BLOCK: u32 = 0x2800;

/// Geometry of the physical display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySize {
    pub columns: u32,
    pub rows: u32,
}

impl DisplaySize {
    pub fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    /// Total number of cells.
    pub fn cells(&self) -> usize {
        self.columns as usize * self.rows as usize
    }
}

/// Whether a connection's window content has reached the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    /// Nothing to show; the connection does not compete for the display.
    #[default]
    Empty,
    /// New content waiting to be written.
    PendingDisplay,
    /// Content already written to the display.
    Displayed,
}

/// One client's private view of the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrailleWindow {
    text: Vec<char>,
    and_attr: Vec<u8>,
    or_attr: Vec<u8>,
    /// 1-based cursor cell, 0 for none.
    cursor: usize,
}

impl BrailleWindow {
    /// Creates a blank window of `cells` cells.
    pub fn new(cells: usize) -> Self {
        Self {
            text: vec![' '; cells],
            and_attr: vec![0xFF; cells],
            or_attr: vec![0x00; cells],
            cursor: 0,
        }
    }

    pub fn text(&self) -> &[char] {
        &self.text
    }

    pub fn and_attr(&self) -> &[u8] {
        &self.and_attr
    }

    pub fn or_attr(&self) -> &[u8] {
        &self.or_attr
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Applies a validated write.
    ///
    /// The request must already have been checked against this window's size
    /// (see [`crate::protocol::codec::decode_write`]); cells outside the
    /// region are left untouched.
    pub fn apply(&mut self, update: &WriteRequest) {
        let start = update.region_begin - 1;
        let end = start + update.region_size;
        if let Some(text) = &update.text {
            self.text[start..end].copy_from_slice(text);
        }
        if let Some(and) = &update.and_attr {
            self.and_attr[start..end].copy_from_slice(and);
        }
        if let Some(or) = &update.or_attr {
            self.or_attr[start..end].copy_from_slice(or);
        }
        if let Some(cursor) = update.cursor {
            self.cursor = cursor;
        }
    }

    /// Renders the window to one dot pattern per cell.
    ///
    /// Characters from the Unicode braille block map directly to their dots;
    /// every other character goes through `translate`.
    pub fn render<F>(&self, translate: F) -> Vec<u8>
    where
        F: Fn(char) -> u8,
    {
        let mut cells: Vec<u8> = self
            .text
            .iter()
            .zip(self.and_attr.iter().zip(&self.or_attr))
            .map(|(&c, (&and, &or))| {
                let dots = braille_dots(c).unwrap_or_else(|| translate(c));
                (dots & and) | or
            })
            .collect();
        if self.cursor > 0 {
            if let Some(cell) = cells.get_mut(self.cursor - 1) {
                *cell |= CURSOR_DOTS;
            }
        }
        cells
    }
}

/// Returns the dot pattern of a Unicode braille character.
pub fn braille_dots(c: char) -> Option<u8> {
    let code = u32::from(c);
    if (BRAILLE_BLOCK..=BRAILLE_BLOCK + 0xFF).contains(&code) {
        Some((code - BRAILLE_BLOCK) as u8)
    } else {
        None
    }
}
