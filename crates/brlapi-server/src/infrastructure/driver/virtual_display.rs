//! Headless driver used when no hardware is attached.
//!
//! Every window the server writes is logged at `debug` level as a line of
//! Unicode braille, which makes client behaviour visible with
//! `RUST_LOG=brlapi_server=debug`.  It never produces keys.

use brlapi_core::DisplaySize;
use tracing::debug;

use super::{BrailleDriver, DriverError};

pub struct VirtualDisplay {
    size: DisplaySize,
    last: Vec<u8>,
}

impl VirtualDisplay {
    pub fn new(size: DisplaySize) -> Self {
        Self {
            size,
            last: Vec::new(),
        }
    }

    /// The most recently written cells.
    pub fn contents(&self) -> &[u8] {
        &self.last
    }
}

/// Renders dot patterns as Unicode braille characters.
pub fn cells_to_unicode(cells: &[u8]) -> String {
    cells
        .iter()
        .map(|&dots| char::from_u32(0x2800 + u32::from(dots)).unwrap_or(' '))
        .collect()
}

impl BrailleDriver for VirtualDisplay {
    fn code(&self) -> &str {
        "vr"
    }

    fn name(&self) -> &str {
        "Virtual"
    }

    fn display_size(&self) -> DisplaySize {
        self.size
    }

    fn write_window(&mut self, cells: &[u8]) -> Result<(), DriverError> {
        if cells != self.last.as_slice() {
            debug!(window = %cells_to_unicode(cells), "virtual display");
            self.last = cells.to_vec();
        }
        Ok(())
    }

    fn read_command(&mut self) -> Result<Option<u32>, DriverError> {
        Ok(None)
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        self.last.clear();
        Ok(())
    }
}
