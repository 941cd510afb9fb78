//! Braille driver and host console collaborators.
//!
//! The server never talks to hardware itself.  It goes through
//! [`BrailleDriver`], the capability interface every display driver offers,
//! and asks the host through [`HostConsole`] which virtual console is active.
//!
//! # Sub-modules
//!
//! - **`virtual_display`** – A headless driver that logs what would be shown.
//!   Used by the binary when no hardware driver is configured.
//! - **`console`** – Reads the active console number from sysfs.
//! - **`mock`** – A scripted driver that records every call, for tests.

pub mod console;
pub mod mock;
pub mod virtual_display;

use brlapi_core::DisplaySize;
use thiserror::Error;

/// Errors reported by a driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The device did not accept or return data.
    #[error("device I/O failed: {0}")]
    Io(String),

    /// The driver does not implement the requested entry point.
    #[error("operation not supported by driver {0}")]
    Unsupported(String),
}

/// Static facts about the active driver, cached so request handlers never
/// need the driver lock just to read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Short identifier, e.g. `"pm"`.
    pub code: String,
    /// Full name, e.g. `"Papenmeier"`.  Clients quote it to ask for keycodes
    /// or raw mode.
    pub name: String,
    pub size: DisplaySize,
    pub supports_raw: bool,
    pub supports_keycodes: bool,
}

/// The capability interface of a braille display driver.
///
/// Methods taking `&mut self` perform device I/O and are only called with the
/// driver lock held.
pub trait BrailleDriver: Send {
    /// Short identifier.
    fn code(&self) -> &str;

    /// Full name.
    fn name(&self) -> &str;

    /// Geometry of the display.
    fn display_size(&self) -> DisplaySize;

    /// Whether raw packets can be exchanged with the device.
    fn supports_raw(&self) -> bool {
        false
    }

    /// Whether the driver reports device keycodes through [`Self::read_key`].
    fn supports_keycodes(&self) -> bool {
        false
    }

    /// Writes one dot pattern per cell to the main display.
    fn write_window(&mut self, cells: &[u8]) -> Result<(), DriverError>;

    /// Writes the status cells, if the device has any.
    fn write_status(&mut self, _cells: &[u8]) -> Result<(), DriverError> {
        Ok(())
    }

    /// Returns the next command, or `None` if no key was pressed.
    fn read_command(&mut self) -> Result<Option<u32>, DriverError>;

    /// Returns the next device keycode, or `None` if no key was pressed.
    fn read_key(&mut self) -> Result<Option<u32>, DriverError> {
        Ok(None)
    }

    /// Translates a keycode into the equivalent command.
    fn key_to_command(&mut self, _keycode: u32) -> u32 {
        brlapi_core::domain::keys::command::NOOP
    }

    /// Sends an opaque packet to the device.
    fn write_packet(&mut self, _data: &[u8]) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(self.code().to_string()))
    }

    /// Reads an opaque packet from the device, `None` if nothing is waiting.
    fn read_packet(&mut self) -> Result<Option<Vec<u8>>, DriverError> {
        Err(DriverError::Unsupported(self.code().to_string()))
    }

    /// Brings the device back to a known state.
    fn reset(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(self.code().to_string()))
    }

    /// Collects the cached facts about this driver.
    fn info(&self) -> DriverInfo {
        DriverInfo {
            code: self.code().to_string(),
            name: self.name().to_string(),
            size: self.display_size(),
            supports_raw: self.supports_raw(),
            supports_keycodes: self.supports_keycodes(),
        }
    }
}

/// What the server needs from the surrounding host.
#[cfg_attr(test, mockall::automock)]
pub trait HostConsole: Send + Sync {
    /// Number of the virtual console currently shown on the host.
    fn active_console(&self) -> u32;

    /// Asks the host to tear down and restart the braille driver.
    fn restart_driver(&self);
}
