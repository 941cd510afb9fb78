//! The display output cycle and the driver decorator the host uses.
//!
//! The host's braille pipeline keeps calling `read_command` and
//! `write_window` on whatever driver it holds.  [`ApiDriver`] wraps the real
//! driver so that, on every call, the server gets a chance to:
//!
//! 1. Keep the root of the tty tree focused on the host's active console.
//! 2. Shuttle raw packets between the device and the raw-mode owner.
//! 3. Put the display owner's window on the device, redrawing whenever the
//!    owner changed since the last cycle.
//! 4. Hand the next key to the client that wants it, returning `NOOP` to the
//!    host when a client consumed it.
//!
//! While a client owns the display, the host's own output is suppressed.

use std::sync::Arc;

use brlapi_core::domain::keys::command;
use brlapi_core::domain::window::BufferState;
use brlapi_core::protocol::codec;
use brlapi_core::{DeliveryMode, DisplaySize, ErrorCode, PacketType};
use tracing::{debug, warn};

use super::arbitration::{find_display_owner, find_key_recipient};
use super::server::BrlapiServer;
use crate::infrastructure::driver::{BrailleDriver, DriverError};

impl BrlapiServer {
    /// Runs one output cycle and returns the command left for the host.
    ///
    /// # Errors
    ///
    /// Propagates driver failures while writing the window or reading keys.
    pub fn read_command(&self) -> Result<Option<u32>, DriverError> {
        let active = self.sync_root_focus();

        if self.raw_owner().is_some() {
            self.forward_raw_input();
            return Ok(None);
        }

        self.refresh_display(active)?;

        let event = {
            let mut driver = self.driver();
            if self.info.supports_keycodes {
                match driver.read_key()? {
                    Some(keycode) => Some((driver.key_to_command(keycode), Some(keycode))),
                    None => None,
                }
            } else {
                driver.read_command()?.map(|cmd| (cmd, None))
            }
        };
        let Some((cmd, keycode)) = event else {
            return Ok(None);
        };

        if self.deliver_key(active, cmd, keycode) {
            Ok(Some(command::NOOP))
        } else {
            Ok(Some(cmd))
        }
    }

    /// Reads one raw packet from the device for the raw-mode owner.
    fn forward_raw_input(&self) {
        let owner = {
            let registry = self.registry();
            let raw = self.raw_slot();
            raw.and_then(|id| registry.connections.get(&id))
                .map(|record| Arc::clone(&record.shared))
        };
        let Some(owner) = owner else {
            return;
        };
        let result = self.driver().read_packet();
        match result {
            Ok(Some(data)) => owner.send(codec::raw_packet(&data)),
            Ok(None) => {}
            Err(e) => {
                warn!(id = %owner.id(), "raw read failed: {e}");
                owner.send(codec::exception(ErrorCode::DriverError, PacketType::Packet.code(), &[]));
            }
        }
    }

    /// Writes the display owner's window if it changed or the owner did.
    /// Returns whether a client owns the display.
    fn refresh_display(&self, active: u32) -> Result<bool, DriverError> {
        let owner = {
            let registry = self.registry();
            find_display_owner(&registry, active).map(|record| Arc::clone(&record.shared))
        };
        let Some(owner) = owner else {
            return Ok(false);
        };

        let forced = {
            let mut last = self.last_writer();
            let changed = *last != Some(owner.id());
            *last = Some(owner.id());
            changed
        };

        let cells = {
            let mut slot = owner.window();
            if slot.state == BufferState::PendingDisplay || forced {
                slot.state = BufferState::Displayed;
                slot.window.as_ref().map(|window| window.render(&self.translate))
            } else {
                None
            }
        };

        if let Some(cells) = cells {
            if forced {
                debug!(id = %owner.id(), "display owner changed, redrawing");
            }
            self.driver().write_window(&cells)?;
        }
        Ok(true)
    }

    /// Sends a key to the client that wants it.  Returns `true` if consumed.
    fn deliver_key(&self, active: u32, cmd: u32, keycode: Option<u32>) -> bool {
        let registry = self.registry();
        let Some(record) = find_key_recipient(&registry, active, cmd, keycode) else {
            return false;
        };
        let value = match (record.mode, keycode) {
            (DeliveryMode::Keycodes, Some(keycode)) => keycode,
            _ => cmd,
        };
        if record.mode == DeliveryMode::Commands && cmd == command::NOOP {
            return true;
        }
        debug!(id = %record.shared.id(), value, "key delivered");
        record.shared.send(codec::key(value));
        true
    }

    /// Host output for the main display.  Dropped while a client owns it.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub fn write_host_window(&self, cells: &[u8]) -> Result<(), DriverError> {
        if self.raw_owner().is_some() {
            return Ok(());
        }
        let active = self.sync_root_focus();
        {
            let registry = self.registry();
            if find_display_owner(&registry, active).is_some() {
                return Ok(());
            }
        }
        *self.last_writer() = None;
        self.driver().write_window(cells)
    }

    /// Host output for the status cells.  Dropped in raw mode.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub fn write_host_status(&self, cells: &[u8]) -> Result<(), DriverError> {
        if self.raw_owner().is_some() {
            return Ok(());
        }
        self.driver().write_status(cells)
    }
}

/// The driver the host pipeline holds instead of the real one.
pub struct ApiDriver {
    server: Arc<BrlapiServer>,
}

impl ApiDriver {
    pub fn new(server: Arc<BrlapiServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<BrlapiServer> {
        &self.server
    }
}

impl BrailleDriver for ApiDriver {
    fn code(&self) -> &str {
        &self.server.info.code
    }

    fn name(&self) -> &str {
        &self.server.info.name
    }

    fn display_size(&self) -> DisplaySize {
        self.server.info.size
    }

    fn write_window(&mut self, cells: &[u8]) -> Result<(), DriverError> {
        self.server.write_host_window(cells)
    }

    fn write_status(&mut self, cells: &[u8]) -> Result<(), DriverError> {
        self.server.write_host_status(cells)
    }

    fn read_command(&mut self) -> Result<Option<u32>, DriverError> {
        self.server.read_command()
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        self.server.driver().reset()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use brlapi_core::domain::window::CURSOR_DOTS;
    use brlapi_core::protocol::messages::{write_flags, PROTOCOL_VERSION, RAW_MAGIC};
    use brlapi_core::Packet;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::application::server::{ConnectionId, ServerSettings};
    use crate::infrastructure::driver::console::StaticConsole;
    use crate::infrastructure::driver::mock::{MockDriver, MockDriverHandle};

    struct Fixture {
        server: Arc<BrlapiServer>,
        driver: MockDriverHandle,
        console: Arc<StaticConsole>,
    }

    fn fixture() -> Fixture {
        let (driver, handle) = MockDriver::papenmeier();
        let console = Arc::new(StaticConsole::new(1));
        let server = Arc::new(BrlapiServer::new(
            ServerSettings::new("k"),
            Box::new(driver),
            Arc::clone(&console) as Arc<dyn crate::infrastructure::driver::HostConsole>,
        ));
        Fixture {
            server,
            driver: handle,
            console,
        }
    }

    fn login(server: &BrlapiServer) -> (ConnectionId, UnboundedReceiver<Vec<u8>>) {
        let (shared, mut rx) = server.accept("t").unwrap();
        let mut auth = PROTOCOL_VERSION.to_be_bytes().to_vec();
        auth.push(b'k');
        server.handle_packet(shared.id(), &Packet::new(PacketType::Auth, auth));
        rx.try_recv().unwrap();
        (shared.id(), rx)
    }

    fn get_tty(server: &BrlapiServer, id: ConnectionId, console: u32, mode: &str) {
        let mut payload = 1u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&console.to_be_bytes());
        payload.push(mode.len() as u8);
        payload.extend_from_slice(mode.as_bytes());
        server.handle_packet(id, &Packet::new(PacketType::GetTty, payload));
    }

    fn write_braille(server: &BrlapiServer, id: ConnectionId, dots: &[u8], cursor: u32) {
        let text: String = dots
            .iter()
            .map(|&d| char::from_u32(0x2800 + u32::from(d)).unwrap())
            .collect();
        let mut payload = (write_flags::REGION | write_flags::TEXT | write_flags::CURSOR | write_flags::CHARSET)
            .to_be_bytes()
            .to_vec();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&(dots.len() as u32).to_be_bytes());
        payload.extend_from_slice(&(text.len() as u32).to_be_bytes());
        payload.extend_from_slice(text.as_bytes());
        payload.extend_from_slice(&cursor.to_be_bytes());
        payload.push(5);
        payload.extend_from_slice(b"UTF-8");
        server.handle_packet(id, &Packet::new(PacketType::Write, payload));
    }

    fn drain(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(bytes);
        }
        out
    }

    #[test]
    fn test_pending_window_is_rendered_once() {
        // Arrange
        let f = fixture();
        let (id, _rx) = login(&f.server);
        get_tty(&f.server, id, 1, "");
        write_braille(&f.server, id, &[0x01, 0x03], 2);

        // Act
        f.server.read_command().unwrap();
        f.server.read_command().unwrap();

        // Assert
        let windows = f.driver.windows();
        assert_eq!(windows.len(), 1);
        assert_eq!(&windows[0][..3], &[0x01, 0x03 | CURSOR_DOTS, 0x00]);
    }

    #[test]
    fn test_owner_change_forces_redraw() {
        // Arrange: two consoles with content, switch between them.
        let f = fixture();
        let (one, _rx1) = login(&f.server);
        let (two, _rx2) = login(&f.server);
        get_tty(&f.server, one, 1, "");
        get_tty(&f.server, two, 2, "");
        write_braille(&f.server, one, &[0x01], 0);
        write_braille(&f.server, two, &[0x02], 0);
        f.server.read_command().unwrap();

        // Act
        f.console.switch_to(2);
        f.server.read_command().unwrap();
        f.console.switch_to(1);
        f.server.read_command().unwrap();

        // Assert: console 1 redrawn even though already Displayed.
        let firsts: Vec<u8> = f.driver.windows().iter().map(|w| w[0]).collect();
        assert_eq!(firsts, vec![0x01, 0x02, 0x01]);
    }

    #[test]
    fn test_host_output_suppressed_while_client_owns_display() {
        let f = fixture();
        let (id, _rx) = login(&f.server);
        get_tty(&f.server, id, 1, "");

        f.server.write_host_window(&[0xAA]).unwrap();
        write_braille(&f.server, id, &[0x01], 0);
        f.server.write_host_window(&[0xBB]).unwrap();

        assert_eq!(f.driver.windows(), vec![vec![0xAA]]);
    }

    #[test]
    fn test_consumed_command_becomes_noop() {
        // Arrange
        let f = fixture();
        let (id, mut rx) = login(&f.server);
        get_tty(&f.server, id, 1, "");
        drain(&mut rx);
        f.driver.push_key(0x21, 0x0105);

        // Act
        let result = f.server.read_command().unwrap();

        // Assert
        assert_eq!(result, Some(command::NOOP));
        assert_eq!(drain(&mut rx), vec![codec::key(0x0105)]);
    }

    #[test]
    fn test_keycode_client_receives_keycode() {
        let f = fixture();
        let (id, mut rx) = login(&f.server);
        get_tty(&f.server, id, 1, "Papenmeier");
        f.server
            .handle_packet(id, &Packet::new(PacketType::UnignoreKeySet, 0x21u32.to_be_bytes().to_vec()));
        drain(&mut rx);
        f.driver.push_key(0x21, 0x0105);

        f.server.read_command().unwrap();

        assert_eq!(drain(&mut rx), vec![codec::key(0x21)]);
    }

    #[test]
    fn test_reserved_command_goes_to_host() {
        let f = fixture();
        let (id, mut rx) = login(&f.server);
        get_tty(&f.server, id, 1, "");
        drain(&mut rx);
        f.driver.push_key(0x30, command::SWITCHVT_NEXT);

        let result = f.server.read_command().unwrap();

        assert_eq!(result, Some(command::SWITCHVT_NEXT));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_raw_owner_receives_device_packets_and_errors() {
        // Arrange
        let f = fixture();
        let (id, mut rx) = login(&f.server);
        let mut raw = RAW_MAGIC.to_be_bytes().to_vec();
        raw.push(10);
        raw.extend_from_slice(b"Papenmeier");
        f.server.handle_packet(id, &Packet::new(PacketType::GetRaw, raw));
        drain(&mut rx);
        f.driver.push_raw_input(Ok(vec![0x02, 0x03]));
        f.driver.push_raw_input(Err(DriverError::Io("unplugged".to_string())));

        // Act
        f.server.read_command().unwrap();
        f.server.read_command().unwrap();

        // Assert
        assert_eq!(
            drain(&mut rx),
            vec![
                codec::raw_packet(&[0x02, 0x03]),
                codec::exception(ErrorCode::DriverError, PacketType::Packet.code(), &[]),
            ]
        );
        f.server.write_host_window(&[1]).unwrap();
        assert!(f.driver.windows().is_empty());
    }

    #[test]
    fn test_api_driver_passes_host_output_through() {
        let f = fixture();
        let mut api = ApiDriver::new(Arc::clone(&f.server));

        api.write_window(&[7]).unwrap();
        api.write_status(&[8]).unwrap();

        assert_eq!(api.name(), "Papenmeier");
        assert_eq!(f.driver.windows(), vec![vec![7]]);
        assert_eq!(f.driver.status_writes(), vec![vec![8]]);
    }
}
