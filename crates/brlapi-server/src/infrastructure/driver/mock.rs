//! Scripted driver for tests.
//!
//! [`MockDriver`] is moved into the server like any real driver; the paired
//! [`MockDriverHandle`] stays with the test to queue key presses and raw
//! input and to inspect what the server wrote.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use brlapi_core::domain::keys::command;
use brlapi_core::DisplaySize;

use super::{BrailleDriver, DriverError, DriverInfo};

#[derive(Debug, Default)]
struct Script {
    windows: Vec<Vec<u8>>,
    status: Vec<Vec<u8>>,
    packets_written: Vec<Vec<u8>>,
    commands: VecDeque<u32>,
    keys: VecDeque<u32>,
    key_commands: HashMap<u32, u32>,
    raw_input: VecDeque<Result<Vec<u8>, DriverError>>,
    reset_calls: usize,
    reset_fails: bool,
}

/// A driver whose input is scripted and whose output is recorded.
pub struct MockDriver {
    info: DriverInfo,
    script: Arc<Mutex<Script>>,
}

/// Test-side handle onto a [`MockDriver`].
#[derive(Clone)]
pub struct MockDriverHandle {
    script: Arc<Mutex<Script>>,
}

impl MockDriver {
    /// Creates a driver with the given identity and capabilities.
    pub fn new(info: DriverInfo) -> (Self, MockDriverHandle) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                info,
                script: Arc::clone(&script),
            },
            MockDriverHandle { script },
        )
    }

    /// A 40×1 raw- and keycode-capable driver named `Papenmeier` (`pm`).
    pub fn papenmeier() -> (Self, MockDriverHandle) {
        Self::new(DriverInfo {
            code: "pm".to_string(),
            name: "Papenmeier".to_string(),
            size: DisplaySize::new(40, 1),
            supports_raw: true,
            supports_keycodes: true,
        })
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockDriverHandle {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a command for `read_command`.
    pub fn push_command(&self, cmd: u32) {
        self.script().commands.push_back(cmd);
    }

    /// Queues a keycode for `read_key`, translating to `cmd`.
    pub fn push_key(&self, keycode: u32, cmd: u32) {
        let mut script = self.script();
        script.keys.push_back(keycode);
        script.key_commands.insert(keycode, cmd);
    }

    /// Queues the result of the next `read_packet`.
    pub fn push_raw_input(&self, packet: Result<Vec<u8>, DriverError>) {
        self.script().raw_input.push_back(packet);
    }

    /// Makes every later `reset` fail.
    pub fn fail_resets(&self) {
        self.script().reset_fails = true;
    }

    /// Every window written so far.
    pub fn windows(&self) -> Vec<Vec<u8>> {
        self.script().windows.clone()
    }

    /// Every status write so far.
    pub fn status_writes(&self) -> Vec<Vec<u8>> {
        self.script().status.clone()
    }

    /// Every raw packet written so far.
    pub fn packets_written(&self) -> Vec<Vec<u8>> {
        self.script().packets_written.clone()
    }

    /// Number of `reset` calls so far.
    pub fn reset_calls(&self) -> usize {
        self.script().reset_calls
    }
}

impl BrailleDriver for MockDriver {
    fn code(&self) -> &str {
        &self.info.code
    }

    fn name(&self) -> &str {
        &self.info.name
    }

    fn display_size(&self) -> DisplaySize {
        self.info.size
    }

    fn supports_raw(&self) -> bool {
        self.info.supports_raw
    }

    fn supports_keycodes(&self) -> bool {
        self.info.supports_keycodes
    }

    fn write_window(&mut self, cells: &[u8]) -> Result<(), DriverError> {
        self.script().windows.push(cells.to_vec());
        Ok(())
    }

    fn write_status(&mut self, cells: &[u8]) -> Result<(), DriverError> {
        self.script().status.push(cells.to_vec());
        Ok(())
    }

    fn read_command(&mut self) -> Result<Option<u32>, DriverError> {
        Ok(self.script().commands.pop_front())
    }

    fn read_key(&mut self) -> Result<Option<u32>, DriverError> {
        Ok(self.script().keys.pop_front())
    }

    fn key_to_command(&mut self, keycode: u32) -> u32 {
        self.script()
            .key_commands
            .get(&keycode)
            .copied()
            .unwrap_or(command::NOOP)
    }

    fn write_packet(&mut self, data: &[u8]) -> Result<(), DriverError> {
        self.script().packets_written.push(data.to_vec());
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Vec<u8>>, DriverError> {
        self.script().raw_input.pop_front().transpose()
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        let mut script = self.script();
        script.reset_calls += 1;
        if script.reset_fails {
            Err(DriverError::Io("reset refused".to_string()))
        } else {
            Ok(())
        }
    }
}
