//! Host console adapters.
//!
//! On Linux the active virtual console is published in
//! `/sys/class/tty/tty0/active` as e.g. `tty3`.  Where that file does not
//! exist, [`StaticConsole`] reports a console number set by the caller.
//!
//! Both adapters record driver restart requests in a flag that the output
//! loop polls with `take_restart_request`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{debug, warn};

use super::HostConsole;

/// Default location of the active-console file.
pub const SYSFS_ACTIVE_CONSOLE: &str = "/sys/class/tty/tty0/active";

/// Reads the active console from sysfs on every call.
#[derive(Debug)]
pub struct SysfsConsole {
    path: PathBuf,
    fallback: u32,
    restart_requested: AtomicBool,
}

impl SysfsConsole {
    pub fn new(path: impl Into<PathBuf>, fallback: u32) -> Self {
        Self {
            path: path.into(),
            fallback,
            restart_requested: AtomicBool::new(false),
        }
    }

    /// Returns `true` once for each restart request.
    pub fn take_restart_request(&self) -> bool {
        self.restart_requested.swap(false, Ordering::AcqRel)
    }
}

impl HostConsole for SysfsConsole {
    fn active_console(&self) -> u32 {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => parse_console_name(&text).unwrap_or(self.fallback),
            Err(e) => {
                debug!("cannot read {}: {e}", self.path.display());
                self.fallback
            }
        }
    }

    fn restart_driver(&self) {
        warn!("braille driver restart requested");
        self.restart_requested.store(true, Ordering::Release);
    }
}

/// A console number held in memory.
#[derive(Debug, Default)]
pub struct StaticConsole {
    active: AtomicU32,
    restart_requested: AtomicBool,
}

impl StaticConsole {
    pub fn new(active: u32) -> Self {
        Self {
            active: AtomicU32::new(active),
            restart_requested: AtomicBool::new(false),
        }
    }

    /// Simulates the host switching consoles.
    pub fn switch_to(&self, console: u32) {
        self.active.store(console, Ordering::Release);
    }

    /// Returns `true` once for each restart request.
    pub fn take_restart_request(&self) -> bool {
        self.restart_requested.swap(false, Ordering::AcqRel)
    }
}

impl HostConsole for StaticConsole {
    fn active_console(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    fn restart_driver(&self) {
        warn!("braille driver restart requested");
        self.restart_requested.store(true, Ordering::Release);
    }
}

/// Parses `tty<N>` into `N`.
fn parse_console_name(text: &str) -> Option<u32> {
    text.trim().strip_prefix("tty")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_console_name() {
        assert_eq!(parse_console_name("tty3\n"), Some(3));
        assert_eq!(parse_console_name("tty12"), Some(12));
        assert_eq!(parse_console_name("ttyS0"), None);
        assert_eq!(parse_console_name(""), None);
    }

    #[test]
    fn test_sysfs_console_reads_file() {
        // Arrange
        let path = std::env::temp_dir().join(format!("brlapi-active-{}", std::process::id()));
        std::fs::write(&path, "tty5\n").unwrap();
        let console = SysfsConsole::new(&path, 1);

        // Act
        let active = console.active_console();

        // Assert
        assert_eq!(active, 5);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sysfs_console_falls_back_when_missing() {
        let console = SysfsConsole::new("/nonexistent/brlapi/active", 7);
        assert_eq!(console.active_console(), 7);
    }

    #[test]
    fn test_restart_request_is_taken_once() {
        let console = StaticConsole::new(1);
        console.restart_driver();
        assert!(console.take_restart_request());
        assert!(!console.take_restart_request());
    }

    #[test]
    fn test_static_console_switch() {
        let console = StaticConsole::new(1);
        console.switch_to(4);
        assert_eq!(console.active_console(), 4);
    }
}
