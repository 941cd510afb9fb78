//! Display and key arbitration.
//!
//! Both questions ("whose window is shown?" and "who gets this key?") are
//! answered by walking the focus path of the tty tree.  The walk starts at
//! the deepest focused node and moves toward the root: a client attached
//! deeper down, such as an editor inside a terminal multiplexer, wins over
//! one attached to the console that contains it.  An ancestor is consulted
//! only when nobody below it wants the display or the key.
//!
//! Within one node clients are tried in attach order, and the first match
//! wins, so an event is never delivered twice.
//!
//! Walks run under the registry read lock.  Tty nodes are only freed under
//! the write lock, so a node cannot disappear mid-walk.

use brlapi_core::domain::window::BufferState;
use brlapi_core::{DeliveryMode, TtyTree};
use tracing::debug;

use super::server::{BrlapiServer, ConnectionId, ConnectionRecord, Registry};

/// The connection whose window should be on the display.
pub(crate) fn find_display_owner(registry: &Registry, active_console: u32) -> Option<&ConnectionRecord> {
    registry.tree.find_on_focus_path(active_console, |connections| {
        connections
            .iter()
            .filter_map(|id| registry.connections.get(id))
            .find(|record| record.shared.buffer_state() != BufferState::Empty)
    })
}

/// The connection that consumes a key event.
///
/// `keycode` is `None` when the driver only reports commands; keycode clients
/// then never match.
pub(crate) fn find_key_recipient(
    registry: &Registry,
    active_console: u32,
    command: u32,
    keycode: Option<u32>,
) -> Option<&ConnectionRecord> {
    registry.tree.find_on_focus_path(active_console, |connections| {
        connections
            .iter()
            .filter_map(|id| registry.connections.get(id))
            .find(|record| accepts_key(record, command, keycode))
    })
}

fn accepts_key(record: &ConnectionRecord, command: u32, keycode: Option<u32>) -> bool {
    let value = match (record.mode, keycode) {
        (DeliveryMode::Keycodes, None) => return false,
        (mode, keycode) => mode.mask_key(command, keycode.unwrap_or_default()),
    };
    record.shared.mask().contains(value)
}

impl BrlapiServer {
    /// Points the root's focus at the host's active console and returns it.
    pub fn sync_root_focus(&self) -> u32 {
        let active = self.host.active_console();
        let mut registry = self.registry_mut();
        let root = TtyTree::<ConnectionId>::ROOT;
        if registry.tree.node(root).and_then(|n| n.focus()) != Some(active) {
            debug!(active, "host console changed");
            // ROOT is permanent.
            let _ = registry.tree.set_focus(root, Some(active));
        }
        active
    }

    /// The connection whose window the display should show right now.
    pub fn display_owner(&self) -> Option<ConnectionId> {
        let active = self.sync_root_focus();
        let registry = self.registry();
        find_display_owner(&registry, active).map(|record| record.shared.id())
    }

    /// The connection that would consume the event right now.
    pub fn key_recipient(&self, command: u32, keycode: Option<u32>) -> Option<ConnectionId> {
        let active = self.sync_root_focus();
        let registry = self.registry();
        find_key_recipient(&registry, active, command, keycode).map(|record| record.shared.id())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
