//! The server context: every connection, the tty tree, and the driver.
//!
//! One [`BrlapiServer`] is built at startup and shared by `Arc` between the
//! socket sessions, the maintenance task and the display output loop.  It
//! replaces what would otherwise be process globals.
//!
//! # Locks (for beginners)
//!
//! Several tasks touch the server at once, so its state is split across
//! locks that are always taken in this order:
//!
//! ```text
//! registry (RwLock)  →  raw owner  →  last writer  →  mask | window  →  driver
//! ```
//!
//! - The **registry** guards structure: which connections exist, where they
//!   sit in the tty tree, and their authentication state.  Arbitration walks
//!   hold the read side; attaching, detaching and garbage collection hold the
//!   write side, so a node is never freed under a walk.
//! - Each connection's **mask** and **window** have their own mutexes so a
//!   client updating its key mask does not wait for another client's content
//!   to be flushed.  No path holds both.
//! - The **driver** lock is taken last and never while a mask or window lock
//!   is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use brlapi_core::domain::window::BufferState;
use brlapi_core::{BrailleWindow, DeliveryMode, RangeSet, TtyTree};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::infrastructure::driver::{BrailleDriver, DriverError, DriverInfo, HostConsole};

/// Identifies one client connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a new connection was turned away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    #[error("too many unauthenticated connections (limit {limit})")]
    TooManyUnauthenticated { limit: usize },

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Tunables taken from configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub auth_key: Vec<u8>,
    pub unauth_max: usize,
    pub unauth_timeout: Duration,
    pub max_ttys: usize,
}

impl ServerSettings {
    pub fn new(auth_key: impl Into<Vec<u8>>) -> Self {
        Self {
            auth_key: auth_key.into(),
            unauth_max: 5,
            unauth_timeout: Duration::from_secs(30),
            max_ttys: 4096,
        }
    }
}

// ── Per-connection state ──────────────────────────────────────────────────────

/// A connection's display window and whether it has been shown.
#[derive(Debug, Default)]
pub(crate) struct WindowSlot {
    pub(crate) window: Option<BrailleWindow>,
    pub(crate) state: BufferState,
}

/// The part of a connection reachable without the registry lock.
///
/// Sessions, the output loop and request handlers all hold an `Arc` to it.
#[derive(Debug)]
pub struct ConnectionShared {
    id: ConnectionId,
    outbox: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pub(crate) mask: Mutex<RangeSet>,
    pub(crate) window: Mutex<WindowSlot>,
    kick: Notify,
}

impl ConnectionShared {
    fn new(id: ConnectionId, outbox: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            outbox: Mutex::new(Some(outbox)),
            mask: Mutex::new(RangeSet::new()),
            window: Mutex::new(WindowSlot::default()),
            kick: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an encoded packet for the session's writer.  Dropped silently
    /// once the connection is closing.
    pub fn send(&self, bytes: Vec<u8>) {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = outbox.as_ref() {
            let _ = tx.send(bytes);
        }
    }

    /// Resolves once the server wants this connection's session to end.
    pub async fn kicked(&self) {
        self.kick.notified().await;
    }

    /// Closes the outbox so the writer drains what is queued and stops.
    fn close(&self) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.kick.notify_one();
    }

    pub(crate) fn mask(&self) -> MutexGuard<'_, RangeSet> {
        self.mask.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn window(&self) -> MutexGuard<'_, WindowSlot> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn buffer_state(&self) -> BufferState {
        self.window().state
    }
}

/// Registry entry for one connection.  Only changed under the write lock.
#[derive(Debug)]
pub(crate) struct ConnectionRecord {
    pub(crate) shared: Arc<ConnectionShared>,
    pub(crate) authenticated: bool,
    pub(crate) tty: Option<brlapi_core::TtyId>,
    pub(crate) mode: DeliveryMode,
    pub(crate) connected_at: Instant,
    pub(crate) peer: String,
}

/// Everything guarded by the structural lock.
#[derive(Debug)]
pub(crate) struct Registry {
    pub(crate) tree: TtyTree<ConnectionId>,
    pub(crate) connections: HashMap<ConnectionId, ConnectionRecord>,
    pub(crate) unauthenticated: usize,
    unauth_warned: bool,
    next_id: u64,
    closed: bool,
}

impl Registry {
    fn new(max_ttys: usize) -> Self {
        Self {
            tree: TtyTree::with_node_limit(max_ttys),
            connections: HashMap::new(),
            unauthenticated: 0,
            unauth_warned: false,
            next_id: 1,
            closed: false,
        }
    }

    /// Records that one unauthenticated connection went away or logged in.
    pub(crate) fn release_unauthenticated(&mut self, limit: usize) {
        self.unauthenticated = self.unauthenticated.saturating_sub(1);
        if self.unauthenticated < limit {
            self.unauth_warned = false;
        }
    }
}

/// Maps raw cell characters the braille block does not cover to dots.
pub type Translation = Box<dyn Fn(char) -> u8 + Send + Sync>;

/// ASCII graphic characters keep their code; everything else is blank.
fn default_translation(c: char) -> u8 {
    if c.is_ascii_graphic() {
        c as u8
    } else {
        0
    }
}

// ── Server context ────────────────────────────────────────────────────────────

/// Shared state of the whole BrlAPI server.
pub struct BrlapiServer {
    pub(crate) settings: ServerSettings,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) raw_owner: Mutex<Option<ConnectionId>>,
    pub(crate) last_writer: Mutex<Option<ConnectionId>>,
    pub(crate) driver: Mutex<Box<dyn BrailleDriver>>,
    pub(crate) info: DriverInfo,
    pub(crate) host: Arc<dyn HostConsole>,
    pub(crate) translate: Translation,
}

impl BrlapiServer {
    pub fn new(
        settings: ServerSettings,
        driver: Box<dyn BrailleDriver>,
        host: Arc<dyn HostConsole>,
    ) -> Self {
        let info = driver.info();
        info!(
            driver = %info.name,
            columns = info.size.columns,
            rows = info.size.rows,
            "braille driver attached"
        );
        Self {
            registry: RwLock::new(Registry::new(settings.max_ttys)),
            settings,
            raw_owner: Mutex::new(None),
            last_writer: Mutex::new(None),
            driver: Mutex::new(driver),
            info,
            host,
            translate: Box::new(default_translation),
        }
    }

    /// Replaces the character translation used when rendering windows.
    pub fn with_translation(mut self, translate: Translation) -> Self {
        self.translate = translate;
        self
    }

    pub fn driver_info(&self) -> &DriverInfo {
        &self.info
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn raw_slot(&self) -> MutexGuard<'_, Option<ConnectionId>> {
        self.raw_owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn last_writer(&self) -> MutexGuard<'_, Option<ConnectionId>> {
        self.last_writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn driver(&self) -> MutexGuard<'_, Box<dyn BrailleDriver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Registers a freshly accepted socket.
    ///
    /// Returns the connection's shared state and the receiving end of its
    /// outbox, which the session drains into the socket.
    ///
    /// # Errors
    ///
    /// [`AcceptError::TooManyUnauthenticated`] when the unauthenticated limit is
    /// reached; the warning is logged once until the count drops again.
    pub fn accept(
        &self,
        peer: &str,
    ) -> Result<(Arc<ConnectionShared>, mpsc::UnboundedReceiver<Vec<u8>>), AcceptError> {
        let mut registry = self.registry_mut();
        if registry.closed {
            return Err(AcceptError::ShuttingDown);
        }
        let limit = self.settings.unauth_max;
        if registry.unauthenticated >= limit {
            if !registry.unauth_warned {
                warn!(limit, "too many unauthenticated connections, refusing new ones");
                registry.unauth_warned = true;
            }
            return Err(AcceptError::TooManyUnauthenticated { limit });
        }

        let id = ConnectionId(registry.next_id);
        registry.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared::new(id, tx));
        // UNATTACHED always exists, so this cannot fail.
        let _ = registry.tree.attach(TtyTree::<ConnectionId>::UNATTACHED, id);
        registry.connections.insert(
            id,
            ConnectionRecord {
                shared: Arc::clone(&shared),
                authenticated: false,
                tty: None,
                mode: DeliveryMode::Commands,
                connected_at: Instant::now(),
                peer: peer.to_string(),
            },
        );
        registry.unauthenticated += 1;
        info!(%id, peer, "connection accepted");
        Ok((shared, rx))
    }

    /// Tears a connection down: releases raw mode (resetting the driver), the
    /// tty and its window, then closes the outbox.  Calling it twice is
    /// harmless.
    pub fn disconnect(&self, id: ConnectionId) {
        let was_raw = {
            let mut registry = self.registry_mut();
            let Some(record) = registry.connections.remove(&id) else {
                return;
            };
            if !record.authenticated {
                registry.release_unauthenticated(self.settings.unauth_max);
            }

            let was_raw = {
                let mut raw = self.raw_slot();
                if *raw == Some(id) {
                    *raw = None;
                    true
                } else {
                    false
                }
            };
            {
                let mut last = self.last_writer();
                if *last == Some(id) {
                    *last = None;
                }
            }

            match record.tty {
                Some(tty) => {
                    registry.tree.detach(tty, id);
                    let freed = registry.tree.collect_garbage(tty);
                    debug!(%id, freed = freed.len(), "released tty on disconnect");
                }
                None => {
                    registry
                        .tree
                        .detach(TtyTree::<ConnectionId>::UNATTACHED, id);
                }
            }
            record.shared.close();
            info!(%id, peer = %record.peer, "connection closed");
            was_raw
        };

        if was_raw {
            warn!(%id, "client left raw mode abruptly, resetting driver");
            self.reset_driver();
        }
    }

    /// Resets the driver, asking the host for a restart if that fails.
    pub(crate) fn reset_driver(&self) {
        let result = self.driver().reset();
        if let Err(e) = result {
            warn!("driver reset failed: {e}");
            self.host.restart_driver();
        }
    }

    /// Drops every unauthenticated connection older than the timeout.
    /// Returns how many were dropped.
    pub fn expire_unauthenticated(&self, now: Instant) -> usize {
        let timeout = self.settings.unauth_timeout;
        let expired: Vec<ConnectionId> = self
            .registry()
            .connections
            .iter()
            .filter(|(_, record)| {
                !record.authenticated && now.saturating_duration_since(record.connected_at) > timeout
            })
            .map(|(&id, _)| id)
            .collect();
        for &id in &expired {
            info!(%id, "dropping connection that never authenticated");
            self.disconnect(id);
        }
        expired.len()
    }

    /// Closes every connection and refuses new ones.
    pub fn shutdown(&self) {
        let ids: Vec<ConnectionId> = {
            let mut registry = self.registry_mut();
            registry.closed = true;
            registry.connections.keys().copied().collect()
        };
        info!(connections = ids.len(), "closing all connections");
        for id in ids {
            self.disconnect(id);
        }
    }

    /// Swaps in a freshly started driver after a restart.  The new driver
    /// must have the same geometry, which windows were sized for.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unsupported`] if the geometry differs.
    pub fn replace_driver(&self, driver: Box<dyn BrailleDriver>) -> Result<(), DriverError> {
        if driver.display_size() != self.info.size {
            return Err(DriverError::Unsupported(format!(
                "{} has a different display size",
                driver.code()
            )));
        }
        *self.driver() = driver;
        info!("braille driver restarted");
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn connection_count(&self) -> usize {
        self.registry().connections.len()
    }

    pub fn unauthenticated_count(&self) -> usize {
        self.registry().unauthenticated
    }

    /// Number of tty nodes, not counting the two roots.
    pub fn tty_count(&self) -> usize {
        self.registry().tree.len()
    }

    pub fn raw_owner(&self) -> Option<ConnectionId> {
        *self.raw_slot()
    }

    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.registry()
            .connections
            .get(&id)
            .is_some_and(|record| record.authenticated)
    }

    /// The window content of `id`, if it holds a tty.
    pub fn window_of(&self, id: ConnectionId) -> Option<BrailleWindow> {
        let shared = Arc::clone(&self.registry().connections.get(&id)?.shared);
        let slot = shared.window();
        slot.window.clone()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::driver::console::StaticConsole;
    use crate::infrastructure::driver::mock::MockDriver;
    use crate::infrastructure::driver::MockHostConsole;

    fn make_server(settings: ServerSettings) -> BrlapiServer {
        let (driver, _handle) = MockDriver::papenmeier();
        BrlapiServer::new(settings, Box::new(driver), Arc::new(StaticConsole::new(1)))
    }

    #[test]
    fn test_accept_assigns_increasing_ids() {
        // Arrange
        let server = make_server(ServerSettings::new("key"));

        // Act
        let (a, _rx_a) = server.accept("a").unwrap();
        let (b, _rx_b) = server.accept("b").unwrap();

        // Assert
        assert!(a.id() < b.id());
        assert_eq!(server.connection_count(), 2);
        assert_eq!(server.unauthenticated_count(), 2);
    }

    #[test]
    fn test_accept_refuses_at_unauthenticated_limit() {
        let mut settings = ServerSettings::new("key");
        settings.unauth_max = 2;
        let server = make_server(settings);
        let _first = server.accept("1").unwrap();
        let _second = server.accept("2").unwrap();

        let result = server.accept("3");

        assert_eq!(
            result.err(),
            Some(AcceptError::TooManyUnauthenticated { limit: 2 })
        );
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn test_disconnect_frees_unauthenticated_slot() {
        let mut settings = ServerSettings::new("key");
        settings.unauth_max = 1;
        let server = make_server(settings);
        let (first, _rx) = server.accept("1").unwrap();

        server.disconnect(first.id());

        assert_eq!(server.unauthenticated_count(), 0);
        assert!(server.accept("2").is_ok());
    }

    #[test]
    fn test_disconnect_closes_outbox_after_queued_packets() {
        // Arrange
        let server = make_server(ServerSettings::new("key"));
        let (shared, mut rx) = server.accept("peer").unwrap();
        shared.send(vec![1, 2, 3]);

        // Act
        server.disconnect(shared.id());
        shared.send(vec![4]);

        // Assert
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_expire_unauthenticated_drops_only_old_connections() {
        let server = make_server(ServerSettings::new("key"));
        let (old, _rx) = server.accept("old").unwrap();

        let none = server.expire_unauthenticated(Instant::now());
        let dropped = server.expire_unauthenticated(Instant::now() + Duration::from_secs(31));

        assert_eq!(none, 0);
        assert_eq!(dropped, 1);
        assert!(!server.is_authenticated(old.id()));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_shutdown_refuses_new_connections() {
        let server = make_server(ServerSettings::new("key"));
        let _conn = server.accept("x").unwrap();

        server.shutdown();

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.accept("y").err(), Some(AcceptError::ShuttingDown));
    }

    #[test]
    fn test_failed_reset_asks_host_for_restart() {
        // Arrange
        let (driver, handle) = MockDriver::papenmeier();
        handle.fail_resets();
        let mut host = MockHostConsole::new();
        host.expect_restart_driver().times(1).return_const(());
        let server = BrlapiServer::new(ServerSettings::new("k"), Box::new(driver), Arc::new(host));

        // Act
        server.reset_driver();

        // Assert
        assert_eq!(handle.reset_calls(), 1);
    }

    #[test]
    fn test_replace_driver_rejects_other_geometry() {
        let server = make_server(ServerSettings::new("key"));
        let (wide, _handle) = MockDriver::new(DriverInfo {
            size: brlapi_core::DisplaySize::new(80, 1),
            ..server.driver_info().clone()
        });
        let (same, _handle) = MockDriver::papenmeier();

        assert!(server.replace_driver(Box::new(wide)).is_err());
        assert!(server.replace_driver(Box::new(same)).is_ok());
    }
}
