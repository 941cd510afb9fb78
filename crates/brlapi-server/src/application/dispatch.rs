//! Request dispatch: one complete packet in, replies queued on the outbox.
//!
//! # Reply framing (for beginners)
//!
//! A failed request is answered in one of two shapes.  Requests that always
//! get a reply (driver queries, GetTty, key masking, raw mode) fail with an
//! **Error** packet carrying just the code.  Requests that are normally
//! silent (Write, SetFocus, raw Packet) fail with an **Exception** packet that
//! also echoes the offending request, because the client cannot otherwise
//! tell which of its fire-and-forget packets went wrong.
//!
//! Before authentication any failure closes the connection.  Afterwards
//! errors are reported and the connection stays open.

use std::sync::Arc;

use brlapi_core::domain::range_set::RangeSetError;
use brlapi_core::domain::tty_tree::{PathLookup, TreeError};
use brlapi_core::domain::window::BufferState;
use brlapi_core::protocol::codec::{self, WriteCommand};
use brlapi_core::protocol::messages::PROTOCOL_VERSION;
use brlapi_core::{BrailleWindow, DeliveryMode, ErrorCode, Packet, PacketType, TtyId, TtyTree};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::server::{BrlapiServer, ConnectionId, ConnectionShared};

/// What the session should do after a packet was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

/// Which reply shape a failed request gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Error,
    Exception,
}

/// A request that could not be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code} ({framing:?})")]
pub struct RequestError {
    pub code: ErrorCode,
    pub framing: Framing,
}

impl RequestError {
    /// Encodes the reply for `packet`.
    pub fn encode(&self, packet: &Packet) -> Vec<u8> {
        match self.framing {
            Framing::Error => codec::error(self.code),
            Framing::Exception => codec::exception(self.code, packet.packet_type, &packet.payload),
        }
    }
}

/// Reply shape per request type.  Unknown types get an Exception.
pub fn framing_for(kind: Option<PacketType>) -> Framing {
    match kind {
        Some(
            PacketType::GetDriverId
            | PacketType::GetDriverName
            | PacketType::GetDisplaySize
            | PacketType::GetTty
            | PacketType::LeaveTty
            | PacketType::IgnoreKeyRange
            | PacketType::UnignoreKeyRange
            | PacketType::IgnoreKeySet
            | PacketType::UnignoreKeySet
            | PacketType::GetRaw
            | PacketType::LeaveRaw,
        ) => Framing::Error,
        _ => Framing::Exception,
    }
}

/// Snapshot of a connection's registry entry taken before handling.
struct Caller {
    id: ConnectionId,
    shared: Arc<ConnectionShared>,
    tty: Option<TtyId>,
}

/// Ignore removes values from the deliverable set, unignore adds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskChange {
    Ignore,
    Unignore,
}

type HandlerResult = Result<(), ErrorCode>;

impl BrlapiServer {
    /// Handles one complete packet from connection `id`.
    pub fn handle_packet(&self, id: ConnectionId, packet: &Packet) -> Disposition {
        let caller = {
            let registry = self.registry();
            let Some(record) = registry.connections.get(&id) else {
                return Disposition::Close;
            };
            if !record.authenticated {
                let shared = Arc::clone(&record.shared);
                drop(registry);
                return self.authenticate(id, &shared, packet);
            }
            Caller {
                id,
                shared: Arc::clone(&record.shared),
                tty: record.tty,
            }
        };

        let kind = packet.kind();
        let payload = packet.payload.as_slice();
        let result = match kind {
            Some(PacketType::GetDriverId) => self.get_driver_string(&caller, payload, PacketType::GetDriverId),
            Some(PacketType::GetDriverName) => self.get_driver_string(&caller, payload, PacketType::GetDriverName),
            Some(PacketType::GetDisplaySize) => self.get_display_size(&caller, payload),
            Some(PacketType::GetTty) => self.get_tty(&caller, payload),
            Some(PacketType::SetFocus) => self.set_focus(&caller, payload),
            Some(PacketType::LeaveTty) => self.leave_tty(&caller),
            Some(PacketType::IgnoreKeyRange) => self.key_range(&caller, payload, MaskChange::Ignore),
            Some(PacketType::UnignoreKeyRange) => self.key_range(&caller, payload, MaskChange::Unignore),
            Some(PacketType::IgnoreKeySet) => self.key_set(&caller, payload, MaskChange::Ignore),
            Some(PacketType::UnignoreKeySet) => self.key_set(&caller, payload, MaskChange::Unignore),
            Some(PacketType::Write) => self.write(&caller, payload),
            Some(PacketType::GetRaw) => self.get_raw(&caller, payload),
            Some(PacketType::LeaveRaw) => self.leave_raw(&caller),
            Some(PacketType::Packet) => self.raw_packet(&caller, payload),
            _ => Err(ErrorCode::UnknownInstruction),
        };

        if let Err(code) = result {
            let error = RequestError {
                code,
                framing: framing_for(kind),
            };
            debug!(%id, packet_type = packet.packet_type, "request failed: {error}");
            caller.shared.send(error.encode(packet));
        }
        Disposition::Continue
    }

    /// Handles a packet the framer discarded for exceeding the size limit.
    pub fn handle_oversized(&self, id: ConnectionId, packet_type: u32, size: usize) -> Disposition {
        let registry = self.registry();
        let Some(record) = registry.connections.get(&id) else {
            return Disposition::Close;
        };
        if record.authenticated {
            warn!(%id, packet_type, size, "discarded oversized packet");
            Disposition::Continue
        } else {
            warn!(%id, size, "oversized packet before authentication");
            record.shared.send(codec::error(ErrorCode::ConnRefused));
            Disposition::Close
        }
    }

    // ── Authentication ───────────────────────────────────────────────────────

    fn authenticate(&self, id: ConnectionId, shared: &ConnectionShared, packet: &Packet) -> Disposition {
        if packet.kind() != Some(PacketType::Auth) {
            warn!(%id, packet_type = packet.packet_type, "first packet is not authentication");
            shared.send(codec::error(ErrorCode::ConnRefused));
            return Disposition::Close;
        }
        let request = match codec::decode_auth(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(%id, "malformed authentication: {e}");
                shared.send(codec::error(ErrorCode::ConnRefused));
                return Disposition::Close;
            }
        };
        if request.protocol_version != PROTOCOL_VERSION {
            warn!(%id, version = request.protocol_version, "unsupported protocol version");
            shared.send(codec::error(ErrorCode::ProtocolVersion));
            return Disposition::Close;
        }
        if !bool::from(request.key.ct_eq(self.settings.auth_key.as_slice())) {
            warn!(%id, "authentication failed");
            shared.send(codec::error(ErrorCode::ConnRefused));
            return Disposition::Close;
        }

        {
            let mut registry = self.registry_mut();
            let Some(record) = registry.connections.get_mut(&id) else {
                return Disposition::Close;
            };
            record.authenticated = true;
            registry.release_unauthenticated(self.settings.unauth_max);
        }
        info!(%id, "client authenticated");
        shared.send(codec::ack());
        Disposition::Continue
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    fn is_raw(&self, id: ConnectionId) -> bool {
        *self.raw_slot() == Some(id)
    }

    /// Rejects tty requests from raw connections or connections without a tty.
    fn require_tty(&self, caller: &Caller) -> Result<TtyId, ErrorCode> {
        if self.is_raw(caller.id) {
            return Err(ErrorCode::IllegalInstruction);
        }
        caller.tty.ok_or(ErrorCode::IllegalInstruction)
    }

    fn get_driver_string(&self, caller: &Caller, payload: &[u8], kind: PacketType) -> HandlerResult {
        if !payload.is_empty() {
            return Err(ErrorCode::InvalidPacket);
        }
        if self.is_raw(caller.id) {
            return Err(ErrorCode::IllegalInstruction);
        }
        let value = if kind == PacketType::GetDriverId {
            &self.info.code
        } else {
            &self.info.name
        };
        caller.shared.send(codec::driver_string(kind, value));
        Ok(())
    }

    fn get_display_size(&self, caller: &Caller, payload: &[u8]) -> HandlerResult {
        if !payload.is_empty() {
            return Err(ErrorCode::InvalidPacket);
        }
        if self.is_raw(caller.id) {
            return Err(ErrorCode::IllegalInstruction);
        }
        let size = self.info.size;
        caller.shared.send(codec::display_size(size.columns, size.rows));
        Ok(())
    }

    fn get_tty(&self, caller: &Caller, payload: &[u8]) -> HandlerResult {
        if self.is_raw(caller.id) {
            return Err(ErrorCode::IllegalInstruction);
        }
        let request = codec::decode_get_tty(payload).map_err(|e| e.error_code())?;
        let mode = DeliveryMode::from_request(
            &request.mode_name,
            &self.info.name,
            self.info.supports_keycodes,
        )
        .ok_or(ErrorCode::OpNotSupp)?;

        let mut registry = self.registry_mut();
        let held = caller.tty;
        let lookup = registry.tree.lookup(&request.path);
        let target = match (lookup, held) {
            (PathLookup::Found(node), Some(current)) if node == current => {
                let same_mode = registry
                    .connections
                    .get(&caller.id)
                    .is_some_and(|record| record.mode == mode);
                return Err(if same_mode {
                    ErrorCode::IllegalInstruction
                } else {
                    ErrorCode::OpNotSupp
                });
            }
            (_, Some(_)) => return Err(ErrorCode::InvalidParameter),
            (PathLookup::Found(node), None) => node,
            (PathLookup::Missing { deepest, matched }, None) => registry
                .tree
                .create_path(deepest, &request.path[matched..])
                .map_err(|e| {
                    warn!(id = %caller.id, "cannot create tty path: {e}");
                    tree_error_code(&e)
                })?,
        };

        let mask = match mode.default_unmasked() {
            Ok(mask) => mask,
            Err(e) => {
                warn!(id = %caller.id, "cannot build key mask: {e}");
                registry.tree.collect_garbage(target);
                return Err(ErrorCode::NoMem);
            }
        };
        if let Err(e) = registry
            .tree
            .move_connection(caller.id, TtyTree::<ConnectionId>::UNATTACHED, target)
        {
            registry.tree.collect_garbage(target);
            return Err(tree_error_code(&e));
        }
        if let Some(record) = registry.connections.get_mut(&caller.id) {
            record.tty = Some(target);
            record.mode = mode;
        }
        *caller.shared.mask() = mask;
        {
            let mut slot = caller.shared.window();
            slot.window = Some(BrailleWindow::new(self.info.size.cells()));
            slot.state = BufferState::Empty;
        }
        drop(registry);

        debug!(id = %caller.id, path = ?request.path, ?mode, "tty acquired");
        caller.shared.send(codec::ack());
        Ok(())
    }

    fn set_focus(&self, caller: &Caller, payload: &[u8]) -> HandlerResult {
        let tty = self.require_tty(caller)?;
        let focus = codec::decode_set_focus(payload).map_err(|e| e.error_code())?;
        self.registry_mut()
            .tree
            .set_focus(tty, Some(focus))
            .map_err(|e| tree_error_code(&e))
    }

    fn leave_tty(&self, caller: &Caller) -> HandlerResult {
        let tty = self.require_tty(caller)?;
        {
            let mut registry = self.registry_mut();
            registry
                .tree
                .move_connection(caller.id, tty, TtyTree::<ConnectionId>::UNATTACHED)
                .map_err(|e| tree_error_code(&e))?;
            if let Some(record) = registry.connections.get_mut(&caller.id) {
                record.tty = None;
            }
            let freed = registry.tree.collect_garbage(tty);
            debug!(id = %caller.id, freed = freed.len(), "tty released");
            {
                let mut last = self.last_writer();
                if *last == Some(caller.id) {
                    *last = None;
                }
            }
            caller.shared.mask().clear();
            *caller.shared.window() = Default::default();
        }
        caller.shared.send(codec::ack());
        Ok(())
    }

    fn key_range(&self, caller: &Caller, payload: &[u8], change: MaskChange) -> HandlerResult {
        self.require_tty(caller)?;
        let (lo, hi) = codec::decode_key_range(payload).map_err(|e| e.error_code())?;
        {
            let mut mask = caller.shared.mask();
            apply_mask_change(&mut mask, lo, hi, change)?;
        }
        caller.shared.send(codec::ack());
        Ok(())
    }

    /// Applies each value in turn.  A failure part-way leaves the earlier
    /// values applied.
    fn key_set(&self, caller: &Caller, payload: &[u8], change: MaskChange) -> HandlerResult {
        self.require_tty(caller)?;
        let keys = codec::decode_key_set(payload).map_err(|e| e.error_code())?;
        {
            let mut mask = caller.shared.mask();
            for key in keys {
                apply_mask_change(&mut mask, key, key, change)?;
            }
        }
        caller.shared.send(codec::ack());
        Ok(())
    }

    fn write(&self, caller: &Caller, payload: &[u8]) -> HandlerResult {
        if payload.len() < 4 {
            return Err(ErrorCode::InvalidPacket);
        }
        self.require_tty(caller)?;
        let command =
            codec::decode_write(payload, self.info.size.cells()).map_err(|e| e.error_code())?;
        let mut slot = caller.shared.window();
        match command {
            WriteCommand::Clear => slot.state = BufferState::Empty,
            WriteCommand::Update(update) => {
                let Some(window) = slot.window.as_mut() else {
                    return Err(ErrorCode::IllegalInstruction);
                };
                window.apply(&update);
                slot.state = BufferState::PendingDisplay;
            }
        }
        Ok(())
    }

    fn get_raw(&self, caller: &Caller, payload: &[u8]) -> HandlerResult {
        if self.is_raw(caller.id) {
            return Err(ErrorCode::IllegalInstruction);
        }
        let request = codec::decode_get_raw(payload).map_err(|e| e.error_code())?;
        if request.driver_name != self.info.name || !self.info.supports_raw {
            return Err(ErrorCode::OpNotSupp);
        }
        {
            let mut raw = self.raw_slot();
            if let Some(owner) = *raw {
                debug!(id = %caller.id, %owner, "raw mode busy");
                return Err(ErrorCode::RawModeBusy);
            }
            *raw = Some(caller.id);
        }
        info!(id = %caller.id, "raw mode granted");
        caller.shared.send(codec::ack());
        Ok(())
    }

    fn leave_raw(&self, caller: &Caller) -> HandlerResult {
        {
            let mut raw = self.raw_slot();
            if *raw != Some(caller.id) {
                return Err(ErrorCode::IllegalInstruction);
            }
            *raw = None;
        }
        info!(id = %caller.id, "raw mode released");
        caller.shared.send(codec::ack());
        Ok(())
    }

    fn raw_packet(&self, caller: &Caller, payload: &[u8]) -> HandlerResult {
        if !self.is_raw(caller.id) {
            return Err(ErrorCode::IllegalInstruction);
        }
        let result = self.driver().write_packet(payload);
        result.map_err(|e| {
            warn!(id = %caller.id, "raw write failed: {e}");
            ErrorCode::DriverError
        })
    }
}

fn apply_mask_change(
    mask: &mut brlapi_core::RangeSet,
    lo: u32,
    hi: u32,
    change: MaskChange,
) -> HandlerResult {
    let result = match change {
        MaskChange::Ignore => mask.remove(lo, hi),
        MaskChange::Unignore => mask.add(lo, hi),
    };
    result.map_err(|e| match e {
        RangeSetError::InvalidRange { .. } => ErrorCode::InvalidParameter,
        RangeSetError::OutOfMemory => ErrorCode::NoMem,
    })
}

fn tree_error_code(e: &TreeError) -> ErrorCode {
    match e {
        TreeError::OutOfMemory { .. } => ErrorCode::NoMem,
        TreeError::NoSuchTty(_) => ErrorCode::InvalidParameter,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::server::ServerSettings;
    use crate::infrastructure::driver::console::StaticConsole;
    use crate::infrastructure::driver::mock::{MockDriver, MockDriverHandle};
    use crate::infrastructure::driver::DriverInfo;
    use brlapi_core::DisplaySize;
    use brlapi_core::protocol::messages::{write_flags, RAW_MAGIC};
    use tokio::sync::mpsc::UnboundedReceiver;

    const KEY: &[u8] = b"secret";

    struct Client {
        id: ConnectionId,
        rx: UnboundedReceiver<Vec<u8>>,
    }

    impl Client {
        fn replies(&mut self) -> Vec<Vec<u8>> {
            let mut out = Vec::new();
            while let Ok(bytes) = self.rx.try_recv() {
                out.push(bytes);
            }
            out
        }
    }

    fn make_server() -> (BrlapiServer, MockDriverHandle) {
        let mut settings = ServerSettings::new(KEY);
        settings.max_ttys = 8;
        let (driver, handle) = MockDriver::papenmeier();
        let server = BrlapiServer::new(settings, Box::new(driver), Arc::new(StaticConsole::new(1)));
        (server, handle)
    }

    fn auth_payload(version: u32, key: &[u8]) -> Vec<u8> {
        let mut payload = version.to_be_bytes().to_vec();
        payload.extend_from_slice(key);
        payload
    }

    fn tty_payload(path: &[u32], mode: &str) -> Vec<u8> {
        let mut payload = (path.len() as u32).to_be_bytes().to_vec();
        for n in path {
            payload.extend_from_slice(&n.to_be_bytes());
        }
        payload.push(mode.len() as u8);
        payload.extend_from_slice(mode.as_bytes());
        payload
    }

    fn raw_payload(name: &str) -> Vec<u8> {
        let mut payload = RAW_MAGIC.to_be_bytes().to_vec();
        payload.push(name.len() as u8);
        payload.extend_from_slice(name.as_bytes());
        payload
    }

    fn send(server: &BrlapiServer, client: &Client, kind: PacketType, payload: Vec<u8>) -> Disposition {
        server.handle_packet(client.id, &Packet::new(kind, payload))
    }

    fn connect(server: &BrlapiServer) -> Client {
        let (shared, rx) = server.accept("test").unwrap();
        let mut client = Client { id: shared.id(), rx };
        let disposition = send(server, &client, PacketType::Auth, auth_payload(PROTOCOL_VERSION, KEY));
        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(client.replies(), vec![codec::ack()]);
        client
    }

    fn connect_with_tty(server: &BrlapiServer, path: &[u32]) -> Client {
        let mut client = connect(server);
        send(server, &client, PacketType::GetTty, tty_payload(path, ""));
        assert_eq!(client.replies(), vec![codec::ack()]);
        client
    }

    // ── Authentication ────────────────────────────────────────────────────────

    #[test]
    fn test_correct_key_is_acknowledged_once() {
        let (server, _) = make_server();
        let client = connect(&server);
        assert!(server.is_authenticated(client.id));
        assert_eq!(server.unauthenticated_count(), 0);
    }

    #[test]
    fn test_wrong_key_closes_without_ack() {
        // Arrange
        let (server, _) = make_server();
        let (shared, rx) = server.accept("test").unwrap();
        let mut client = Client { id: shared.id(), rx };

        // Act
        let disposition = send(&server, &client, PacketType::Auth, auth_payload(PROTOCOL_VERSION, b"secreT"));

        // Assert
        assert_eq!(disposition, Disposition::Close);
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::ConnRefused)]);
        assert!(!server.is_authenticated(client.id));
    }

    #[test]
    fn test_wrong_length_key_closes() {
        let (server, _) = make_server();
        let (shared, rx) = server.accept("test").unwrap();
        let client = Client { id: shared.id(), rx };

        let disposition = send(&server, &client, PacketType::Auth, auth_payload(PROTOCOL_VERSION, b"secret-and-more"));

        assert_eq!(disposition, Disposition::Close);
    }

    #[test]
    fn test_key_prefix_and_empty_key_are_refused() {
        // Arrange
        let (server, _) = make_server();

        for key in [&KEY[..KEY.len() - 1], b"".as_slice()] {
            let (shared, rx) = server.accept("test").unwrap();
            let mut client = Client { id: shared.id(), rx };

            // Act
            let disposition = send(&server, &client, PacketType::Auth, auth_payload(PROTOCOL_VERSION, key));

            // Assert
            assert_eq!(disposition, Disposition::Close);
            assert_eq!(client.replies(), vec![codec::error(ErrorCode::ConnRefused)]);
            assert!(!server.is_authenticated(client.id));
        }
    }

    #[test]
    fn test_protocol_version_mismatch_closes() {
        let (server, _) = make_server();
        let (shared, rx) = server.accept("test").unwrap();
        let mut client = Client { id: shared.id(), rx };

        let disposition = send(&server, &client, PacketType::Auth, auth_payload(6, KEY));

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::ProtocolVersion)]);
    }

    #[test]
    fn test_non_auth_first_packet_closes() {
        let (server, _) = make_server();
        let (shared, rx) = server.accept("test").unwrap();
        let client = Client { id: shared.id(), rx };

        let disposition = send(&server, &client, PacketType::GetDriverName, Vec::new());

        assert_eq!(disposition, Disposition::Close);
    }

    #[test]
    fn test_oversized_before_auth_closes_but_after_auth_continues() {
        let (server, _) = make_server();
        let (shared, _rx) = server.accept("test").unwrap();
        assert_eq!(server.handle_oversized(shared.id(), 0, 4096), Disposition::Close);

        let client = connect(&server);
        assert_eq!(server.handle_oversized(client.id, 0, 4096), Disposition::Continue);
    }

    // ── Driver queries ────────────────────────────────────────────────────────

    #[test]
    fn test_driver_queries() {
        let (server, _) = make_server();
        let mut client = connect(&server);

        send(&server, &client, PacketType::GetDriverId, Vec::new());
        send(&server, &client, PacketType::GetDriverName, Vec::new());
        send(&server, &client, PacketType::GetDisplaySize, Vec::new());

        assert_eq!(
            client.replies(),
            vec![
                codec::driver_string(PacketType::GetDriverId, "pm"),
                codec::driver_string(PacketType::GetDriverName, "Papenmeier"),
                codec::display_size(40, 1),
            ]
        );
    }

    #[test]
    fn test_driver_query_with_payload_is_invalid_packet() {
        let (server, _) = make_server();
        let mut client = connect(&server);
        send(&server, &client, PacketType::GetDriverId, vec![0]);
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::InvalidPacket)]);
    }

    #[test]
    fn test_unknown_type_gets_exception() {
        let (server, _) = make_server();
        let mut client = connect(&server);
        let packet = Packet {
            packet_type: 0x7A,
            payload: vec![1, 2],
        };

        let disposition = server.handle_packet(client.id, &packet);

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(
            client.replies(),
            vec![codec::exception(ErrorCode::UnknownInstruction, 0x7A, &[1, 2])]
        );
    }

    // ── GetTty / LeaveTty ─────────────────────────────────────────────────────

    #[test]
    fn test_get_tty_twice_on_same_node_is_illegal() {
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);

        send(&server, &client, PacketType::GetTty, tty_payload(&[1], ""));

        assert_eq!(client.replies(), vec![codec::error(ErrorCode::IllegalInstruction)]);
    }

    #[test]
    fn test_get_tty_with_other_mode_on_same_node_is_not_supported() {
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);

        send(&server, &client, PacketType::GetTty, tty_payload(&[1], "Papenmeier"));

        assert_eq!(client.replies(), vec![codec::error(ErrorCode::OpNotSupp)]);
    }

    #[test]
    fn test_get_tty_elsewhere_while_holding_one_is_invalid_parameter() {
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);

        send(&server, &client, PacketType::GetTty, tty_payload(&[2], ""));

        assert_eq!(client.replies(), vec![codec::error(ErrorCode::InvalidParameter)]);
        assert_eq!(server.tty_count(), 1);
    }

    #[test]
    fn test_get_tty_unknown_mode_is_not_supported() {
        let (server, _) = make_server();
        let mut client = connect(&server);
        send(&server, &client, PacketType::GetTty, tty_payload(&[1], "Alva"));
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::OpNotSupp)]);
        assert_eq!(server.tty_count(), 0);
    }

    #[test]
    fn test_get_tty_beyond_node_limit_unwinds() {
        // Arrange: the limit is 8 nodes.
        let (server, _) = make_server();
        let mut client = connect(&server);

        // Act
        send(&server, &client, PacketType::GetTty, tty_payload(&[1, 2, 3, 4, 5, 6, 7, 8, 9], ""));

        // Assert
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::NoMem)]);
        assert_eq!(server.tty_count(), 0);
    }

    #[test]
    fn test_leave_tty_collects_created_path() {
        // Arrange
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[3, 4, 5]);
        assert_eq!(server.tty_count(), 3);

        // Act
        send(&server, &client, PacketType::LeaveTty, Vec::new());

        // Assert
        assert_eq!(client.replies(), vec![codec::ack()]);
        assert_eq!(server.tty_count(), 0);
        assert!(server.window_of(client.id).is_none());
    }

    #[test]
    fn test_leave_tty_without_tty_is_illegal() {
        let (server, _) = make_server();
        let mut client = connect(&server);
        send(&server, &client, PacketType::LeaveTty, Vec::new());
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::IllegalInstruction)]);
    }

    #[test]
    fn test_disconnect_releases_tty() {
        let (server, _) = make_server();
        let client = connect_with_tty(&server, &[2, 9]);
        server.disconnect(client.id);
        assert_eq!(server.tty_count(), 0);
    }

    // ── Write ────────────────────────────────────────────────────────────────

    fn write_payload(begin: u32, text: &str, cursor: Option<u32>) -> Vec<u8> {
        let mut flags = write_flags::REGION | write_flags::TEXT;
        if cursor.is_some() {
            flags |= write_flags::CURSOR;
        }
        let mut payload = flags.to_be_bytes().to_vec();
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&(text.chars().count() as u32).to_be_bytes());
        payload.extend_from_slice(&(text.len() as u32).to_be_bytes());
        payload.extend_from_slice(text.as_bytes());
        if let Some(cursor) = cursor {
            payload.extend_from_slice(&cursor.to_be_bytes());
        }
        payload
    }

    #[test]
    fn test_write_updates_region_only() {
        // Arrange
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);

        // Act
        send(&server, &client, PacketType::Write, write_payload(3, "abc", Some(4)));

        // Assert
        assert!(client.replies().is_empty());
        let window = server.window_of(client.id).unwrap();
        assert_eq!(&window.text()[..6], &[' ', ' ', 'a', 'b', 'c', ' ']);
        assert_eq!(window.cursor(), 4);
    }

    #[test]
    fn test_write_without_tty_gets_exception() {
        let (server, _) = make_server();
        let mut client = connect(&server);
        let payload = write_payload(1, "a", None);

        send(&server, &client, PacketType::Write, payload.clone());

        assert_eq!(
            client.replies(),
            vec![codec::exception(ErrorCode::IllegalInstruction, PacketType::Write.code(), &payload)]
        );
    }

    #[test]
    fn test_write_region_past_display_is_rejected() {
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);
        let payload = write_payload(40, "ab", None);

        send(&server, &client, PacketType::Write, payload.clone());

        assert_eq!(
            client.replies(),
            vec![codec::exception(ErrorCode::InvalidParameter, PacketType::Write.code(), &payload)]
        );
    }

    // ── Key masking ──────────────────────────────────────────────────────────

    #[test]
    fn test_ignore_key_range_is_acknowledged() {
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);
        let mut payload = 10u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&20u32.to_be_bytes());

        send(&server, &client, PacketType::IgnoreKeyRange, payload);

        assert_eq!(client.replies(), vec![codec::ack()]);
    }

    #[test]
    fn test_key_set_with_ragged_payload_is_invalid_packet() {
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);
        send(&server, &client, PacketType::IgnoreKeySet, vec![0, 0, 0, 1, 0]);
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::InvalidPacket)]);
    }

    #[test]
    fn test_reversed_key_range_is_invalid_parameter() {
        let (server, _) = make_server();
        let mut client = connect_with_tty(&server, &[1]);
        let mut payload = 20u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&10u32.to_be_bytes());

        send(&server, &client, PacketType::UnignoreKeyRange, payload);

        assert_eq!(client.replies(), vec![codec::error(ErrorCode::InvalidParameter)]);
    }

    // ── Raw mode ─────────────────────────────────────────────────────────────

    #[test]
    fn test_second_get_raw_is_busy() {
        // Arrange
        let (server, _) = make_server();
        let mut first = connect(&server);
        let mut second = connect(&server);

        // Act
        send(&server, &first, PacketType::GetRaw, raw_payload("Papenmeier"));
        send(&server, &second, PacketType::GetRaw, raw_payload("Papenmeier"));

        // Assert
        assert_eq!(first.replies(), vec![codec::ack()]);
        assert_eq!(second.replies(), vec![codec::error(ErrorCode::RawModeBusy)]);
        assert_eq!(server.raw_owner(), Some(first.id));
    }

    #[test]
    fn test_get_raw_for_other_driver_is_not_supported() {
        let (server, _) = make_server();
        let mut client = connect(&server);
        send(&server, &client, PacketType::GetRaw, raw_payload("Alva"));
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::OpNotSupp)]);
        assert_eq!(server.raw_owner(), None);
    }

    #[test]
    fn test_get_raw_on_driver_without_raw_support_is_not_supported() {
        // Arrange: same name, no raw capability.
        let mut settings = ServerSettings::new(KEY);
        settings.max_ttys = 8;
        let (driver, _handle) = MockDriver::new(DriverInfo {
            code: "vr".to_string(),
            name: "Virtual".to_string(),
            size: DisplaySize::new(20, 1),
            supports_raw: false,
            supports_keycodes: false,
        });
        let server = BrlapiServer::new(settings, Box::new(driver), Arc::new(StaticConsole::new(1)));
        let mut client = connect(&server);

        // Act
        send(&server, &client, PacketType::GetRaw, raw_payload("Virtual"));

        // Assert
        assert_eq!(client.replies(), vec![codec::error(ErrorCode::OpNotSupp)]);
        assert_eq!(server.raw_owner(), None);
    }

    #[test]
    fn test_raw_connection_cannot_use_tty_requests() {
        let (server, _) = make_server();
        let mut client = connect(&server);
        send(&server, &client, PacketType::GetRaw, raw_payload("Papenmeier"));
        client.replies();

        send(&server, &client, PacketType::GetTty, tty_payload(&[1], ""));

        assert_eq!(client.replies(), vec![codec::error(ErrorCode::IllegalInstruction)]);
    }

    #[test]
    fn test_raw_packets_reach_driver() {
        let (server, handle) = make_server();
        let mut client = connect(&server);
        send(&server, &client, PacketType::GetRaw, raw_payload("Papenmeier"));

        send(&server, &client, PacketType::Packet, vec![0x02, 0x10, 0x03]);

        assert_eq!(client.replies(), vec![codec::ack()]);
        assert_eq!(handle.packets_written(), vec![vec![0x02, 0x10, 0x03]]);
    }

    #[test]
    fn test_packet_outside_raw_mode_gets_exception() {
        let (server, handle) = make_server();
        let mut client = connect(&server);

        send(&server, &client, PacketType::Packet, vec![1]);

        assert_eq!(
            client.replies(),
            vec![codec::exception(ErrorCode::IllegalInstruction, PacketType::Packet.code(), &[1])]
        );
        assert!(handle.packets_written().is_empty());
    }

    #[test]
    fn test_leave_raw_then_other_client_may_take_it() {
        let (server, _) = make_server();
        let mut first = connect(&server);
        let mut second = connect(&server);
        send(&server, &first, PacketType::GetRaw, raw_payload("Papenmeier"));

        send(&server, &first, PacketType::LeaveRaw, Vec::new());
        send(&server, &second, PacketType::GetRaw, raw_payload("Papenmeier"));

        assert_eq!(first.replies(), vec![codec::ack(), codec::ack()]);
        assert_eq!(second.replies(), vec![codec::ack()]);
    }

    #[test]
    fn test_disconnect_in_raw_mode_resets_driver() {
        let (server, handle) = make_server();
        let client = connect(&server);
        send(&server, &client, PacketType::GetRaw, raw_payload("Papenmeier"));

        server.disconnect(client.id);

        assert_eq!(server.raw_owner(), None);
        assert_eq!(handle.reset_calls(), 1);
    }
}
