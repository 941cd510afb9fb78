//! One client session: socket bytes in, packets dispatched, replies out.
//!
//! The read side never blocks inside the framer.  Whatever bytes the socket
//! delivered are handed to [`PacketFramer`] through a [`ChunkSource`]; when
//! the chunk is used up the framer reports `Pending` and keeps its partial
//! state until the next read.
//!
//! Replies, keys and raw packets reach the client through the connection's
//! outbox, which the write side drains.  When the server closes the
//! connection it drops the outbox sender, so the write side flushes what is
//! queued (typically a final Error packet) and then shuts the socket down.

use std::sync::Arc;

use brlapi_core::protocol::codec;
use brlapi_core::protocol::framer::ChunkSource;
use brlapi_core::{ErrorCode, FrameStatus, FramerError, PacketFramer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::application::dispatch::Disposition;
use crate::application::server::{BrlapiServer, ConnectionId, ConnectionShared};

const READ_CHUNK: usize = 4096;

/// Runs a session until the client disconnects or the server drops it.
pub async fn run_session<R, W>(server: Arc<BrlapiServer>, mut reader: R, mut writer: W, peer: String)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (shared, mut outbox) = match server.accept(&peer) {
        Ok(accepted) => accepted,
        Err(e) => {
            // The limit warning is logged once by `accept`.
            debug!(%peer, "refusing connection: {e}");
            let _ = writer.write_all(&codec::error(ErrorCode::ConnRefused)).await;
            let _ = writer.shutdown().await;
            return;
        }
    };
    let id = shared.id();

    let read_side = async {
        read_packets(&server, id, &shared, &mut reader).await;
        server.disconnect(id);
    };
    let write_side = async {
        while let Some(bytes) = outbox.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(%id, "write failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    };
    tokio::join!(read_side, write_side);
}

async fn read_packets<R>(server: &BrlapiServer, id: ConnectionId, shared: &ConnectionShared, reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut framer = PacketFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = shared.kicked() => {
                debug!(%id, "session closed by server");
                return;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(%id, "client closed the connection");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(%id, "read failed: {e}");
                    return;
                }
            },
        };

        let mut source = ChunkSource::new(&buf[..n]);
        loop {
            let disposition = match framer.read_from(&mut source) {
                Ok(FrameStatus::Pending) => break,
                Ok(FrameStatus::Complete(packet)) => server.handle_packet(id, &packet),
                Ok(FrameStatus::Oversized { packet_type, size }) => {
                    server.handle_oversized(id, packet_type, size)
                }
                Err(FramerError::Eof) => break,
                Err(FramerError::Io(e)) => {
                    debug!(%id, "framer failed: {e}");
                    return;
                }
            };
            if disposition == Disposition::Close {
                return;
            }
        }
    }
}
