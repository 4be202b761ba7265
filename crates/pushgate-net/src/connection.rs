//! Per-connection task run on the worker that owns the socket.
//!
//! The task decodes inbound frames, answers heartbeats, writes queued
//! outbound frames, and enforces the idle timeout. Everything that touches the
//! socket or its decoder happens here, so no connection state is shared
//! across threads apart from the registry entry.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;

use crate::framing::{Frame, FrameConfig, FrameDecoder, FrameError, FrameKind, MessageId, write_frame};
use crate::platform::{SocketConfig, configure_stream};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, Mailbox};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Callbacks from connection tasks into the layer that owns delivery state.
///
/// Every callback runs on the worker that owns the connection, so it must not
/// block.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A connection was accepted and registered.
    fn on_connect(&self, _connection: &Connection) {}

    /// A data or ack frame arrived. Heartbeats are answered by the transport
    /// and never reach the handler.
    fn on_frame(&self, connection: ConnectionId, frame: Frame);

    /// A data frame finished writing, successfully or not.
    fn on_write(
        &self,
        _connection: ConnectionId,
        _message_id: MessageId,
        _result: Result<(), TransportError>,
    ) {
    }

    /// The connection closed and has been evicted from the registry.
    fn on_disconnect(&self, _connection: ConnectionId, _reason: &DisconnectReason) {}

    /// Every execution context has stopped.
    fn on_shutdown(&self) {}
}

/// A write or read failure on one connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error on {connection}: {detail}")]
pub struct TransportError {
    /// Affected connection.
    pub connection: ConnectionId,
    /// Description of the failure.
    pub detail: String,
}

impl TransportError {
    fn new(connection: ConnectionId, err: &FrameError) -> Self {
        Self {
            connection,
            detail: err.to_string(),
        }
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the socket.
    PeerClosed,
    /// No inbound traffic within the idle timeout.
    Idle,
    /// The peer sent a malformed frame.
    Decode(String),
    /// Reading or writing the socket failed.
    Transport(String),
    /// Closed on request through the registry.
    Closed,
    /// The server is stopping.
    ServerShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::Idle => f.write_str("idle timeout"),
            Self::Decode(detail) => write!(f, "decode error: {detail}"),
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::Closed => f.write_str("closed by server"),
            Self::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

/// Everything a connection task needs, shared by all workers.
pub struct ConnectionContext {
    /// Live connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Delivery-side callbacks.
    pub handler: Arc<dyn ConnectionHandler>,
    /// Codec settings.
    pub frame_config: FrameConfig,
    /// Options applied to accepted sockets.
    pub socket_config: SocketConfig,
    /// Close connections silent for this long.
    pub idle_timeout: Duration,
}

/// A connection handed from the acceptor to a worker.
#[derive(Debug)]
pub struct Assignment {
    /// Id assigned on accept.
    pub id: ConnectionId,
    /// Non-blocking socket detached from the acceptor's runtime.
    pub stream: std::net::TcpStream,
    /// Peer address.
    pub peer: SocketAddr,
}

/// Serve one connection until it closes. Runs inside a worker runtime.
pub async fn serve_connection(
    ctx: Arc<ConnectionContext>,
    assignment: Assignment,
    mut shutdown: watch::Receiver<bool>,
) {
    let Assignment { id, stream, peer } = assignment;

    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Failed to adopt connection {id} from {peer}: {e}");
            return;
        }
    };
    if let Err(e) = configure_stream(&stream, &ctx.socket_config) {
        tracing::debug!("Socket options not applied to {id}: {e}");
    }

    let connection = Arc::new(Connection::new(id, peer));
    let Mailbox {
        frames: mut rx,
        close,
    } = match ctx.registry.register(Arc::clone(&connection)) {
        Ok(mailbox) => mailbox,
        Err(e) => {
            tracing::warn!("Rejecting {peer}: {e}");
            return;
        }
    };
    tracing::info!("Accepted connection {id} from {peer}");
    ctx.handler.on_connect(&connection);

    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new(ctx.frame_config.clone());
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = if *shutdown.borrow() {
        DisconnectReason::ServerShutdown
    } else {
        loop {
            let idle_deadline =
                tokio::time::Instant::from_std(connection.last_activity() + ctx.idle_timeout);

            tokio::select! {
                result = reader.read(&mut buf) => match result {
                    Ok(0) => break DisconnectReason::PeerClosed,
                    Ok(n) => {
                        connection.touch();
                        decoder.feed(&buf[..n]);
                        if let Err(reason) = drain_frames(&ctx, id, &mut decoder, &mut writer).await {
                            break reason;
                        }
                    }
                    Err(e) => break DisconnectReason::Transport(e.to_string()),
                },
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(reason) = write_outbound(&ctx, id, &mut writer, frame).await {
                            break reason;
                        }
                    }
                    None => break DisconnectReason::Closed,
                },
                _ = close.notified() => break DisconnectReason::Closed,
                _ = tokio::time::sleep_until(idle_deadline) => {
                    if connection.idle_for() >= ctx.idle_timeout {
                        break DisconnectReason::Idle;
                    }
                }
                _ = shutdown.changed() => break DisconnectReason::ServerShutdown,
            }
        }
    };

    // Close the queue before eviction: a push either lands in the queue
    // before this point (and is resolved by on_disconnect) or fails to send.
    rx.close();
    ctx.registry.evict(id);
    let _ = writer.shutdown().await;

    match &reason {
        DisconnectReason::PeerClosed | DisconnectReason::Closed | DisconnectReason::ServerShutdown => {
            tracing::info!("Connection {id} closed: {reason}");
        }
        _ => tracing::warn!("Connection {id} closed: {reason}"),
    }
    ctx.handler.on_disconnect(id, &reason);
}

/// Decode every complete frame currently buffered.
async fn drain_frames(
    ctx: &ConnectionContext,
    id: ConnectionId,
    decoder: &mut FrameDecoder,
    writer: &mut OwnedWriteHalf,
) -> Result<(), DisconnectReason> {
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => match frame.kind {
                FrameKind::Heartbeat => {
                    tracing::trace!("Heartbeat from {id}");
                    write_frame(writer, &Frame::heartbeat(), &ctx.frame_config)
                        .await
                        .map_err(|e| DisconnectReason::Transport(e.to_string()))?;
                }
                FrameKind::Ack | FrameKind::Data => {
                    tracing::trace!("{:?} frame for {} from {id}", frame.kind, frame.message_id);
                    ctx.handler.on_frame(id, frame);
                }
            },
            Ok(None) => return Ok(()),
            Err(e) => return Err(DisconnectReason::Decode(e.to_string())),
        }
    }
}

/// Write one queued frame and report data-frame completion to the handler.
async fn write_outbound(
    ctx: &ConnectionContext,
    id: ConnectionId,
    writer: &mut OwnedWriteHalf,
    frame: Frame,
) -> Result<(), DisconnectReason> {
    let result = write_frame(writer, &frame, &ctx.frame_config).await;

    if frame.kind == FrameKind::Data {
        let report = result
            .as_ref()
            .map(|_| ())
            .map_err(|e| TransportError::new(id, e));
        ctx.handler.on_write(id, frame.message_id, report);
    }

    match result {
        Ok(()) => Ok(()),
        // The frame was rejected before touching the socket.
        Err(FrameError::FrameTooLarge { .. }) => Ok(()),
        Err(e) => Err(DisconnectReason::Transport(e.to_string())),
    }
}
