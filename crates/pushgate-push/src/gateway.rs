//! Public face of the delivery core: lifecycle, dispatch and listeners.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pushgate_config::Config;
use pushgate_net::{
    Connection, ConnectionHandler, ConnectionId, ConnectionRegistry, DisconnectReason, Frame,
    FrameKind, LifecycleError, MessageId, PushServer, RegistryError, ServerConfig, ServerError,
    TransportError,
};

use crate::broadcast::BroadcastError;
use crate::listener::PushListener;
use crate::message::{BroadcastId, DeliveryKey, PushMessage};
use crate::record::DeliveryOutcome;
use crate::tracker::{DeliveryTracker, TrackError};

/// Gateway settings: transport plus delivery.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    /// How long a written message waits for its ack. Default: 3s.
    pub ack_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ack_timeout: Duration::from_millis(3000),
        }
    }
}

impl GatewayConfig {
    /// Build from the loaded configuration. Fails if the host does not resolve.
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        Ok(Self {
            server: ServerConfig::from_config(config)?,
            ack_timeout: Duration::from_millis(config.delivery.ack_timeout_ms),
        })
    }
}

/// Errors returned synchronously by dispatch operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The message is already in flight to that connection.
    #[error("message {} is already outstanding on {}", .0.message, .0.connection)]
    Duplicate(DeliveryKey),
    /// The broadcast could not be opened.
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    /// No live connection with that id.
    #[error("{0} is not connected")]
    NotConnected(ConnectionId),
}

/// Bridges connection events into the tracker.
struct DeliveryHandler {
    tracker: DeliveryTracker,
}

impl ConnectionHandler for DeliveryHandler {
    fn on_connect(&self, connection: &Connection) {
        tracing::debug!("{} ready for pushes", connection.id());
    }

    fn on_frame(&self, connection: ConnectionId, frame: Frame) {
        match frame.kind {
            FrameKind::Ack => {
                let key = DeliveryKey::new(connection, frame.message_id);
                if !self.tracker.resolve(key, DeliveryOutcome::AckSuccess) {
                    tracing::trace!("Ignoring ack for {key}");
                }
            }
            FrameKind::Data => {
                tracing::debug!("Ignoring upstream data frame {} from {connection}", frame.message_id);
            }
            FrameKind::Heartbeat => {}
        }
    }

    fn on_write(
        &self,
        connection: ConnectionId,
        message_id: MessageId,
        result: Result<(), TransportError>,
    ) {
        let key = DeliveryKey::new(connection, message_id);
        match result {
            Ok(()) => self.tracker.mark_sent(key),
            Err(e) => {
                self.tracker
                    .resolve_with_detail(key, DeliveryOutcome::Failure, Some(e.detail));
            }
        }
    }

    fn on_disconnect(&self, connection: ConnectionId, reason: &DisconnectReason) {
        // A broken socket fails the deliveries; any other close means the
        // client went away.
        let outcome = match reason {
            DisconnectReason::Transport(_) => DeliveryOutcome::Failure,
            DisconnectReason::PeerClosed
            | DisconnectReason::Idle
            | DisconnectReason::Decode(_)
            | DisconnectReason::Closed
            | DisconnectReason::ServerShutdown => DeliveryOutcome::Offline,
        };
        let detail = reason.to_string();
        let resolved = self
            .tracker
            .resolve_connection(connection, outcome, Some(&detail));
        if resolved > 0 {
            tracing::debug!("{resolved} deliveries to {connection} resolved {outcome} ({detail})");
        }
    }

    fn on_shutdown(&self) {
        self.tracker.shutdown();
    }
}

/// Push gateway: a [`PushServer`] wired to a [`DeliveryTracker`].
pub struct PushGateway {
    server: PushServer,
    tracker: DeliveryTracker,
    registry: Arc<ConnectionRegistry>,
}

impl PushGateway {
    /// A gateway in `Created`; call [`init`](Self::init) then
    /// [`start`](Self::start).
    pub fn new(config: GatewayConfig) -> Self {
        let tracker = DeliveryTracker::new(config.ack_timeout);
        let registry = Arc::new(
            ConnectionRegistry::new(config.server.max_connections)
                .with_queue_capacity(config.server.outbound_queue),
        );
        let handler = Arc::new(DeliveryHandler {
            tracker: tracker.clone(),
        });
        let server = PushServer::new(config.server, Arc::clone(&registry), handler);
        Self {
            server,
            tracker,
            registry,
        }
    }

    /// `Created -> Initialized`.
    pub fn init(&self) -> Result<(), LifecycleError> {
        self.server.init()
    }

    /// Launch the server; `on_result` receives the bound address or the bind
    /// error once the listener is set up.
    pub fn start<F>(&self, on_result: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(Result<SocketAddr, ServerError>) + Send + 'static,
    {
        self.server.start(on_result)
    }

    /// Stop the server and fail every delivery still outstanding. Blocks
    /// until every context has exited.
    pub fn stop<F>(&self, on_result: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(Result<SocketAddr, ServerError>),
    {
        self.server.stop(on_result)
    }

    /// True between a successful bind and stop.
    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    /// Bound listener address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Add an observer of terminal events. Lower `order` runs first.
    pub fn register_listener(&self, listener: Arc<dyn PushListener>, order: i32) {
        self.tracker.listeners().register(listener, order);
    }

    /// Push `message` to one connection.
    ///
    /// Returns immediately; the outcome reaches the listeners. Only a message
    /// already outstanding on `target` is rejected here. A target whose
    /// outbound queue is full resolves as a failure.
    pub fn dispatch(
        &self,
        message: impl Into<Arc<PushMessage>>,
        target: ConnectionId,
    ) -> Result<(), DispatchError> {
        self.dispatch_to(message.into(), target, None)
    }

    /// Push `message` to every target and report a single completion once
    /// each has resolved. The broadcast id is the message id.
    pub fn dispatch_broadcast(
        &self,
        message: impl Into<Arc<PushMessage>>,
        targets: impl IntoIterator<Item = ConnectionId>,
    ) -> Result<BroadcastId, DispatchError> {
        let message = message.into();
        let broadcast = BroadcastId::from(message.id);
        let targets: BTreeSet<ConnectionId> = targets.into_iter().collect();

        // Open the group before any target can resolve.
        let broadcasts = self.tracker.broadcasts();
        let opened = broadcasts.begin(broadcast, Arc::clone(&message), targets.iter().copied())?;
        if let Some(report) = opened {
            self.tracker.listeners().notify_broadcast(&report);
            return Ok(broadcast);
        }
        tracing::debug!("Broadcasting {} to {} targets", message.id, targets.len());

        for target in targets {
            if let Err(e) = self.dispatch_to(Arc::clone(&message), target, Some(broadcast)) {
                tracing::warn!("Broadcast {broadcast} skipped {target}: {e}");
                if let Some(report) =
                    broadcasts.on_target_resolved(broadcast, target, DeliveryOutcome::Failure)
                {
                    self.tracker.listeners().notify_broadcast(&report);
                }
            }
        }
        Ok(broadcast)
    }

    /// Tell `connection` to reconnect elsewhere: its outstanding deliveries
    /// resolve as redirects and the connection is closed.
    pub fn redirect(&self, connection: ConnectionId) -> Result<usize, DispatchError> {
        if !self.registry.contains(connection) {
            return Err(DispatchError::NotConnected(connection));
        }
        let redirected = self.tracker.resolve_connection(
            connection,
            DeliveryOutcome::Redirect,
            Some("route changed"),
        );
        self.close_connection(connection)?;
        tracing::info!("Redirected {connection} ({redirected} deliveries)");
        Ok(redirected)
    }

    /// Close `connection`, dropping any frames still queued for it. Its
    /// outstanding deliveries resolve as offline.
    pub fn close_connection(&self, connection: ConnectionId) -> Result<(), DispatchError> {
        self.registry
            .close(connection)
            .map_err(|_| DispatchError::NotConnected(connection))
    }

    /// Outstanding delivery state.
    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn dispatch_to(
        &self,
        message: Arc<PushMessage>,
        target: ConnectionId,
        broadcast: Option<BroadcastId>,
    ) -> Result<(), DispatchError> {
        let key = DeliveryKey::new(target, message.id);
        match self.tracker.track(Arc::clone(&message), target, broadcast) {
            Ok(_) => {}
            // Already resolved as a failure.
            Err(TrackError::Closed) => return Ok(()),
            Err(TrackError::Duplicate(key)) => return Err(DispatchError::Duplicate(key)),
        }

        let frame = Frame::data(message.id, message.payload.clone());
        if let Err(e) = self.registry.send(target, frame) {
            let outcome = match e {
                // The client is there but not reading fast enough.
                RegistryError::QueueFull(_) => DeliveryOutcome::Failure,
                _ => DeliveryOutcome::Offline,
            };
            self.tracker
                .resolve_with_detail(key, outcome, Some(e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
