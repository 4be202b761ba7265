//! Messages handed to the gateway and the keys delivery records live under.

use std::fmt;
use std::time::SystemTime;

use pushgate_net::{ConnectionId, MessageId};

/// Whether the client must acknowledge a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Resolve through `AwaitingAck`; no ack within the window is a timeout.
    #[default]
    Required,
    /// Resolve to success as soon as the frame is written.
    None,
}

/// A message to push. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    /// Caller-assigned id, echoed in the client's ack frame.
    pub id: MessageId,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Ack requirement.
    pub ack: AckPolicy,
    /// When the message was created.
    pub created_at: SystemTime,
}

impl PushMessage {
    /// A message that requires an ack.
    pub fn new(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId(id),
            payload: payload.into(),
            ack: AckPolicy::Required,
            created_at: SystemTime::now(),
        }
    }

    /// Change the ack policy.
    pub fn with_ack(mut self, ack: AckPolicy) -> Self {
        self.ack = ack;
        self
    }

    /// Whether delivery waits for an ack frame.
    pub fn requires_ack(&self) -> bool {
        self.ack == AckPolicy::Required
    }
}

/// Identifier of a broadcast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BroadcastId(pub u64);

impl From<MessageId> for BroadcastId {
    fn from(id: MessageId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bcast-{}", self.0)
    }
}

/// Key of one delivery record: a message on one target connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    /// Target connection.
    pub connection: ConnectionId,
    /// Message id.
    pub message: MessageId,
}

impl DeliveryKey {
    /// Key for `message` on `connection`.
    pub fn new(connection: ConnectionId, message: MessageId) -> Self {
        Self {
            connection,
            message,
        }
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.message, self.connection)
    }
}
