//! Republishing terminal outcomes onto a message queue.
//!
//! [`RepublishListener`] maps each event onto a topic and hands a
//! postcard-encoded [`OutcomeEnvelope`] to an [`OutcomePublisher`]. The queue
//! client itself lives outside this crate.

use serde::{Deserialize, Serialize};

use crate::listener::{BroadcastReport, DeliveryReport, ListenerError, PushListener};
use crate::record::DeliveryOutcome;

/// Delivered, with or without an ack.
pub const TOPIC_SUCCESS: &str = "/pushgate/push/success";
/// Every target of a broadcast resolved.
pub const TOPIC_BROADCAST_FINISH: &str = "/pushgate/push/broadcast_finish";
/// Write or transport failure; the sender may retry.
pub const TOPIC_FAILURE: &str = "/pushgate/push/failure";
/// Target absent or gone; the message should be kept for later.
pub const TOPIC_OFFLINE: &str = "/pushgate/push/offline";
/// The client was redirected to another node.
pub const TOPIC_ROUTE_CHANGE: &str = "/pushgate/push/route_change";
/// No ack within the window.
pub const TOPIC_ACK_TIMEOUT: &str = "/pushgate/push/ack_timeout";

/// Topic an outcome is published on. Plain and acked success share one.
pub fn topic_for(outcome: DeliveryOutcome) -> &'static str {
    match outcome {
        DeliveryOutcome::Success | DeliveryOutcome::AckSuccess => TOPIC_SUCCESS,
        DeliveryOutcome::Failure => TOPIC_FAILURE,
        DeliveryOutcome::Offline => TOPIC_OFFLINE,
        DeliveryOutcome::Redirect => TOPIC_ROUTE_CHANGE,
        DeliveryOutcome::Timeout => TOPIC_ACK_TIMEOUT,
    }
}

/// Errors raised while republishing an outcome.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The envelope could not be encoded.
    #[error("envelope encoding failed: {0}")]
    Encode(#[from] postcard::Error),
    /// The queue client rejected the publish.
    #[error("publish to {topic} failed: {reason}")]
    Transport { topic: String, reason: String },
}

/// Sink for encoded envelopes, implemented by the queue client.
pub trait OutcomePublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Wire form of one published outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEnvelope {
    pub message_id: u64,
    /// Target connection; `None` for broadcast completion.
    pub connection_id: Option<u64>,
    pub broadcast_id: Option<u64>,
    /// Outcome name, e.g. `ack_success`. `broadcast_complete` for roll-ups.
    pub outcome: String,
    pub detail: Option<String>,
    /// Dispatch-to-resolution latency.
    pub elapsed_ms: u64,
    /// Per-target outcomes of a completed broadcast.
    pub targets: Vec<(u64, String)>,
}

impl OutcomeEnvelope {
    /// Envelope for one resolved delivery.
    pub fn from_delivery(report: &DeliveryReport) -> Self {
        Self {
            message_id: report.message.id.0,
            connection_id: Some(report.connection.0),
            broadcast_id: report.broadcast.map(|b| b.0),
            outcome: report.outcome.to_string(),
            detail: report.detail.clone(),
            elapsed_ms: report
                .time_points
                .total()
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            targets: Vec::new(),
        }
    }

    /// Envelope for a completed broadcast, listing every target.
    pub fn from_broadcast(report: &BroadcastReport) -> Self {
        Self {
            message_id: report.message.id.0,
            connection_id: None,
            broadcast_id: Some(report.broadcast.0),
            outcome: "broadcast_complete".to_string(),
            detail: None,
            elapsed_ms: report
                .completed_at
                .saturating_duration_since(report.started_at)
                .as_millis() as u64,
            targets: report
                .outcomes
                .iter()
                .map(|(conn, outcome)| (conn.0, outcome.to_string()))
                .collect(),
        }
    }

    /// Postcard bytes of the envelope.
    pub fn encode(&self) -> Result<Vec<u8>, PublishError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Parse postcard bytes produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, PublishError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Listener that republishes every outcome through `P`.
pub struct RepublishListener<P: OutcomePublisher> {
    publisher: P,
}

impl<P: OutcomePublisher> RepublishListener<P> {
    /// Republish through `publisher`.
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    /// The wrapped publisher.
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    fn republish(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        let payload = OutcomeEnvelope::from_delivery(report).encode()?;
        self.publisher.publish(topic_for(report.outcome), payload)?;
        Ok(())
    }
}

impl<P: OutcomePublisher> PushListener for RepublishListener<P> {
    fn name(&self) -> &str {
        "republish"
    }

    fn on_success(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        self.republish(report)
    }

    fn on_ack_success(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        self.republish(report)
    }

    fn on_broadcast_complete(&self, report: &BroadcastReport) -> Result<(), ListenerError> {
        let payload = OutcomeEnvelope::from_broadcast(report).encode()?;
        self.publisher.publish(TOPIC_BROADCAST_FINISH, payload)?;
        Ok(())
    }

    fn on_failure(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        self.republish(report)
    }

    fn on_offline(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        self.republish(report)
    }

    fn on_redirect(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        self.republish(report)
    }

    fn on_timeout(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        self.republish(report)
    }
}
