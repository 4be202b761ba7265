//! Ordered observers of terminal delivery events.
//!
//! Listeners are invoked synchronously, in order, on the thread that resolved
//! the record. A listener that returns an error or panics is logged and
//! skipped; the rest of the chain still runs.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use pushgate_net::ConnectionId;

use crate::message::{BroadcastId, PushMessage};
use crate::record::{DeliveryOutcome, TimePoints};

/// Immutable description of one resolved delivery.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// The delivered message.
    pub message: Arc<PushMessage>,
    /// Target connection.
    pub connection: ConnectionId,
    /// Broadcast the delivery belonged to, if any.
    pub broadcast: Option<BroadcastId>,
    /// How it ended.
    pub outcome: DeliveryOutcome,
    /// Failure description, when one is known.
    pub detail: Option<String>,
    /// Timing checkpoints, `Resolved` last.
    pub time_points: TimePoints,
}

/// Aggregate of a completed broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastReport {
    pub broadcast: BroadcastId,
    pub message: Arc<PushMessage>,
    /// Outcome per target.
    pub outcomes: BTreeMap<ConnectionId, DeliveryOutcome>,
    pub started_at: Instant,
    pub completed_at: Instant,
}

impl BroadcastReport {
    /// Number of targets that ended with `outcome`.
    pub fn count(&self, outcome: DeliveryOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == outcome).count()
    }

    /// Number of targets that received the message.
    pub fn delivered(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }
}

/// Error returned by a listener. Logged; never stops the chain.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Publish(#[from] crate::republish::PublishError),
}

/// Observer of terminal delivery events. Every method defaults to a no-op.
pub trait PushListener: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_success(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_ack_success(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_broadcast_complete(&self, _report: &BroadcastReport) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_failure(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_offline(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_redirect(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_timeout(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
        Ok(())
    }
}

struct Registration {
    order: i32,
    seq: u64,
    listener: Arc<dyn PushListener>,
}

/// Listeners sorted by order key; ties keep registration order.
#[derive(Default)]
pub struct ListenerChain {
    entries: RwLock<Vec<Registration>>,
    next_seq: AtomicU64,
}

impl ListenerChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Lower `order` runs first.
    pub fn register(&self, listener: Arc<dyn PushListener>, order: i32) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Registered push listener {} (order {order})", listener.name());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(Registration {
            order,
            seq,
            listener,
        });
        entries.sort_by_key(|r| (r.order, r.seq));
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke the method matching `report.outcome` on every listener.
    pub fn notify(&self, report: &DeliveryReport) {
        self.each(|listener| match report.outcome {
            DeliveryOutcome::Success => listener.on_success(report),
            DeliveryOutcome::AckSuccess => listener.on_ack_success(report),
            DeliveryOutcome::Failure => listener.on_failure(report),
            DeliveryOutcome::Timeout => listener.on_timeout(report),
            DeliveryOutcome::Redirect => listener.on_redirect(report),
            DeliveryOutcome::Offline => listener.on_offline(report),
        });
    }

    /// Invoke `on_broadcast_complete` on every listener.
    pub fn notify_broadcast(&self, report: &BroadcastReport) {
        self.each(|listener| listener.on_broadcast_complete(report));
    }

    fn each<F>(&self, mut invoke: F)
    where
        F: FnMut(&dyn PushListener) -> Result<(), ListenerError>,
    {
        // Snapshot so listeners may register others without deadlocking.
        let listeners: Vec<Arc<dyn PushListener>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| invoke(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = %listener.name(), error = %e, "Push listener failed");
                }
                Err(panic) => {
                    let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    tracing::error!(listener = %listener.name(), panic = %panic_msg, "Push listener panicked");
                }
            }
        }
    }
}

/// Logs one structured line per terminal event.
#[derive(Debug, Default)]
pub struct TracingListener;

impl TracingListener {
    fn log(report: &DeliveryReport) {
        let elapsed_ms = report
            .time_points
            .total()
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        match report.outcome {
            DeliveryOutcome::Success | DeliveryOutcome::AckSuccess => tracing::debug!(
                message = %report.message.id,
                connection = %report.connection,
                outcome = %report.outcome,
                elapsed_ms,
                "Push delivered"
            ),
            _ => tracing::info!(
                message = %report.message.id,
                connection = %report.connection,
                outcome = %report.outcome,
                detail = report.detail.as_deref().unwrap_or(""),
                elapsed_ms,
                "Push not delivered"
            ),
        }
    }
}

impl PushListener for TracingListener {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_success(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        Self::log(report);
        Ok(())
    }

    fn on_ack_success(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        Self::log(report);
        Ok(())
    }

    fn on_broadcast_complete(&self, report: &BroadcastReport) -> Result<(), ListenerError> {
        tracing::info!(
            broadcast = %report.broadcast,
            targets = report.outcomes.len(),
            delivered = report.delivered(),
            "Broadcast complete"
        );
        Ok(())
    }

    fn on_failure(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        Self::log(report);
        Ok(())
    }

    fn on_offline(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        Self::log(report);
        Ok(())
    }

    fn on_redirect(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        Self::log(report);
        Ok(())
    }

    fn on_timeout(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        Self::log(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushgate_net::MessageId;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PushListener for Recorder {
        fn on_success(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
            self.log.lock().unwrap().push(format!("{}:success", self.label));
            Ok(())
        }

        fn on_timeout(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
            self.log.lock().unwrap().push(format!("{}:timeout", self.label));
            Ok(())
        }
    }

    struct Failing;

    impl PushListener for Failing {
        fn on_success(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
            Err(ListenerError::Rejected("nope".into()))
        }
    }

    struct Panicking;

    impl PushListener for Panicking {
        fn on_success(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
            panic!("listener bug");
        }
    }

    fn report(outcome: DeliveryOutcome) -> DeliveryReport {
        DeliveryReport {
            message: Arc::new(PushMessage::new(9, b"hi".to_vec())),
            connection: ConnectionId(1),
            broadcast: None,
            outcome,
            detail: None,
            time_points: TimePoints::default(),
        }
    }

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn PushListener> {
        Arc::new(Recorder {
            label,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn test_order_key_then_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(recorder("late", &log), 10);
        chain.register(recorder("first", &log), -1);
        chain.register(recorder("tie-a", &log), 5);
        chain.register(recorder("tie-b", &log), 5);

        chain.notify(&report(DeliveryOutcome::Success));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:success", "tie-a:success", "tie-b:success", "late:success"]
        );
    }

    #[test]
    fn test_dispatches_by_outcome() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(recorder("r", &log), 0);
        chain.notify(&report(DeliveryOutcome::Timeout));
        chain.notify(&report(DeliveryOutcome::Offline));
        assert_eq!(*log.lock().unwrap(), vec!["r:timeout"]);
    }

    #[test]
    fn test_error_and_panic_do_not_stop_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(Arc::new(Failing), 0);
        chain.register(Arc::new(Panicking), 1);
        chain.register(recorder("after", &log), 2);

        chain.notify(&report(DeliveryOutcome::Success));
        chain.notify(&report(DeliveryOutcome::Success));
        assert_eq!(*log.lock().unwrap(), vec!["after:success", "after:success"]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_broadcast_report_counts() {
        let report = BroadcastReport {
            broadcast: BroadcastId(1),
            message: Arc::new(PushMessage::new(1, Vec::new())),
            outcomes: BTreeMap::from([
                (ConnectionId(1), DeliveryOutcome::AckSuccess),
                (ConnectionId(2), DeliveryOutcome::Timeout),
                (ConnectionId(3), DeliveryOutcome::Offline),
            ]),
            started_at: Instant::now(),
            completed_at: Instant::now(),
        };
        assert_eq!(report.delivered(), 1);
        assert_eq!(report.count(DeliveryOutcome::Timeout), 1);
        assert_eq!(report.message.id, MessageId(1));
    }
}
