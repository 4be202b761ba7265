//! Outstanding deliveries, their ack timers, and the resolution path.
//!
//! Records live in a sharded map keyed by `(connection, message)`. Resolving a
//! record wins its state CAS, aborts its timer, evicts it, stamps the final
//! checkpoint, notifies listeners and finally feeds the broadcast aggregator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pushgate_net::ConnectionId;

use crate::broadcast::BroadcastAggregator;
use crate::listener::{DeliveryReport, ListenerChain};
use crate::message::{BroadcastId, DeliveryKey, PushMessage};
use crate::record::{Checkpoint, DeliveryOutcome, DeliveryRecord, DeliveryState};

/// Detail attached to records failed by [`DeliveryTracker::shutdown`].
pub const SHUTDOWN_DETAIL: &str = "server shutting down";

/// Errors returned by [`DeliveryTracker::track`].
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    /// The same message is already in flight to the same connection.
    #[error("delivery {0} is already outstanding")]
    Duplicate(DeliveryKey),
    /// The tracker was shut down; the delivery was resolved as a failure.
    #[error("tracker is shut down")]
    Closed,
}

struct TrackerInner {
    records: DashMap<DeliveryKey, Arc<DeliveryRecord>>,
    ack_timeout: Duration,
    listeners: ListenerChain,
    broadcasts: BroadcastAggregator,
    closed: AtomicBool,
}

/// Shared handle to the delivery state. Cloning is cheap.
#[derive(Clone)]
pub struct DeliveryTracker {
    inner: Arc<TrackerInner>,
}

impl DeliveryTracker {
    /// An open tracker whose ack timers run for `ack_timeout`.
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                records: DashMap::new(),
                ack_timeout,
                listeners: ListenerChain::new(),
                broadcasts: BroadcastAggregator::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Configured ack window.
    pub fn ack_timeout(&self) -> Duration {
        self.inner.ack_timeout
    }

    /// Observers notified of every terminal event.
    pub fn listeners(&self) -> &ListenerChain {
        &self.inner.listeners
    }

    /// Open broadcast groups fed by resolutions.
    pub fn broadcasts(&self) -> &BroadcastAggregator {
        &self.inner.broadcasts
    }

    /// Create a `Dispatched` record for `message` on `connection`.
    ///
    /// After [`shutdown`](Self::shutdown) the delivery is resolved as a
    /// failure on the spot and `TrackError::Closed` is returned.
    pub fn track(
        &self,
        message: Arc<PushMessage>,
        connection: ConnectionId,
        broadcast: Option<BroadcastId>,
    ) -> Result<Arc<DeliveryRecord>, TrackError> {
        let key = DeliveryKey::new(connection, message.id);
        let record = Arc::new(DeliveryRecord::new(key, message, broadcast));

        if self.inner.closed.load(Ordering::Acquire) {
            self.finish(&record, DeliveryOutcome::Failure, Some(SHUTDOWN_DETAIL.to_string()));
            return Err(TrackError::Closed);
        }

        match self.inner.records.entry(key) {
            Entry::Occupied(_) => return Err(TrackError::Duplicate(key)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&record));
            }
        }

        // A shutdown racing the insert may have missed this record.
        if self.inner.closed.load(Ordering::Acquire) {
            self.finish(&record, DeliveryOutcome::Failure, Some(SHUTDOWN_DETAIL.to_string()));
            return Err(TrackError::Closed);
        }
        tracing::trace!("Tracking {key}");
        Ok(record)
    }

    /// The frame for `key` was written.
    ///
    /// Messages that need no ack resolve to success. The rest move to
    /// `AwaitingAck` and get a timer on the current runtime.
    pub fn mark_sent(&self, key: DeliveryKey) {
        let Some(record) = self.record(key) else {
            return;
        };
        record.mark(Checkpoint::Sent);

        if !record.message().requires_ack() {
            self.finish(&record, DeliveryOutcome::Success, None);
            return;
        }
        if !record.begin_awaiting_ack() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tracker = self.clone();
                let timeout = self.inner.ack_timeout;
                // Bound to this record, never to whatever holds its key later.
                let armed = Arc::downgrade(&record);
                let timer = runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(record) = armed.upgrade()
                        && tracker.expire(&record)
                    {
                        tracing::debug!("Ack for {key} timed out after {timeout:?}");
                    }
                });
                record.set_timer(timer.abort_handle());
            }
            Err(_) => tracing::warn!("No runtime to arm the ack timer for {key}"),
        }
    }

    /// Resolve `key` to `outcome`. True if this call performed the resolution.
    pub fn resolve(&self, key: DeliveryKey, outcome: DeliveryOutcome) -> bool {
        self.resolve_with_detail(key, outcome, None)
    }

    /// [`resolve`](Self::resolve) with a detail string for the listeners.
    pub fn resolve_with_detail(
        &self,
        key: DeliveryKey,
        outcome: DeliveryOutcome,
        detail: Option<String>,
    ) -> bool {
        match self.record(key) {
            Some(record) => self.finish(&record, outcome, detail),
            None => false,
        }
    }

    /// Resolve every outstanding record targeting `connection`. Returns how
    /// many this call resolved.
    pub fn resolve_connection(
        &self,
        connection: ConnectionId,
        outcome: DeliveryOutcome,
        detail: Option<&str>,
    ) -> usize {
        let records: Vec<Arc<DeliveryRecord>> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.key().connection == connection)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        records
            .iter()
            .filter(|record| self.finish(record, outcome, detail.map(str::to_string)))
            .count()
    }

    /// Number of unresolved records.
    pub fn outstanding(&self) -> usize {
        self.inner.records.len()
    }

    /// State of an unresolved record.
    pub fn state(&self, key: DeliveryKey) -> Option<DeliveryState> {
        self.inner.records.get(&key).map(|record| record.state())
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the tracker: abort every timer and fail every outstanding
    /// record. Later dispatches fail immediately.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let records: Vec<Arc<DeliveryRecord>> = self
            .inner
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let failed = records
            .iter()
            .filter(|record| {
                self.finish(record, DeliveryOutcome::Failure, Some(SHUTDOWN_DETAIL.to_string()))
            })
            .count();
        tracing::info!("Delivery tracker closed, {failed} outstanding deliveries failed");
    }

    /// Time out `record` if it is still awaiting its ack.
    fn expire(&self, record: &Arc<DeliveryRecord>) -> bool {
        self.finish(record, DeliveryOutcome::Timeout, None)
    }

    fn record(&self, key: DeliveryKey) -> Option<Arc<DeliveryRecord>> {
        self.inner.records.get(&key).map(|r| Arc::clone(r.value()))
    }

    fn finish(
        &self,
        record: &Arc<DeliveryRecord>,
        outcome: DeliveryOutcome,
        detail: Option<String>,
    ) -> bool {
        if !record.try_resolve(outcome) {
            return false;
        }
        record.cancel_timer();

        let key = record.key();
        self.inner
            .records
            .remove_if(&key, |_, stored| Arc::ptr_eq(stored, record));

        if outcome == DeliveryOutcome::AckSuccess {
            record.mark(Checkpoint::Acked);
        }
        record.mark(Checkpoint::Resolved);

        let report = DeliveryReport {
            message: Arc::clone(record.message()),
            connection: key.connection,
            broadcast: record.broadcast(),
            outcome,
            detail,
            time_points: record.time_points(),
        };
        self.inner.listeners.notify(&report);

        if let Some(broadcast) = record.broadcast()
            && let Some(summary) =
                self.inner
                    .broadcasts
                    .on_target_resolved(broadcast, key.connection, outcome)
        {
            self.inner.listeners.notify_broadcast(&summary);
        }
        true
    }
}
