//! Per-message delivery record and its exactly-once state machine.
//!
//! ```text
//! Dispatched ──sent──▶ AwaitingAck ──▶ AckSuccess | Timeout | Failure | Redirect | Offline
//!     │
//!     └──▶ Success (no ack required) | Failure | Redirect | Offline
//! ```
//!
//! Every transition is a compare-and-set on the record's state byte. Exactly
//! one caller wins the move into a terminal state; the rest observe `false`
//! and do nothing.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

use crate::message::{BroadcastId, DeliveryKey, PushMessage};

/// State of a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryState {
    /// Queued for the target's worker; not yet written.
    Dispatched = 0,
    /// Written; the ack timer is running.
    AwaitingAck = 1,
    /// Written and no ack was required.
    Success = 2,
    /// Acknowledged by the client.
    AckSuccess = 3,
    /// Write or transport failure.
    Failure = 4,
    /// The ack window elapsed.
    Timeout = 5,
    /// The client was sent elsewhere.
    Redirect = 6,
    /// The target was absent or went away.
    Offline = 7,
}

impl DeliveryState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Dispatched,
            1 => Self::AwaitingAck,
            2 => Self::Success,
            3 => Self::AckSuccess,
            4 => Self::Failure,
            5 => Self::Timeout,
            6 => Self::Redirect,
            _ => Self::Offline,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Dispatched | Self::AwaitingAck)
    }

    /// The outcome this state represents, if terminal.
    pub fn outcome(self) -> Option<DeliveryOutcome> {
        match self {
            Self::Dispatched | Self::AwaitingAck => None,
            Self::Success => Some(DeliveryOutcome::Success),
            Self::AckSuccess => Some(DeliveryOutcome::AckSuccess),
            Self::Failure => Some(DeliveryOutcome::Failure),
            Self::Timeout => Some(DeliveryOutcome::Timeout),
            Self::Redirect => Some(DeliveryOutcome::Redirect),
            Self::Offline => Some(DeliveryOutcome::Offline),
        }
    }
}

/// Terminal result of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeliveryOutcome {
    /// Written; no ack was required.
    Success,
    /// The client acknowledged the message.
    AckSuccess,
    /// The frame could not be written or the connection broke.
    Failure,
    /// No ack within the ack window.
    Timeout,
    /// The client was told to reconnect elsewhere.
    Redirect,
    /// The target was absent or disconnected mid-flight.
    Offline,
}

impl DeliveryOutcome {
    /// Record state for this outcome.
    pub fn state(self) -> DeliveryState {
        match self {
            Self::Success => DeliveryState::Success,
            Self::AckSuccess => DeliveryState::AckSuccess,
            Self::Failure => DeliveryState::Failure,
            Self::Timeout => DeliveryState::Timeout,
            Self::Redirect => DeliveryState::Redirect,
            Self::Offline => DeliveryState::Offline,
        }
    }

    /// Whether a record in `state` may resolve to this outcome.
    pub fn allowed_from(self, state: DeliveryState) -> bool {
        match self {
            Self::Success => state == DeliveryState::Dispatched,
            Self::AckSuccess | Self::Timeout => state == DeliveryState::AwaitingAck,
            Self::Failure | Self::Redirect | Self::Offline => !state.is_terminal(),
        }
    }

    /// Whether the message reached the client.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::AckSuccess)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::AckSuccess => "ack_success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Redirect => "redirect",
            Self::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Points in a record's life that get timestamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// The record was created.
    Dispatched,
    /// The frame finished writing.
    Sent,
    /// The client's ack arrived.
    Acked,
    /// The record reached a terminal state.
    Resolved,
}

/// Ordered timing checkpoints of one record.
#[derive(Debug, Clone, Default)]
pub struct TimePoints {
    entries: Vec<(Checkpoint, Instant)>,
}

impl TimePoints {
    fn mark(&mut self, checkpoint: Checkpoint, at: Instant) {
        self.entries.push((checkpoint, at));
    }

    /// When `checkpoint` was reached, if it was.
    pub fn get(&self, checkpoint: Checkpoint) -> Option<Instant> {
        self.entries
            .iter()
            .find(|(c, _)| *c == checkpoint)
            .map(|(_, at)| *at)
    }

    /// Time from `from` to `to`, if both were reached.
    pub fn between(&self, from: Checkpoint, to: Checkpoint) -> Option<Duration> {
        Some(self.get(to)?.saturating_duration_since(self.get(from)?))
    }

    /// Dispatch-to-resolution latency.
    pub fn total(&self) -> Option<Duration> {
        self.between(Checkpoint::Dispatched, Checkpoint::Resolved)
    }

    /// Checkpoints in the order they were reached.
    pub fn iter(&self) -> impl Iterator<Item = (Checkpoint, Instant)> + '_ {
        self.entries.iter().copied()
    }

    /// Number of checkpoints reached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True before the first checkpoint.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One outstanding delivery.
#[derive(Debug)]
pub struct DeliveryRecord {
    key: DeliveryKey,
    message: Arc<PushMessage>,
    broadcast: Option<BroadcastId>,
    state: AtomicU8,
    time_points: Mutex<TimePoints>,
    timer: Mutex<Option<AbortHandle>>,
}

impl DeliveryRecord {
    /// A record in `Dispatched`, with the dispatch checkpoint set.
    pub fn new(key: DeliveryKey, message: Arc<PushMessage>, broadcast: Option<BroadcastId>) -> Self {
        let mut time_points = TimePoints::default();
        time_points.mark(Checkpoint::Dispatched, Instant::now());
        Self {
            key,
            message,
            broadcast,
            state: AtomicU8::new(DeliveryState::Dispatched as u8),
            time_points: Mutex::new(time_points),
            timer: Mutex::new(None),
        }
    }

    /// Target connection and message id.
    pub fn key(&self) -> DeliveryKey {
        self.key
    }

    /// The message being delivered.
    pub fn message(&self) -> &Arc<PushMessage> {
        &self.message
    }

    /// Broadcast this delivery belongs to, if any.
    pub fn broadcast(&self) -> Option<BroadcastId> {
        self.broadcast
    }

    /// Current state.
    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Dispatched -> AwaitingAck`. False if the record already moved on.
    pub fn begin_awaiting_ack(&self) -> bool {
        self.state
            .compare_exchange(
                DeliveryState::Dispatched as u8,
                DeliveryState::AwaitingAck as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move into the terminal state for `outcome`. Returns true for exactly
    /// one caller per record.
    pub fn try_resolve(&self, outcome: DeliveryOutcome) -> bool {
        let target = outcome.state() as u8;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !outcome.allowed_from(DeliveryState::from_u8(current)) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                // Lost to a concurrent transition; re-check against what won.
                Err(actual) => current = actual,
            }
        }
    }

    /// Timestamp `checkpoint` now.
    pub fn mark(&self, checkpoint: Checkpoint) {
        lock(&self.time_points).mark(checkpoint, Instant::now());
    }

    /// Snapshot of the checkpoints.
    pub fn time_points(&self) -> TimePoints {
        lock(&self.time_points).clone()
    }

    /// Attach the ack timer. If the record resolved while the timer was being
    /// armed, the timer is aborted immediately.
    pub fn set_timer(&self, handle: AbortHandle) {
        *lock(&self.timer) = Some(handle);
        if self.state().is_terminal() {
            self.cancel_timer();
        }
    }

    /// Abort the ack timer, if armed.
    pub fn cancel_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushgate_net::{ConnectionId, MessageId};

    fn record() -> DeliveryRecord {
        DeliveryRecord::new(
            DeliveryKey::new(ConnectionId(1), MessageId(1)),
            Arc::new(PushMessage::new(1, b"x".to_vec())),
            None,
        )
    }

    #[test]
    fn test_ack_only_accepted_while_awaiting() {
        let rec = record();
        assert!(!rec.try_resolve(DeliveryOutcome::AckSuccess));
        assert!(!rec.try_resolve(DeliveryOutcome::Timeout));
        assert_eq!(rec.state(), DeliveryState::Dispatched);

        assert!(rec.begin_awaiting_ack());
        assert!(rec.try_resolve(DeliveryOutcome::AckSuccess));
        assert_eq!(rec.state(), DeliveryState::AckSuccess);
    }

    #[test]
    fn test_success_only_from_dispatched() {
        let rec = record();
        assert!(rec.begin_awaiting_ack());
        assert!(!rec.try_resolve(DeliveryOutcome::Success));
        assert!(rec.try_resolve(DeliveryOutcome::Offline));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let rec = record();
        assert!(rec.try_resolve(DeliveryOutcome::Failure));
        for outcome in [
            DeliveryOutcome::Success,
            DeliveryOutcome::Failure,
            DeliveryOutcome::Redirect,
            DeliveryOutcome::Offline,
        ] {
            assert!(!rec.try_resolve(outcome));
        }
        assert!(!rec.begin_awaiting_ack());
        assert_eq!(rec.state().outcome(), Some(DeliveryOutcome::Failure));
    }

    #[test]
    fn test_concurrent_resolution_single_winner() {
        for _ in 0..50 {
            let rec = Arc::new(record());
            assert!(rec.begin_awaiting_ack());
            let handles: Vec<_> = [
                DeliveryOutcome::AckSuccess,
                DeliveryOutcome::Timeout,
                DeliveryOutcome::Offline,
                DeliveryOutcome::Failure,
            ]
            .into_iter()
            .map(|outcome| {
                let rec = Arc::clone(&rec);
                std::thread::spawn(move || rec.try_resolve(outcome))
            })
            .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert!(rec.state().is_terminal());
        }
    }

    #[test]
    fn test_time_points_in_order() {
        let rec = record();
        rec.mark(Checkpoint::Sent);
        rec.mark(Checkpoint::Resolved);
        let points = rec.time_points();
        let order: Vec<_> = points.iter().map(|(c, _)| c).collect();
        assert_eq!(
            order,
            vec![Checkpoint::Dispatched, Checkpoint::Sent, Checkpoint::Resolved]
        );
        assert!(points.get(Checkpoint::Acked).is_none());
        assert!(points.total().is_some());
    }
}
