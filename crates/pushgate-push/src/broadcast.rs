//! Roll-up of per-target outcomes into one completion event per broadcast.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pushgate_net::ConnectionId;

use crate::listener::BroadcastReport;
use crate::message::{BroadcastId, PushMessage};
use crate::record::DeliveryOutcome;

/// Errors returned when opening a broadcast group.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// A group with this id is still collecting outcomes.
    #[error("broadcast {0} is already in progress")]
    Duplicate(BroadcastId),
}

struct BroadcastGroup {
    message: Arc<PushMessage>,
    targets: BTreeSet<ConnectionId>,
    outcomes: BTreeMap<ConnectionId, DeliveryOutcome>,
    started_at: Instant,
}

impl BroadcastGroup {
    fn is_complete(&self) -> bool {
        self.outcomes.len() == self.targets.len()
    }

    fn into_report(self, broadcast: BroadcastId) -> BroadcastReport {
        BroadcastReport {
            broadcast,
            message: self.message,
            outcomes: self.outcomes,
            started_at: self.started_at,
            completed_at: Instant::now(),
        }
    }
}

/// Open broadcast groups keyed by id.
#[derive(Default)]
pub struct BroadcastAggregator {
    groups: DashMap<BroadcastId, BroadcastGroup>,
}

impl BroadcastAggregator {
    /// An aggregator with no open groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a group. Duplicate targets collapse into one.
    ///
    /// An empty target set completes on the spot and its report is returned.
    pub fn begin(
        &self,
        broadcast: BroadcastId,
        message: Arc<PushMessage>,
        targets: impl IntoIterator<Item = ConnectionId>,
    ) -> Result<Option<BroadcastReport>, BroadcastError> {
        let group = BroadcastGroup {
            message,
            targets: targets.into_iter().collect(),
            outcomes: BTreeMap::new(),
            started_at: Instant::now(),
        };

        if group.targets.is_empty() {
            if self.groups.contains_key(&broadcast) {
                return Err(BroadcastError::Duplicate(broadcast));
            }
            return Ok(Some(group.into_report(broadcast)));
        }

        match self.groups.entry(broadcast) {
            Entry::Occupied(_) => Err(BroadcastError::Duplicate(broadcast)),
            Entry::Vacant(slot) => {
                tracing::debug!("Broadcast {broadcast} opened for {} targets", group.targets.len());
                slot.insert(group);
                Ok(None)
            }
        }
    }

    /// Record one target's outcome. Returns the report when this resolution
    /// completed the group. Unknown broadcasts, unknown targets and repeated
    /// resolutions are ignored.
    pub fn on_target_resolved(
        &self,
        broadcast: BroadcastId,
        target: ConnectionId,
        outcome: DeliveryOutcome,
    ) -> Option<BroadcastReport> {
        let completed = {
            let mut group = self.groups.get_mut(&broadcast)?;
            if !group.targets.contains(&target) || group.outcomes.contains_key(&target) {
                return None;
            }
            group.outcomes.insert(target, outcome);
            group.is_complete()
        };

        if !completed {
            return None;
        }
        // Only the resolution that filled the group gets here.
        let (_, group) = self.groups.remove(&broadcast)?;
        Some(group.into_report(broadcast))
    }

    /// Number of open groups.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Whether `broadcast` is still waiting on targets.
    pub fn contains(&self, broadcast: BroadcastId) -> bool {
        self.groups.contains_key(&broadcast)
    }
}
