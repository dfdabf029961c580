use consensus::ChangeDetails;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    ClientConfig, DiscoveryOutcome, DiscoveryProcess, Fanout, NodeAddress, NomadEndpoint,
    ResultsReceiver,
};

/// Overall cluster state as seen by one discovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalState {
    /// No change pending anywhere; a new change can start.
    Accepting,
    /// Every node prepared the same change.
    Prepared,
    /// Every online node prepared the same change; offline ones are unknown.
    MaybePrepared,
    /// Some nodes prepared a change others never saw.
    PartiallyPrepared,
    PartiallyCommitted,
    MaybePartiallyCommitted,
    PartiallyRolledBack,
    MaybePartiallyRolledBack,
    Inconsistent,
    ConcurrentAccess,
    DiscoveryFailure,
    Unknown,
    MaybeUnknown,
}

impl GlobalState {
    /// States a recovery can settle without a forced state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GlobalState::Prepared
                | GlobalState::PartiallyCommitted
                | GlobalState::PartiallyRolledBack
        )
    }
}

impl fmt::Display for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GlobalState::Accepting => "ACCEPTING",
            GlobalState::Prepared => "PREPARED",
            GlobalState::MaybePrepared => "MAYBE_PREPARED",
            GlobalState::PartiallyPrepared => "PARTIALLY_PREPARED",
            GlobalState::PartiallyCommitted => "PARTIALLY_COMMITTED",
            GlobalState::MaybePartiallyCommitted => "MAYBE_PARTIALLY_COMMITTED",
            GlobalState::PartiallyRolledBack => "PARTIALLY_ROLLED_BACK",
            GlobalState::MaybePartiallyRolledBack => "MAYBE_PARTIALLY_ROLLED_BACK",
            GlobalState::Inconsistent => "INCONSISTENT",
            GlobalState::ConcurrentAccess => "CONCURRENT_ACCESS",
            GlobalState::DiscoveryFailure => "DISCOVERY_FAILURE",
            GlobalState::Unknown => "UNKNOWN",
            GlobalState::MaybeUnknown => "MAYBE_UNKNOWN",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterAnalysis {
    pub state: GlobalState,
    pub node_count: usize,
    pub online: BTreeSet<NodeAddress>,
    pub offline: BTreeSet<NodeAddress>,
    /// Latest committed change shared by every responding node.
    pub checkpoint: Option<ChangeDetails>,
    pub inconsistent_changes: BTreeSet<Uuid>,
}

impl ClusterAnalysis {
    pub fn has_unreachable_nodes(&self) -> bool {
        !self.offline.is_empty()
    }
}

/// Runs a read-only discovery and classifies the cluster.
pub struct ConsistencyAnalyzer {
    discovery: DiscoveryProcess,
}

impl ConsistencyAnalyzer {
    pub fn new(endpoints: Vec<Arc<dyn NomadEndpoint>>, config: &ClientConfig) -> Self {
        Self {
            discovery: DiscoveryProcess::new(endpoints, Fanout::from_config(config)),
        }
    }

    pub async fn analyze(&self, receiver: &mut dyn ResultsReceiver) -> ClusterAnalysis {
        let mut outcome = self.discovery.discover(receiver).await;
        if !outcome.responses.is_empty() && !outcome.is_inconsistent() {
            self.discovery.rediscover(&mut outcome, receiver).await;
        }
        let analysis = Self::classify(&outcome);
        tracing::info!(
            "Cluster is {} ({} of {} nodes online)",
            analysis.state,
            analysis.online.len(),
            analysis.node_count
        );
        analysis
    }

    pub fn classify(outcome: &DiscoveryOutcome) -> ClusterAnalysis {
        ClusterAnalysis {
            state: Self::global_state(outcome),
            node_count: outcome.node_count,
            online: outcome.responses.keys().cloned().collect(),
            offline: outcome.failures.keys().cloned().collect(),
            checkpoint: Self::checkpoint(outcome),
            inconsistent_changes: outcome.inconsistent_changes.clone(),
        }
    }

    fn global_state(outcome: &DiscoveryOutcome) -> GlobalState {
        if outcome.responses.is_empty() {
            return GlobalState::DiscoveryFailure;
        }
        if outcome.is_inconsistent() {
            return GlobalState::Inconsistent;
        }
        if !outcome.other_client.is_empty() {
            return GlobalState::ConcurrentAccess;
        }

        let tally = outcome.tally();
        if tally.prepared == 0 && tally.in_takeover == 0 {
            return GlobalState::Accepting;
        }

        let single = tally.latest_change_uuids.len() == 1;
        let (prepared, committed, rolled_back) =
            (tally.prepared, tally.committed, tally.rolled_back);
        let all = outcome.node_count;

        if single && prepared > 0 && committed == 0 && rolled_back == 0 {
            return if prepared >= all {
                GlobalState::Prepared
            } else {
                GlobalState::MaybePrepared
            };
        }
        if tally.latest_change_uuids.len() > 1 && prepared > 0 {
            return GlobalState::PartiallyPrepared;
        }
        if single && prepared > 0 && committed > 0 && rolled_back == 0 {
            return if prepared + committed >= all {
                GlobalState::PartiallyCommitted
            } else {
                GlobalState::MaybePartiallyCommitted
            };
        }
        if single && prepared > 0 && rolled_back > 0 && committed == 0 {
            return if prepared + rolled_back >= all {
                GlobalState::PartiallyRolledBack
            } else {
                GlobalState::MaybePartiallyRolledBack
            };
        }

        if outcome.failures.is_empty() {
            GlobalState::Unknown
        } else {
            GlobalState::MaybeUnknown
        }
    }

    fn checkpoint(outcome: &DiscoveryOutcome) -> Option<ChangeDetails> {
        let mut committed = outcome
            .responses
            .values()
            .map(|r| r.latest_committed_change.as_ref());
        let first = committed.next()??;
        committed
            .all(|c| c.map_or(false, |c| c.uuid == first.uuid))
            .then(|| first.clone())
    }
}
