use consensus::{ChangeRequestState, DiscoverResponse, Inconsistency};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::NodeAddress;

/// How far the cluster can be trusted once a process is done.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Consistency {
    Consistent,
    /// Some node may hold a change that was not settled; run recovery.
    MayNeedRecovery,
    /// The process stopped before any mutation was sent.
    UnknownButNoChange,
    /// The same change is committed on one node and rolled back on another.
    UnrecoverablyInconsistent,
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Consistency::Consistent => "consistent",
            Consistency::MayNeedRecovery => "may need recovery",
            Consistency::UnknownButNoChange => "unknown but no change",
            Consistency::UnrecoverablyInconsistent => "unrecoverably inconsistent",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Discover,
    Prepare,
    Takeover,
    Commit,
    Rollback,
}

/// Last known outcome for one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeOutcome {
    Discovered,
    Prepared,
    TakenOver,
    Committed,
    RolledBack,
    /// A rollback reached a node that never recorded the change.
    NothingToRollBack,
    Rejected { phase: Phase, reason: String },
    Failed { phase: Phase, reason: String },
    /// The node had already moved the change to `state`.
    Inconsistent {
        phase: Phase,
        state: ChangeRequestState,
        reason: String,
    },
}

/// What a Change or Recovery process did, node by node.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub consistency: Consistency,
    pub change_uuid: Option<Uuid>,
    pub discovered: BTreeMap<NodeAddress, DiscoverResponse>,
    pub outcomes: BTreeMap<NodeAddress, NodeOutcome>,
}

impl ProcessReport {
    pub fn new() -> Self {
        Self {
            consistency: Consistency::UnknownButNoChange,
            change_uuid: None,
            discovered: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }

    pub fn outcome(&self, node: &NodeAddress) -> Option<&NodeOutcome> {
        self.outcomes.get(node)
    }

    pub fn count(&self, outcome: &NodeOutcome) -> usize {
        self.outcomes.values().filter(|o| *o == outcome).count()
    }

    pub(crate) fn record(&mut self, node: &NodeAddress, outcome: NodeOutcome) {
        self.outcomes.insert(node.clone(), outcome);
    }
}

impl Default for ProcessReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks fired while a client process runs. Every method defaults to a
/// no-op so receivers implement only what they care about.
#[allow(unused_variables)]
pub trait ResultsReceiver: Send {
    fn start_discovery(&mut self, nodes: &[NodeAddress]) {}
    fn discovered(&mut self, node: &NodeAddress, response: &DiscoverResponse) {}
    fn discover_fail(&mut self, node: &NodeAddress, reason: &str) {}
    fn discover_config_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed: &[NodeAddress],
        rolled_back: &[NodeAddress],
    ) {
    }
    fn discover_already_prepared(
        &mut self,
        node: &NodeAddress,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
    }
    fn end_discovery(&mut self) {}

    fn start_second_discovery(&mut self) {}
    fn discover_repeated(&mut self, node: &NodeAddress) {}
    fn discover_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {}
    fn end_second_discovery(&mut self) {}

    fn start_prepare(&mut self, change_uuid: Uuid) {}
    fn prepared(&mut self, node: &NodeAddress) {}
    fn prepare_fail(&mut self, node: &NodeAddress, reason: &str) {}
    fn prepare_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {}
    fn prepare_change_unacceptable(&mut self, node: &NodeAddress, reason: &str) {}
    fn end_prepare(&mut self) {}

    fn start_takeover(&mut self) {}
    fn takeover(&mut self, node: &NodeAddress) {}
    fn takeover_fail(&mut self, node: &NodeAddress, reason: &str) {}
    fn takeover_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {}
    fn end_takeover(&mut self) {}

    fn start_commit(&mut self) {}
    fn committed(&mut self, node: &NodeAddress) {}
    fn commit_fail(&mut self, node: &NodeAddress, reason: &str) {}
    fn commit_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {}
    /// The node already settled the change the other way.
    fn commit_inconsistent(&mut self, node: &NodeAddress, inconsistency: &Inconsistency) {}
    fn end_commit(&mut self) {}

    fn start_rollback(&mut self) {}
    fn rolled_back(&mut self, node: &NodeAddress) {}
    fn rollback_fail(&mut self, node: &NodeAddress, reason: &str) {}
    fn rollback_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {}
    fn rollback_inconsistent(&mut self, node: &NodeAddress, inconsistency: &Inconsistency) {}
    fn end_rollback(&mut self) {}

    fn cannot_decide_over_commit_or_rollback(&mut self) {}
    fn done(&mut self, consistency: Consistency) {}
}

/// Logs every callback through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReceiver;

impl ResultsReceiver for LoggingReceiver {
    fn start_discovery(&mut self, nodes: &[NodeAddress]) {
        tracing::info!("Discovering {} nodes", nodes.len());
    }

    fn discovered(&mut self, node: &NodeAddress, response: &DiscoverResponse) {
        tracing::info!(
            "Discovered {}: mode {}, version {}/{}, {} mutative messages",
            node,
            response.mode,
            response.current_version,
            response.highest_version,
            response.mutative_message_count
        );
    }

    fn discover_fail(&mut self, node: &NodeAddress, reason: &str) {
        tracing::warn!("Discovery of {} failed: {}", node, reason);
    }

    fn discover_config_inconsistent(
        &mut self,
        change_uuid: Uuid,
        committed: &[NodeAddress],
        rolled_back: &[NodeAddress],
    ) {
        tracing::error!(
            "Change {} is committed on {:?} but rolled back on {:?}",
            change_uuid,
            committed,
            rolled_back
        );
    }

    fn discover_already_prepared(
        &mut self,
        node: &NodeAddress,
        change_uuid: Uuid,
        creation_host: &str,
        creation_user: &str,
    ) {
        tracing::warn!(
            "{} already has change {} prepared by {}@{}",
            node,
            change_uuid,
            creation_user,
            creation_host
        );
    }

    fn start_second_discovery(&mut self) {
        tracing::debug!("Re-discovering to detect concurrent clients");
    }

    fn discover_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {
        tracing::warn!(
            "{} was changed by another client ({}@{})",
            node,
            user,
            host
        );
    }

    fn start_prepare(&mut self, change_uuid: Uuid) {
        tracing::info!("Preparing change {}", change_uuid);
    }

    fn prepared(&mut self, node: &NodeAddress) {
        tracing::info!("{} prepared", node);
    }

    fn prepare_fail(&mut self, node: &NodeAddress, reason: &str) {
        tracing::warn!("Prepare on {} failed: {}", node, reason);
    }

    fn prepare_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {
        tracing::warn!(
            "Prepare on {} lost to another client ({}@{})",
            node,
            user,
            host
        );
    }

    fn prepare_change_unacceptable(&mut self, node: &NodeAddress, reason: &str) {
        tracing::warn!("{} refused the change: {}", node, reason);
    }

    fn start_takeover(&mut self) {
        tracing::info!("Taking over nodes");
    }

    fn takeover(&mut self, node: &NodeAddress) {
        tracing::info!("{} taken over", node);
    }

    fn takeover_fail(&mut self, node: &NodeAddress, reason: &str) {
        tracing::warn!("Takeover of {} failed: {}", node, reason);
    }

    fn takeover_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {
        tracing::warn!(
            "Takeover of {} lost to another client ({}@{})",
            node,
            user,
            host
        );
    }

    fn start_commit(&mut self) {
        tracing::info!("Committing");
    }

    fn committed(&mut self, node: &NodeAddress) {
        tracing::info!("{} committed", node);
    }

    fn commit_fail(&mut self, node: &NodeAddress, reason: &str) {
        tracing::error!("Commit on {} failed: {}", node, reason);
    }

    fn commit_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {
        tracing::warn!(
            "Commit on {} lost to another client ({}@{})",
            node,
            user,
            host
        );
    }

    fn commit_inconsistent(&mut self, node: &NodeAddress, inconsistency: &Inconsistency) {
        tracing::error!(
            "Commit on {} contradicts its {} change {}: {}",
            node,
            inconsistency.state,
            inconsistency.change_uuid,
            inconsistency.message
        );
    }

    fn start_rollback(&mut self) {
        tracing::info!("Rolling back");
    }

    fn rolled_back(&mut self, node: &NodeAddress) {
        tracing::info!("{} rolled back", node);
    }

    fn rollback_fail(&mut self, node: &NodeAddress, reason: &str) {
        tracing::error!("Rollback on {} failed: {}", node, reason);
    }

    fn rollback_other_client(&mut self, node: &NodeAddress, host: &str, user: &str) {
        tracing::warn!(
            "Rollback on {} lost to another client ({}@{})",
            node,
            user,
            host
        );
    }

    fn rollback_inconsistent(&mut self, node: &NodeAddress, inconsistency: &Inconsistency) {
        tracing::error!(
            "Rollback on {} contradicts its {} change {}: {}",
            node,
            inconsistency.state,
            inconsistency.change_uuid,
            inconsistency.message
        );
    }

    fn cannot_decide_over_commit_or_rollback(&mut self) {
        tracing::error!("Cannot decide whether to commit or roll back; pass a forced state");
    }

    fn done(&mut self, consistency: Consistency) {
        tracing::info!("Finished: cluster is {}", consistency);
    }
}

/// Forwards every callback to each inner receiver in turn.
#[derive(Default)]
pub struct MultiReceiver {
    receivers: Vec<Box<dyn ResultsReceiver>>,
}

impl MultiReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, receiver: impl ResultsReceiver + 'static) -> Self {
        self.receivers.push(Box::new(receiver));
        self
    }

    pub fn push(&mut self, receiver: Box<dyn ResultsReceiver>) {
        self.receivers.push(receiver);
    }
}

macro_rules! forward {
    ($( fn $name:ident(&mut self $(, $arg:ident: $ty:ty)*); )*) => {
        $(
            fn $name(&mut self $(, $arg: $ty)*) {
                for receiver in &mut self.receivers {
                    receiver.$name($($arg),*);
                }
            }
        )*
    };
}

impl ResultsReceiver for MultiReceiver {
    forward! {
        fn start_discovery(&mut self, nodes: &[NodeAddress]);
        fn discovered(&mut self, node: &NodeAddress, response: &DiscoverResponse);
        fn discover_fail(&mut self, node: &NodeAddress, reason: &str);
        fn discover_config_inconsistent(
            &mut self,
            change_uuid: Uuid,
            committed: &[NodeAddress],
            rolled_back: &[NodeAddress]
        );
        fn discover_already_prepared(
            &mut self,
            node: &NodeAddress,
            change_uuid: Uuid,
            creation_host: &str,
            creation_user: &str
        );
        fn end_discovery(&mut self);
        fn start_second_discovery(&mut self);
        fn discover_repeated(&mut self, node: &NodeAddress);
        fn discover_other_client(&mut self, node: &NodeAddress, host: &str, user: &str);
        fn end_second_discovery(&mut self);
        fn start_prepare(&mut self, change_uuid: Uuid);
        fn prepared(&mut self, node: &NodeAddress);
        fn prepare_fail(&mut self, node: &NodeAddress, reason: &str);
        fn prepare_other_client(&mut self, node: &NodeAddress, host: &str, user: &str);
        fn prepare_change_unacceptable(&mut self, node: &NodeAddress, reason: &str);
        fn end_prepare(&mut self);
        fn start_takeover(&mut self);
        fn takeover(&mut self, node: &NodeAddress);
        fn takeover_fail(&mut self, node: &NodeAddress, reason: &str);
        fn takeover_other_client(&mut self, node: &NodeAddress, host: &str, user: &str);
        fn end_takeover(&mut self);
        fn start_commit(&mut self);
        fn committed(&mut self, node: &NodeAddress);
        fn commit_fail(&mut self, node: &NodeAddress, reason: &str);
        fn commit_other_client(&mut self, node: &NodeAddress, host: &str, user: &str);
        fn commit_inconsistent(&mut self, node: &NodeAddress, inconsistency: &Inconsistency);
        fn end_commit(&mut self);
        fn start_rollback(&mut self);
        fn rolled_back(&mut self, node: &NodeAddress);
        fn rollback_fail(&mut self, node: &NodeAddress, reason: &str);
        fn rollback_other_client(&mut self, node: &NodeAddress, host: &str, user: &str);
        fn rollback_inconsistent(&mut self, node: &NodeAddress, inconsistency: &Inconsistency);
        fn end_rollback(&mut self);
        fn cannot_decide_over_commit_or_rollback(&mut self);
        fn done(&mut self, consistency: Consistency);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingReceiver;
    use super::*;

    #[test]
    fn multi_receiver_forwards_to_all() {
        let first = RecordingReceiver::default();
        let second = RecordingReceiver::default();
        let mut multi = MultiReceiver::new()
            .with(first.clone())
            .with(LoggingReceiver)
            .with(second.clone());

        let node = NodeAddress::new("node-0", "localhost", 9410);
        multi.prepared(&node);
        multi.done(Consistency::Consistent);

        for receiver in [first, second] {
            assert_eq!(receiver.events(), vec!["prepared", "done:Consistent"]);
        }
    }

    #[test]
    fn report_counts_outcomes() {
        let mut report = ProcessReport::new();
        report.record(&NodeAddress::new("a", "h", 1), NodeOutcome::Committed);
        report.record(&NodeAddress::new("b", "h", 2), NodeOutcome::Committed);
        report.record(
            &NodeAddress::new("c", "h", 3),
            NodeOutcome::Failed {
                phase: Phase::Commit,
                reason: "offline".to_string(),
            },
        );

        assert_eq!(report.count(&NodeOutcome::Committed), 2);
        assert_eq!(report.consistency, Consistency::UnknownButNoChange);
    }
}
