use consensus::{ChangeRequestState, DiscoverResponse, ServerMode};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::Consistency;

/// Counts collected from node responses while a process runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub node_count: usize,
    pub discovered: usize,
    pub discover_failed: usize,
    pub inconsistent: bool,
    pub other_client: bool,
    pub in_takeover: usize,
    /// Latest change uuids seen across responding nodes.
    pub latest_change_uuids: BTreeSet<Uuid>,
    /// Nodes whose latest change is in the given state.
    pub prepared: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub prepare_accepted: usize,
    pub prepare_rejected: usize,
    pub prepare_failed: usize,
    pub takeover_accepted: usize,
    pub takeover_failed: usize,
    /// Set once any mutative message was sent.
    pub mutation_sent: bool,
    pub second_phase_accepted: usize,
    pub second_phase_failed: usize,
}

impl Tally {
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            ..Self::default()
        }
    }

    pub fn record_discovery(&mut self, response: &DiscoverResponse) {
        self.discovered += 1;
        if response.mode == ServerMode::Takeover {
            self.in_takeover += 1;
        }
        if let Some(latest) = &response.latest_change {
            self.latest_change_uuids.insert(latest.uuid);
            match latest.state {
                ChangeRequestState::Prepared => self.prepared += 1,
                ChangeRequestState::Committed => self.committed += 1,
                ChangeRequestState::RolledBack => self.rolled_back += 1,
            }
        }
    }

    pub fn record_discover_failure(&mut self) {
        self.discover_failed += 1;
    }
}

/// Decision rules of a client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPolicy {
    /// Every node must answer and accept; any refusal rolls back.
    Change,
    /// Settles a change left behind by an interrupted process.
    Recovery {
        expected_node_count: usize,
        forced_state: Option<ChangeRequestState>,
    },
}

impl DecisionPolicy {
    pub fn is_discover_successful(&self, tally: &Tally) -> bool {
        if tally.inconsistent || tally.other_client {
            return false;
        }
        match self {
            DecisionPolicy::Change => {
                tally.discover_failed == 0 && tally.discovered == tally.node_count
            }
            DecisionPolicy::Recovery { .. } => tally.discovered > 0,
        }
    }

    /// No responding node is holding a prepared change or a takeover.
    pub fn is_whole_cluster_accepting(&self, tally: &Tally) -> bool {
        tally.prepared == 0 && tally.in_takeover == 0
    }

    pub fn is_prepare_successful(&self, tally: &Tally) -> bool {
        match self {
            DecisionPolicy::Change => {
                tally.prepare_rejected == 0
                    && tally.prepare_failed == 0
                    && tally.prepare_accepted == tally.node_count
            }
            DecisionPolicy::Recovery { .. } => false,
        }
    }

    /// Every node that answered discovery must have accepted the takeover.
    pub fn is_takeover_successful(&self, tally: &Tally) -> bool {
        match self {
            DecisionPolicy::Change => false,
            DecisionPolicy::Recovery { .. } => {
                tally.takeover_failed == 0
                    && tally.takeover_accepted == tally.discovered
                    && tally.discovered > 0
            }
        }
    }

    pub fn should_do_commit(&self, tally: &Tally) -> bool {
        match *self {
            DecisionPolicy::Change => self.is_prepare_successful(tally),
            DecisionPolicy::Recovery {
                expected_node_count,
                forced_state,
            } => {
                Self::single_pending_change(tally)
                    && tally.rolled_back == 0
                    && ((tally.prepared + tally.committed >= expected_node_count
                        && forced_state != Some(ChangeRequestState::RolledBack))
                        || tally.committed > 0
                        || forced_state == Some(ChangeRequestState::Committed))
            }
        }
    }

    /// Only meaningful once `should_do_commit` said no.
    pub fn should_do_rollback(&self, tally: &Tally) -> bool {
        match *self {
            DecisionPolicy::Change => tally.mutation_sent && !self.is_prepare_successful(tally),
            DecisionPolicy::Recovery {
                expected_node_count,
                forced_state,
            } => {
                !self.should_do_commit(tally)
                    && Self::single_pending_change(tally)
                    && tally.committed == 0
                    && ((tally.prepared + tally.rolled_back >= expected_node_count
                        && forced_state != Some(ChangeRequestState::Committed))
                        || tally.rolled_back > 0
                        || forced_state == Some(ChangeRequestState::RolledBack))
            }
        }
    }

    pub fn consistency(&self, tally: &Tally) -> Consistency {
        if tally.inconsistent {
            return Consistency::UnrecoverablyInconsistent;
        }

        if !tally.mutation_sent {
            let settled = matches!(self, DecisionPolicy::Recovery { .. })
                && self.is_discover_successful(tally)
                && self.is_whole_cluster_accepting(tally);
            return if settled {
                Consistency::Consistent
            } else {
                Consistency::UnknownButNoChange
            };
        }

        let second_phase_done = tally.second_phase_failed == 0 && tally.second_phase_accepted > 0;
        if second_phase_done && tally.discover_failed == 0 {
            Consistency::Consistent
        } else {
            Consistency::MayNeedRecovery
        }
    }

    fn single_pending_change(tally: &Tally) -> bool {
        tally.latest_change_uuids.len() == 1 && tally.prepared > 0
    }
}
