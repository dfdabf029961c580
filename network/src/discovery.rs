use consensus::{ChangeRequestState, DiscoverResponse};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::{Fanout, NodeAddress, NomadEndpoint, ResultsReceiver, Tally};

/// What one discovery round learnt about the cluster.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub node_count: usize,
    pub responses: BTreeMap<NodeAddress, DiscoverResponse>,
    pub failures: BTreeMap<NodeAddress, String>,
    /// Changes committed on some nodes and rolled back on others.
    pub inconsistent_changes: BTreeSet<Uuid>,
    pub already_prepared: BTreeSet<NodeAddress>,
    /// Nodes mutated by someone else between the two rounds.
    pub other_client: BTreeSet<NodeAddress>,
}

/// Mutative message count this client expects each node to be at. Every
/// mutation a node accepts moves its count by one; a node whose count moved
/// for any other reason rejects the next message as `Dead`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutativeCounts(BTreeMap<NodeAddress, u64>);

impl MutativeCounts {
    pub fn expected(&self, node: &NodeAddress) -> u64 {
        self.0.get(node).copied().unwrap_or_default()
    }

    pub fn advance(&mut self, node: &NodeAddress) {
        *self.0.entry(node.clone()).or_default() += 1;
    }
}

impl DiscoveryOutcome {
    pub fn is_inconsistent(&self) -> bool {
        !self.inconsistent_changes.is_empty()
    }

    /// Highest version known anywhere; the next change gets this plus one.
    pub fn max_highest_version(&self) -> u64 {
        self.responses
            .values()
            .map(|r| r.highest_version)
            .max()
            .unwrap_or(0)
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally::new(self.node_count);
        for response in self.responses.values() {
            tally.record_discovery(response);
        }
        tally.discover_failed = self.failures.len();
        tally.inconsistent = self.is_inconsistent();
        tally.other_client = !self.other_client.is_empty();
        tally
    }

    /// Counts as of the first round; a second round only confirms them.
    pub fn mutative_counts(&self) -> MutativeCounts {
        MutativeCounts(
            self.responses
                .iter()
                .map(|(node, response)| (node.clone(), response.mutative_message_count))
                .collect(),
        )
    }

    /// Endpoints of the nodes that answered.
    pub fn online(&self, endpoints: &[Arc<dyn NomadEndpoint>]) -> Vec<Arc<dyn NomadEndpoint>> {
        endpoints
            .iter()
            .filter(|e| self.responses.contains_key(e.address()))
            .cloned()
            .collect()
    }

    /// Endpoints of the nodes whose latest change is still prepared.
    pub fn prepared(&self, endpoints: &[Arc<dyn NomadEndpoint>]) -> Vec<Arc<dyn NomadEndpoint>> {
        endpoints
            .iter()
            .filter(|e| self.responses.get(e.address()).map_or(false, |r| r.is_prepared()))
            .cloned()
            .collect()
    }

    fn check_consistency(&mut self, receiver: &mut dyn ResultsReceiver) {
        let mut committed: BTreeMap<Uuid, Vec<NodeAddress>> = BTreeMap::new();
        let mut rolled_back: BTreeMap<Uuid, Vec<NodeAddress>> = BTreeMap::new();

        for (node, response) in &self.responses {
            let mut seen = BTreeSet::new();
            for details in [&response.latest_change, &response.latest_committed_change]
                .into_iter()
                .flatten()
            {
                if !seen.insert(details.uuid) {
                    continue;
                }
                let holders = match details.state {
                    ChangeRequestState::Committed => &mut committed,
                    ChangeRequestState::RolledBack => &mut rolled_back,
                    ChangeRequestState::Prepared => continue,
                };
                holders.entry(details.uuid).or_default().push(node.clone());
            }
        }

        for (uuid, committed_on) in &committed {
            if let Some(rolled_back_on) = rolled_back.get(uuid) {
                receiver.discover_config_inconsistent(*uuid, committed_on, rolled_back_on);
                self.inconsistent_changes.insert(*uuid);
            }
        }
    }

    fn flag_prepared(&mut self, receiver: &mut dyn ResultsReceiver) {
        for (node, response) in &self.responses {
            let prepared = response
                .latest_change
                .as_ref()
                .filter(|c| c.state == ChangeRequestState::Prepared);
            if let Some(latest) = prepared {
                receiver.discover_already_prepared(
                    node,
                    latest.uuid,
                    &latest.creation_host,
                    &latest.creation_user,
                );
                self.already_prepared.insert(node.clone());
            }
        }
    }
}

/// Asks every node for its state.
pub struct DiscoveryProcess {
    endpoints: Vec<Arc<dyn NomadEndpoint>>,
    fanout: Fanout,
}

impl DiscoveryProcess {
    pub fn new(endpoints: Vec<Arc<dyn NomadEndpoint>>, fanout: Fanout) -> Self {
        Self { endpoints, fanout }
    }

    pub fn endpoints(&self) -> &[Arc<dyn NomadEndpoint>] {
        &self.endpoints
    }

    /// Failures are reported and recorded, never returned as errors.
    pub async fn discover(&self, receiver: &mut dyn ResultsReceiver) -> DiscoveryOutcome {
        let nodes: Vec<NodeAddress> = self.endpoints.iter().map(|e| e.address().clone()).collect();
        receiver.start_discovery(&nodes);

        let mut outcome = DiscoveryOutcome {
            node_count: self.endpoints.len(),
            ..DiscoveryOutcome::default()
        };

        let results = self
            .fanout
            .broadcast(
                &self.endpoints,
                |endpoint| async move { endpoint.discover().await },
                |node, result| match result {
                    Ok(response) => receiver.discovered(node, response),
                    Err(e) => receiver.discover_fail(node, &e.to_string()),
                },
            )
            .await;

        for (node, result) in results {
            match result {
                Ok(response) => {
                    outcome.responses.insert(node, response);
                }
                Err(e) => {
                    outcome.failures.insert(node, e.to_string());
                }
            }
        }

        outcome.check_consistency(receiver);
        outcome.flag_prepared(receiver);
        receiver.end_discovery();

        tracing::debug!(
            "Discovery: {} answered, {} failed",
            outcome.responses.len(),
            outcome.failures.len()
        );
        outcome
    }

    /// Asks the nodes that answered `first` again and compares mutative
    /// message counts. A changed count means another client got in.
    pub async fn rediscover(
        &self,
        first: &mut DiscoveryOutcome,
        receiver: &mut dyn ResultsReceiver,
    ) {
        receiver.start_second_discovery();

        let online = first.online(&self.endpoints);
        let results = self
            .fanout
            .broadcast(
                &online,
                |endpoint| async move { endpoint.discover().await },
                |_, _| {},
            )
            .await;

        for (node, result) in results {
            let earlier = first
                .responses
                .get(&node)
                .map(|r| r.mutative_message_count)
                .unwrap_or_default();
            match result {
                Ok(response) if response.mutative_message_count == earlier => {
                    receiver.discover_repeated(&node)
                }
                Ok(response) => {
                    receiver.discover_other_client(
                        &node,
                        response.last_mutation_host.as_deref().unwrap_or_default(),
                        response.last_mutation_user.as_deref().unwrap_or_default(),
                    );
                    first.other_client.insert(node);
                }
                Err(e) => {
                    receiver.discover_fail(&node, &e.to_string());
                    first.responses.remove(&node);
                    first.already_prepared.remove(&node);
                    first.failures.insert(node, e.to_string());
                }
            }
        }

        receiver.end_second_discovery();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::testing::TestCluster;
    use crate::results::testing::RecordingReceiver;
    use consensus::{CommitMessage, MutationOwner, NomadChange, PrepareMessage, RollbackMessage};
    use std::time::Duration;

    fn fanout() -> Fanout {
        Fanout::new(4, Duration::from_secs(5))
    }

    fn prepare(owner: &MutationOwner, uuid: Uuid, version: u64) -> PrepareMessage {
        PrepareMessage::new(
            owner,
            0,
            uuid,
            version,
            NomadChange::new("set name", serde_json::json!({ "name": "cluster-a" })),
        )
    }

    #[tokio::test]
    async fn failures_are_recorded_not_fatal() {
        let cluster = TestCluster::new(3);
        let process = DiscoveryProcess::new(cluster.with_offline(2), fanout());
        let mut receiver = RecordingReceiver::default();

        let outcome = process.discover(&mut receiver).await;

        assert_eq!(outcome.responses.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert!(receiver.has("discover_fail"));

        let tally = outcome.tally();
        assert_eq!(tally.discovered, 2);
        assert_eq!(tally.discover_failed, 1);
    }

    #[tokio::test]
    async fn flags_prepared_nodes_and_versions() {
        let cluster = TestCluster::new(2);
        let owner = MutationOwner::new("host1", "admin");
        let uuid = Uuid::new_v4();
        cluster.servers[0].prepare(prepare(&owner, uuid, 1)).await.unwrap();

        let process = DiscoveryProcess::new(cluster.endpoints.clone(), fanout());
        let mut receiver = RecordingReceiver::default();
        let outcome = process.discover(&mut receiver).await;

        assert!(receiver.has("discover_already_prepared"));
        assert_eq!(outcome.already_prepared.len(), 1);
        assert_eq!(outcome.max_highest_version(), 1);
        assert_eq!(outcome.prepared(process.endpoints()).len(), 1);

        let mut counts = outcome.mutative_counts();
        let first = cluster.endpoints[0].address();
        assert_eq!(counts.expected(first), 1);
        assert_eq!(counts.expected(cluster.endpoints[1].address()), 0);
        counts.advance(first);
        assert_eq!(counts.expected(first), 2);
    }

    #[tokio::test]
    async fn committed_and_rolled_back_is_inconsistent() {
        let cluster = TestCluster::new(2);
        let owner = MutationOwner::new("host1", "admin");
        let uuid = Uuid::new_v4();
        for server in &cluster.servers {
            server.prepare(prepare(&owner, uuid, 1)).await.unwrap();
        }
        cluster.servers[0].commit(CommitMessage::new(&owner, 1, uuid)).await.unwrap();
        cluster.servers[1].rollback(RollbackMessage::new(&owner, 1, uuid)).await.unwrap();

        let process = DiscoveryProcess::new(cluster.endpoints.clone(), fanout());
        let mut receiver = RecordingReceiver::default();
        let outcome = process.discover(&mut receiver).await;

        assert!(outcome.is_inconsistent());
        assert!(outcome.inconsistent_changes.contains(&uuid));
        assert!(receiver.has("discover_config_inconsistent"));
        assert!(outcome.tally().inconsistent);
    }

    #[tokio::test]
    async fn second_round_detects_other_client() {
        let cluster = TestCluster::new(2);
        let process = DiscoveryProcess::new(cluster.endpoints.clone(), fanout());
        let mut receiver = RecordingReceiver::default();
        let mut outcome = process.discover(&mut receiver).await;

        let intruder = MutationOwner::new("host2", "someone-else");
        cluster.servers[1]
            .prepare(prepare(&intruder, Uuid::new_v4(), 1))
            .await
            .unwrap();

        process.rediscover(&mut outcome, &mut receiver).await;

        assert!(receiver.has("discover_other_client"));
        assert_eq!(outcome.other_client.len(), 1);
        assert!(outcome.tally().other_client);
    }
}
