use consensus::{
    AcceptRejectResponse, ChangeRequestState, CommitMessage, MutationOwner, RejectionReason,
    RollbackMessage, TakeoverMessage,
};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::change::{
    commit_all, failed, finish, last_mutation, record_discovery, rejected, rollback_all,
};
use crate::{
    ClientConfig, Consistency, DecisionPolicy, DiscoveryProcess, Fanout, MutativeCounts,
    NodeAddress, NodeOutcome, NomadEndpoint, Phase, ProcessReport, ResultsReceiver, Tally,
};

/// Settles a change left prepared by a client that went away.
pub struct RecoveryProcess {
    discovery: DiscoveryProcess,
    fanout: Fanout,
    owner: MutationOwner,
}

impl RecoveryProcess {
    pub fn new(endpoints: Vec<Arc<dyn NomadEndpoint>>, config: &ClientConfig) -> Self {
        let fanout = Fanout::from_config(config);
        Self {
            discovery: DiscoveryProcess::new(endpoints, fanout.clone()),
            fanout,
            owner: config.owner(),
        }
    }

    /// `expected_node_count` is the cluster size even when some nodes are
    /// unreachable; `forced_state` breaks ties the counts cannot.
    pub async fn recover(
        &self,
        expected_node_count: usize,
        forced_state: Option<ChangeRequestState>,
        receiver: &mut dyn ResultsReceiver,
    ) -> ProcessReport {
        let policy = DecisionPolicy::Recovery {
            expected_node_count,
            forced_state,
        };
        let mut report = ProcessReport::new();

        let mut outcome = self.discovery.discover(receiver).await;
        record_discovery(&mut report, &outcome);
        let mut tally = outcome.tally();

        if !policy.is_discover_successful(&tally) {
            tracing::warn!("Recovery not attempted: discovery failed");
            return finish(report, policy.consistency(&tally), receiver);
        }

        self.discovery.rediscover(&mut outcome, receiver).await;
        record_discovery(&mut report, &outcome);
        tally = outcome.tally();

        if !policy.is_discover_successful(&tally) {
            tracing::warn!("Recovery not attempted: cluster changed during discovery");
            return finish(report, policy.consistency(&tally), receiver);
        }

        if policy.is_whole_cluster_accepting(&tally) {
            tracing::info!("Nothing to recover");
            return finish(report, policy.consistency(&tally), receiver);
        }

        let mut counts = outcome.mutative_counts();
        let online = outcome.online(self.discovery.endpoints());
        self.takeover_all(&online, &mut counts, receiver, &mut tally, &mut report)
            .await;

        if !policy.is_takeover_successful(&tally) {
            tracing::warn!("Recovery stopped: takeover did not reach every online node");
            return finish(report, policy.consistency(&tally), receiver);
        }

        let change_uuid = match tally.latest_change_uuids.iter().next() {
            Some(uuid) if tally.latest_change_uuids.len() == 1 => *uuid,
            _ => {
                receiver.cannot_decide_over_commit_or_rollback();
                return finish(report, Consistency::MayNeedRecovery, receiver);
            }
        };
        report.change_uuid = Some(change_uuid);

        let targets = outcome.prepared(self.discovery.endpoints());
        let holders: BTreeSet<NodeAddress> = targets.iter().map(|e| e.address().clone()).collect();
        if policy.should_do_commit(&tally) {
            tracing::info!(
                "Recovering change {} by commit on {} nodes",
                change_uuid,
                holders.len()
            );
            commit_all(
                &self.fanout,
                &targets,
                CommitMessage::new(&self.owner, 0, change_uuid),
                &mut counts,
                receiver,
                &mut tally,
                &mut report,
            )
            .await;
        } else if policy.should_do_rollback(&tally) {
            tracing::info!(
                "Recovering change {} by rollback on {} nodes",
                change_uuid,
                holders.len()
            );
            rollback_all(
                &self.fanout,
                &targets,
                RollbackMessage::new(&self.owner, 0, change_uuid),
                &holders,
                &mut counts,
                receiver,
                &mut tally,
                &mut report,
            )
            .await;
        } else {
            receiver.cannot_decide_over_commit_or_rollback();
            return finish(report, Consistency::MayNeedRecovery, receiver);
        }

        finish(report, policy.consistency(&tally), receiver)
    }

    async fn takeover_all(
        &self,
        endpoints: &[Arc<dyn NomadEndpoint>],
        counts: &mut MutativeCounts,
        receiver: &mut dyn ResultsReceiver,
        tally: &mut Tally,
        report: &mut ProcessReport,
    ) {
        receiver.start_takeover();
        tally.mutation_sent = true;
        let mut taken = Vec::new();

        self.fanout
            .broadcast(
                endpoints,
                |endpoint| {
                    let expected = counts.expected(endpoint.address());
                    let message = TakeoverMessage::new(&self.owner, expected);
                    async move { endpoint.takeover(message).await }
                },
                |node, result| match result {
                    Ok(AcceptRejectResponse::Accept) => {
                        receiver.takeover(node);
                        tally.takeover_accepted += 1;
                        taken.push(node.clone());
                        report.record(node, NodeOutcome::TakenOver);
                    }
                    Ok(response) => {
                        let reason = response.message().unwrap_or_default().to_string();
                        match response.rejection_reason() {
                            Some(RejectionReason::Dead) => {
                                let (host, user) = last_mutation(response);
                                receiver.takeover_other_client(node, host, user);
                            }
                            _ => receiver.takeover_fail(node, &reason),
                        }
                        tally.takeover_failed += 1;
                        report.record(node, rejected(Phase::Takeover, reason));
                    }
                    Err(e) => {
                        receiver.takeover_fail(node, &e.to_string());
                        tally.takeover_failed += 1;
                        report.record(node, failed(Phase::Takeover, e.to_string()));
                    }
                },
            )
            .await;

        for node in &taken {
            counts.advance(node);
        }
        receiver.end_takeover();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::testing::TestCluster;
    use crate::results::testing::RecordingReceiver;
    use consensus::{DiscoverResponse, NomadChange, NomadServer, PrepareMessage, ServerMode};
    use uuid::Uuid;

    fn config() -> ClientConfig {
        ClientConfig {
            host: "host9".to_string(),
            user: "recovery".to_string(),
            concurrency: 4,
            timeout_ms: 5_000,
        }
    }

    fn crashed_client() -> MutationOwner {
        MutationOwner::new("host1", "admin")
    }

    async fn prepare_on(servers: &[Arc<NomadServer>], uuid: Uuid) {
        for server in servers {
            let message = PrepareMessage::new(
                &crashed_client(),
                0,
                uuid,
                1,
                NomadChange::new("set name", serde_json::json!({ "name": "c1" })),
            );
            assert!(server.prepare(message).await.unwrap().is_accepted());
        }
    }

    async fn state_of(server: &NomadServer, uuid: Uuid) -> ChangeRequestState {
        server.get_config(&uuid).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn finishes_a_partial_commit_despite_offline_node() {
        let cluster = TestCluster::new(3);
        let uuid = Uuid::new_v4();
        prepare_on(&cluster.servers, uuid).await;
        cluster.servers[0]
            .commit(CommitMessage::new(&crashed_client(), 1, uuid))
            .await
            .unwrap();

        let process = RecoveryProcess::new(cluster.with_offline(2), &config());
        let mut receiver = RecordingReceiver::default();
        let report = process.recover(3, None, &mut receiver).await;

        assert!(receiver.has("takeover"));
        assert!(receiver.has("committed"));
        assert_eq!(report.change_uuid, Some(uuid));
        assert_eq!(report.count(&NodeOutcome::Committed), 1);
        assert_eq!(state_of(&cluster.servers[1], uuid).await, ChangeRequestState::Committed);
        // The unreachable node still holds the prepared change.
        assert_eq!(state_of(&cluster.servers[2], uuid).await, ChangeRequestState::Prepared);
        assert_eq!(report.consistency, Consistency::MayNeedRecovery);

        for server in &cluster.servers[..2] {
            assert_eq!(server.discover().await.unwrap().mode, ServerMode::Normal);
        }
    }

    #[tokio::test]
    async fn forced_rollback_of_prepared_nodes() {
        let cluster = TestCluster::new(3);
        let uuid = Uuid::new_v4();
        prepare_on(&cluster.servers[..2], uuid).await;

        let process = RecoveryProcess::new(cluster.with_offline(2), &config());
        let mut receiver = RecordingReceiver::default();
        let undecided = process.recover(3, None, &mut receiver).await;

        assert!(receiver.has("cannot_decide"));
        assert_eq!(undecided.consistency, Consistency::MayNeedRecovery);
        assert_eq!(state_of(&cluster.servers[0], uuid).await, ChangeRequestState::Prepared);

        let mut receiver = RecordingReceiver::default();
        let report = process
            .recover(3, Some(ChangeRequestState::RolledBack), &mut receiver)
            .await;

        assert_eq!(report.count(&NodeOutcome::RolledBack), 2);
        for server in &cluster.servers[..2] {
            assert_eq!(state_of(server, uuid).await, ChangeRequestState::RolledBack);
            assert_eq!(server.discover().await.unwrap().mode, ServerMode::Normal);
        }
    }

    #[tokio::test]
    async fn commits_when_every_node_is_prepared() {
        let cluster = TestCluster::new(2);
        let uuid = Uuid::new_v4();
        prepare_on(&cluster.servers, uuid).await;

        let process = RecoveryProcess::new(cluster.endpoints.clone(), &config());
        let mut receiver = RecordingReceiver::default();
        let report = process.recover(2, None, &mut receiver).await;

        assert_eq!(report.consistency, Consistency::Consistent);
        for server in &cluster.servers {
            assert_eq!(state_of(server, uuid).await, ChangeRequestState::Committed);
        }
    }

    #[tokio::test]
    async fn partial_rollback_is_finished() {
        let cluster = TestCluster::new(2);
        let uuid = Uuid::new_v4();
        prepare_on(&cluster.servers, uuid).await;
        cluster.servers[1]
            .rollback(RollbackMessage::new(&crashed_client(), 1, uuid))
            .await
            .unwrap();

        let process = RecoveryProcess::new(cluster.endpoints.clone(), &config());
        let mut receiver = RecordingReceiver::default();
        let report = process.recover(2, None, &mut receiver).await;

        assert_eq!(report.consistency, Consistency::Consistent);
        assert_eq!(report.count(&NodeOutcome::RolledBack), 1);
        assert_eq!(state_of(&cluster.servers[0], uuid).await, ChangeRequestState::RolledBack);
    }

    #[tokio::test]
    async fn settled_cluster_is_left_alone() {
        let cluster = TestCluster::new(2);
        let uuid = Uuid::new_v4();
        prepare_on(&cluster.servers, uuid).await;
        for server in &cluster.servers {
            server
                .commit(CommitMessage::new(&crashed_client(), 1, uuid))
                .await
                .unwrap();
        }
        let before = cluster.servers[0].discover().await.unwrap().mutative_message_count;

        let process = RecoveryProcess::new(cluster.endpoints.clone(), &config());
        let mut receiver = RecordingReceiver::default();
        let report = process.recover(2, None, &mut receiver).await;

        assert_eq!(report.consistency, Consistency::Consistent);
        assert!(!receiver.has("takeover"));
        assert_eq!(cluster.servers[0].discover().await.unwrap().mutative_message_count, before);
    }

    #[tokio::test]
    async fn unreachable_cluster_is_unknown() {
        let cluster = TestCluster::new(1);
        let process = RecoveryProcess::new(cluster.with_offline(0), &config());
        let mut receiver = RecordingReceiver::default();

        let report = process.recover(1, None, &mut receiver).await;

        assert!(receiver.has("discover_fail"));
        assert_eq!(report.consistency, Consistency::UnknownButNoChange);
    }

    #[tokio::test]
    async fn inconsistent_cluster_is_not_touched() {
        let cluster = TestCluster::new(2);
        let uuid = Uuid::new_v4();
        prepare_on(&cluster.servers, uuid).await;
        let commit = CommitMessage::new(&crashed_client(), 1, uuid);
        cluster.servers[0].commit(commit).await.unwrap();
        let rollback = RollbackMessage::new(&crashed_client(), 1, uuid);
        cluster.servers[1].rollback(rollback).await.unwrap();

        let process = RecoveryProcess::new(cluster.endpoints.clone(), &config());
        let mut receiver = RecordingReceiver::default();
        let report = process
            .recover(2, Some(ChangeRequestState::Committed), &mut receiver)
            .await;

        assert_eq!(report.consistency, Consistency::UnrecoverablyInconsistent);
        assert!(!receiver.has("takeover"));
    }

    #[tokio::test]
    async fn takeover_lost_to_another_client_stops_recovery() {
        let cluster = TestCluster::new(2);
        let uuid = Uuid::new_v4();
        prepare_on(&cluster.servers, uuid).await;
        let mut endpoints = cluster.endpoints.clone();
        endpoints[1] = Arc::new(ContestedEndpoint {
            inner: cluster.endpoints[1].clone(),
            server: cluster.servers[1].clone(),
        });

        let process = RecoveryProcess::new(endpoints, &config());
        let mut receiver = RecordingReceiver::default();
        let report = process.recover(2, None, &mut receiver).await;

        assert!(receiver.has("takeover_other_client"));
        assert!(!receiver.has("committed"));
        assert_eq!(report.consistency, Consistency::MayNeedRecovery);
        for server in &cluster.servers {
            assert_eq!(state_of(server, uuid).await, ChangeRequestState::Prepared);
        }
        let discovered = cluster.servers[1].discover().await.unwrap();
        assert_eq!(discovered.last_mutation_host.as_deref(), Some("host2"));
    }

    /// Another recovering client takes the node over first.
    struct ContestedEndpoint {
        inner: Arc<dyn NomadEndpoint>,
        server: Arc<NomadServer>,
    }

    #[async_trait::async_trait]
    impl NomadEndpoint for ContestedEndpoint {
        fn address(&self) -> &NodeAddress {
            self.inner.address()
        }

        async fn discover(&self) -> crate::Result<DiscoverResponse> {
            self.inner.discover().await
        }

        async fn prepare(&self, message: PrepareMessage) -> crate::Result<AcceptRejectResponse> {
            self.inner.prepare(message).await
        }

        async fn commit(&self, message: CommitMessage) -> crate::Result<AcceptRejectResponse> {
            self.inner.commit(message).await
        }

        async fn rollback(&self, message: RollbackMessage) -> crate::Result<AcceptRejectResponse> {
            self.inner.rollback(message).await
        }

        async fn takeover(&self, message: TakeoverMessage) -> crate::Result<AcceptRejectResponse> {
            let rival = MutationOwner::new("host2", "rival");
            let count = self.server.discover().await?.mutative_message_count;
            self.server.takeover(TakeoverMessage::new(&rival, count)).await?;
            self.inner.takeover(message).await
        }
    }
}
