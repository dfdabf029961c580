use consensus::{
    AcceptRejectResponse, CommitMessage, Inconsistency, MutationOwner, NomadChange, PrepareMessage,
    RejectionReason, RollbackMessage,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    ClientConfig, Consistency, DecisionPolicy, DiscoveryOutcome, DiscoveryProcess, Fanout,
    MutativeCounts, NodeAddress, NodeOutcome, NomadEndpoint, Phase, ProcessReport, ResultsReceiver,
    Tally,
};

/// Two-phase change across every configured node.
pub struct ChangeProcess {
    discovery: DiscoveryProcess,
    fanout: Fanout,
    owner: MutationOwner,
}

impl ChangeProcess {
    pub fn new(endpoints: Vec<Arc<dyn NomadEndpoint>>, config: &ClientConfig) -> Self {
        let fanout = Fanout::from_config(config);
        Self {
            discovery: DiscoveryProcess::new(endpoints, fanout.clone()),
            fanout,
            owner: config.owner(),
        }
    }

    pub async fn apply_change(
        &self,
        change: NomadChange,
        receiver: &mut dyn ResultsReceiver,
    ) -> ProcessReport {
        let policy = DecisionPolicy::Change;
        let mut report = ProcessReport::new();

        let mut outcome = self.discovery.discover(receiver).await;
        record_discovery(&mut report, &outcome);
        let mut tally = outcome.tally();

        if !policy.is_discover_successful(&tally) || !policy.is_whole_cluster_accepting(&tally) {
            tracing::warn!("Change not attempted: cluster is not ready");
            return finish(report, policy.consistency(&tally), receiver);
        }

        self.discovery.rediscover(&mut outcome, receiver).await;
        record_discovery(&mut report, &outcome);
        tally = outcome.tally();

        if !policy.is_discover_successful(&tally) {
            tracing::warn!("Change not attempted: cluster changed during discovery");
            return finish(report, policy.consistency(&tally), receiver);
        }

        let change_uuid = Uuid::new_v4();
        let version = outcome.max_highest_version() + 1;
        report.change_uuid = Some(change_uuid);
        let mut counts = outcome.mutative_counts();

        let endpoints = self.discovery.endpoints();
        let prepared = self
            .prepare_all(
                endpoints,
                PrepareMessage::new(&self.owner, 0, change_uuid, version, change),
                &mut counts,
                receiver,
                &mut tally,
                &mut report,
            )
            .await;

        if policy.should_do_commit(&tally) {
            commit_all(
                &self.fanout,
                endpoints,
                CommitMessage::new(&self.owner, 0, change_uuid),
                &mut counts,
                receiver,
                &mut tally,
                &mut report,
            )
            .await;
        } else if policy.should_do_rollback(&tally) {
            tracing::warn!(
                "Rolling back change {}: prepare did not succeed everywhere",
                change_uuid
            );
            rollback_all(
                &self.fanout,
                endpoints,
                RollbackMessage::new(&self.owner, 0, change_uuid),
                &prepared,
                &mut counts,
                receiver,
                &mut tally,
                &mut report,
            )
            .await;
        }

        finish(report, policy.consistency(&tally), receiver)
    }

    /// `template` is sent to every node with that node's expected count.
    async fn prepare_all(
        &self,
        endpoints: &[Arc<dyn NomadEndpoint>],
        template: PrepareMessage,
        counts: &mut MutativeCounts,
        receiver: &mut dyn ResultsReceiver,
        tally: &mut Tally,
        report: &mut ProcessReport,
    ) -> BTreeSet<NodeAddress> {
        receiver.start_prepare(template.change_uuid);
        tally.mutation_sent = true;
        let mut prepared = BTreeSet::new();

        self.fanout
            .broadcast(
                endpoints,
                |endpoint| {
                    let message = PrepareMessage {
                        expected_mutative_message_count: counts.expected(endpoint.address()),
                        ..template.clone()
                    };
                    async move { endpoint.prepare(message).await }
                },
                |node, result| match result {
                    Ok(AcceptRejectResponse::Accept) => {
                        receiver.prepared(node);
                        tally.prepare_accepted += 1;
                        prepared.insert(node.clone());
                        report.record(node, NodeOutcome::Prepared);
                    }
                    Ok(response) => {
                        let reason = response.message().unwrap_or_default().to_string();
                        match response.rejection_reason() {
                            Some(RejectionReason::Unacceptable) => {
                                receiver.prepare_change_unacceptable(node, &reason)
                            }
                            Some(RejectionReason::Dead) => {
                                let (host, user) = last_mutation(response);
                                receiver.prepare_other_client(node, host, user);
                            }
                            _ => receiver.prepare_fail(node, &reason),
                        }
                        tally.prepare_rejected += 1;
                        report.record(node, rejected(Phase::Prepare, reason));
                    }
                    Err(e) => {
                        receiver.prepare_fail(node, &e.to_string());
                        tally.prepare_failed += 1;
                        report.record(node, failed(Phase::Prepare, e.to_string()));
                    }
                },
            )
            .await;

        for node in &prepared {
            counts.advance(node);
        }
        receiver.end_prepare();
        prepared
    }
}

/// Sends `template` to `endpoints`, each with its expected count, and
/// records every answer.
pub(crate) async fn commit_all(
    fanout: &Fanout,
    endpoints: &[Arc<dyn NomadEndpoint>],
    template: CommitMessage,
    counts: &mut MutativeCounts,
    receiver: &mut dyn ResultsReceiver,
    tally: &mut Tally,
    report: &mut ProcessReport,
) {
    receiver.start_commit();
    tally.mutation_sent = true;
    let change_uuid = template.change_uuid;
    let mut committed = Vec::new();

    fanout
        .broadcast(
            endpoints,
            |endpoint| {
                let message = CommitMessage {
                    expected_mutative_message_count: counts.expected(endpoint.address()),
                    ..template.clone()
                };
                async move { endpoint.commit(message).await }
            },
            |node, result| match result {
                Ok(AcceptRejectResponse::Accept) => {
                    receiver.committed(node);
                    tally.second_phase_accepted += 1;
                    committed.push(node.clone());
                    report.record(node, NodeOutcome::Committed);
                }
                Ok(AcceptRejectResponse::Fatal(inconsistency)) => {
                    tracing::error!("Commit of {} on {} hit an inconsistency", change_uuid, node);
                    receiver.commit_inconsistent(node, inconsistency);
                    tally.second_phase_failed += 1;
                    tally.inconsistent = true;
                    report.record(node, inconsistent(Phase::Commit, inconsistency));
                }
                Ok(response) => {
                    let reason = response.message().unwrap_or_default().to_string();
                    match response.rejection_reason() {
                        Some(RejectionReason::Dead) => {
                            let (host, user) = last_mutation(response);
                            receiver.commit_other_client(node, host, user);
                        }
                        _ => receiver.commit_fail(node, &reason),
                    }
                    tally.second_phase_failed += 1;
                    report.record(node, rejected(Phase::Commit, reason));
                }
                Err(e) => {
                    receiver.commit_fail(node, &e.to_string());
                    tally.second_phase_failed += 1;
                    report.record(node, failed(Phase::Commit, e.to_string()));
                }
            },
        )
        .await;

    for node in &committed {
        counts.advance(node);
    }
    receiver.end_commit();
}

/// Sends `template` to `endpoints`. A `Bad` answer from a node outside
/// `holders` means the node never recorded the change.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn rollback_all(
    fanout: &Fanout,
    endpoints: &[Arc<dyn NomadEndpoint>],
    template: RollbackMessage,
    holders: &BTreeSet<NodeAddress>,
    counts: &mut MutativeCounts,
    receiver: &mut dyn ResultsReceiver,
    tally: &mut Tally,
    report: &mut ProcessReport,
) {
    receiver.start_rollback();
    tally.mutation_sent = true;
    let change_uuid = template.change_uuid;
    let mut rolled_back = Vec::new();

    fanout
        .broadcast(
            endpoints,
            |endpoint| {
                let message = RollbackMessage {
                    expected_mutative_message_count: counts.expected(endpoint.address()),
                    ..template.clone()
                };
                async move { endpoint.rollback(message).await }
            },
            |node, result| match result {
                Ok(AcceptRejectResponse::Accept) => {
                    receiver.rolled_back(node);
                    tally.second_phase_accepted += 1;
                    rolled_back.push(node.clone());
                    report.record(node, NodeOutcome::RolledBack);
                }
                Ok(AcceptRejectResponse::Reject(rejection))
                    if rejection.reason == RejectionReason::Bad && !holders.contains(node) =>
                {
                    tracing::debug!("{} never recorded change {}", node, change_uuid);
                    tally.second_phase_accepted += 1;
                    report.record(node, NodeOutcome::NothingToRollBack);
                }
                Ok(AcceptRejectResponse::Fatal(inconsistency)) => {
                    tracing::error!("Rollback of {} on {} hit an inconsistency", change_uuid, node);
                    receiver.rollback_inconsistent(node, inconsistency);
                    tally.second_phase_failed += 1;
                    tally.inconsistent = true;
                    report.record(node, inconsistent(Phase::Rollback, inconsistency));
                }
                Ok(response) => {
                    let reason = response.message().unwrap_or_default().to_string();
                    match response.rejection_reason() {
                        Some(RejectionReason::Dead) => {
                            let (host, user) = last_mutation(response);
                            receiver.rollback_other_client(node, host, user);
                        }
                        _ => receiver.rollback_fail(node, &reason),
                    }
                    tally.second_phase_failed += 1;
                    report.record(node, rejected(Phase::Rollback, reason));
                }
                Err(e) => {
                    receiver.rollback_fail(node, &e.to_string());
                    tally.second_phase_failed += 1;
                    report.record(node, failed(Phase::Rollback, e.to_string()));
                }
            },
        )
        .await;

    for node in &rolled_back {
        counts.advance(node);
    }
    receiver.end_rollback();
}

pub(crate) fn record_discovery(report: &mut ProcessReport, outcome: &DiscoveryOutcome) {
    report.discovered = outcome.responses.clone();
    for node in outcome.responses.keys() {
        report.record(node, NodeOutcome::Discovered);
    }
    for (node, reason) in &outcome.failures {
        report.record(node, failed(Phase::Discover, reason.clone()));
    }
}

pub(crate) fn finish(
    mut report: ProcessReport,
    consistency: Consistency,
    receiver: &mut dyn ResultsReceiver,
) -> ProcessReport {
    report.consistency = consistency;
    receiver.done(consistency);
    report
}

/// Host and user a rejection blames, empty when unknown.
pub(crate) fn last_mutation(response: &AcceptRejectResponse) -> (&str, &str) {
    match response {
        AcceptRejectResponse::Reject(rejection) => (
            rejection.last_mutation_host.as_deref().unwrap_or_default(),
            rejection.last_mutation_user.as_deref().unwrap_or_default(),
        ),
        _ => ("", ""),
    }
}

pub(crate) fn rejected(phase: Phase, reason: String) -> NodeOutcome {
    NodeOutcome::Rejected { phase, reason }
}

pub(crate) fn failed(phase: Phase, reason: String) -> NodeOutcome {
    NodeOutcome::Failed { phase, reason }
}

fn inconsistent(phase: Phase, inconsistency: &Inconsistency) -> NodeOutcome {
    NodeOutcome::Inconsistent {
        phase,
        state: inconsistency.state,
        reason: inconsistency.message.clone(),
    }
}
