use consensus::{ChangeRequestState, NomadChange};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{
    ChangeProcess, ClientConfig, ClusterAnalysis, ConsistencyAnalyzer, DiscoveryOutcome,
    DiscoveryProcess, Fanout, NodeAddress, NomadEndpoint, ProcessReport, RecoveryProcess,
    ResultsReceiver,
};

/// Entry point for tools driving a cluster. Runs one process at a time.
pub struct NomadClient {
    endpoints: Vec<Arc<dyn NomadEndpoint>>,
    config: ClientConfig,
    running: Mutex<()>,
}

impl NomadClient {
    pub fn new(endpoints: Vec<Arc<dyn NomadEndpoint>>, config: ClientConfig) -> Self {
        tracing::debug!(
            "Nomad client {} for {} nodes",
            config.owner(),
            endpoints.len()
        );
        Self {
            endpoints,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn nodes(&self) -> Vec<NodeAddress> {
        self.endpoints.iter().map(|e| e.address().clone()).collect()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn discover(&self, receiver: &mut dyn ResultsReceiver) -> DiscoveryOutcome {
        let _running = self.running.lock().await;
        DiscoveryProcess::new(self.endpoints.clone(), Fanout::from_config(&self.config))
            .discover(receiver)
            .await
    }

    pub async fn apply_change(
        &self,
        change: NomadChange,
        receiver: &mut dyn ResultsReceiver,
    ) -> ProcessReport {
        let _running = self.running.lock().await;
        tracing::info!("Applying change '{}' to {} nodes", change.summary, self.endpoints.len());
        ChangeProcess::new(self.endpoints.clone(), &self.config)
            .apply_change(change, receiver)
            .await
    }

    pub async fn recover(
        &self,
        expected_node_count: usize,
        forced_state: Option<ChangeRequestState>,
        receiver: &mut dyn ResultsReceiver,
    ) -> ProcessReport {
        let _running = self.running.lock().await;
        tracing::info!(
            "Recovering {} of {} expected nodes{}",
            self.endpoints.len(),
            expected_node_count,
            forced_state.map(|s| format!(", forcing {}", s)).unwrap_or_default()
        );
        RecoveryProcess::new(self.endpoints.clone(), &self.config)
            .recover(expected_node_count, forced_state, receiver)
            .await
    }

    pub async fn analyze(&self, receiver: &mut dyn ResultsReceiver) -> ClusterAnalysis {
        let _running = self.running.lock().await;
        ConsistencyAnalyzer::new(self.endpoints.clone(), &self.config)
            .analyze(receiver)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::testing::TestCluster;
    use crate::{Consistency, GlobalState, LoggingReceiver, MultiReceiver};
    use crate::results::testing::RecordingReceiver;
    use serde_json::json;

    #[tokio::test]
    async fn change_then_analyze() {
        let cluster = TestCluster::new(3);
        let client = NomadClient::new(cluster.endpoints.clone(), ClientConfig::default());
        assert_eq!(client.nodes().len(), 3);

        let recording = RecordingReceiver::default();
        let mut receiver = MultiReceiver::new().with(LoggingReceiver).with(recording.clone());
        let change = NomadChange::new("set offheap", json!({ "offheap": "1GB" }));
        let report = client.apply_change(change, &mut receiver).await;
        assert_eq!(report.consistency, Consistency::Consistent);
        assert!(recording.has("done:Consistent"));

        let analysis = client.analyze(&mut LoggingReceiver).await;
        assert_eq!(analysis.state, GlobalState::Accepting);
        assert_eq!(analysis.checkpoint.map(|c| c.uuid), report.change_uuid);
    }

    #[tokio::test]
    async fn recover_on_healthy_cluster_is_a_no_op() {
        let cluster = TestCluster::new(2);
        let client = NomadClient::new(cluster.endpoints.clone(), ClientConfig::default());

        let report = client.recover(2, None, &mut LoggingReceiver).await;

        assert_eq!(report.consistency, Consistency::Consistent);
        assert!(report.change_uuid.is_none());
    }
}
