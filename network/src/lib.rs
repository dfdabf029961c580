mod analyzer;
mod change;
mod communication;
mod decision;
mod discovery;
mod manager;
mod recovery;
mod results;

pub use analyzer::{ClusterAnalysis, ConsistencyAnalyzer, GlobalState};
pub use change::ChangeProcess;
pub use communication::{Fanout, LocalEndpoint, MessageEndpoint, NomadEndpoint};
pub use decision::{DecisionPolicy, Tally};
pub use discovery::{DiscoveryOutcome, DiscoveryProcess, MutativeCounts};
pub use manager::NomadClient;
pub use recovery::RecoveryProcess;
pub use results::{
    Consistency, LoggingReceiver, MultiReceiver, NodeOutcome, Phase, ProcessReport, ResultsReceiver,
};

use consensus::MutationOwner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of one configured node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// Settings of a client process talking to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub user: String,
    /// Maximum number of nodes contacted at the same time.
    pub concurrency: usize,
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            user: "nomad".to_string(),
            concurrency: 8,
            timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn owner(&self) -> MutationOwner {
        MutationOwner::new(&self.host, &self.user)
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Server error: {0}")]
    Server(#[from] consensus::NomadError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}
