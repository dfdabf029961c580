//! In-process clusters for multi-node tests: one temporary directory and one
//! `NomadServer` per node, reachable through local or JSON endpoints.

use async_trait::async_trait;
use consensus::{
    AcceptRejectResponse, ChangeApplicator, CommitMessage, DiscoverResponse, NomadEntity,
    NomadServer, PrepareMessage, RollbackMessage, SettingsApplicator, TakeoverMessage,
};
use network::{
    ClientConfig, LocalEndpoint, MessageEndpoint, NetworkError, NodeAddress, NomadClient,
    NomadEndpoint,
};
use std::path::Path;
use std::sync::Arc;
use storage::LockManager;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Local,
    /// Every message goes through JSON and a `NomadEntity`.
    Json,
}

pub struct Cluster {
    locks: LockManager,
    dirs: Vec<TempDir>,
    servers: Vec<Option<Arc<NomadServer>>>,
    transport: Transport,
}

impl Cluster {
    pub fn start(size: usize, transport: Transport) -> Self {
        init_logging();
        let locks = LockManager::new();
        let mut cluster = Cluster {
            locks,
            dirs: Vec::new(),
            servers: Vec::new(),
            transport,
        };
        for i in 0..size {
            cluster.dirs.push(tempfile::tempdir().unwrap());
            cluster.servers.push(None);
            cluster.restart(i);
        }
        cluster
    }

    pub fn size(&self) -> usize {
        self.servers.len()
    }

    pub fn address(&self, index: usize) -> NodeAddress {
        NodeAddress::new(format!("node-{}", index), "localhost", 9410 + index as u16)
    }

    pub fn dir(&self, index: usize) -> &Path {
        self.dirs[index].path()
    }

    /// Panics if the node is stopped.
    pub fn server(&self, index: usize) -> Arc<NomadServer> {
        match &self.servers[index] {
            Some(server) => Arc::clone(server),
            None => panic!("node-{} is stopped", index),
        }
    }

    /// Drops the server. Its directory lock goes away once every endpoint
    /// and client holding it is dropped too.
    pub fn stop(&mut self, index: usize) {
        self.servers[index] = None;
    }

    pub fn restart(&mut self, index: usize) {
        self.servers[index] = None;
        let applicator: Arc<dyn ChangeApplicator> = Arc::new(SettingsApplicator::new());
        let name = format!("node-{}", index);
        let server =
            NomadServer::open(name, self.dirs[index].path(), &self.locks, applicator).unwrap();
        self.servers[index] = Some(Arc::new(server));
    }

    /// Stopped nodes are represented by endpoints that always fail.
    pub fn endpoints(&self) -> Vec<Arc<dyn NomadEndpoint>> {
        (0..self.size())
            .map(|i| -> Arc<dyn NomadEndpoint> {
                let address = self.address(i);
                match (&self.servers[i], self.transport) {
                    (None, _) => Arc::new(UnreachableEndpoint { address }),
                    (Some(server), Transport::Local) => {
                        Arc::new(LocalEndpoint::new(address, Arc::clone(server)))
                    }
                    (Some(server), Transport::Json) => {
                        let entity = NomadEntity::new(Arc::clone(server));
                        Arc::new(MessageEndpoint::new(address, entity))
                    }
                }
            })
            .collect()
    }

    pub fn client(&self, user: &str) -> NomadClient {
        NomadClient::new(
            self.endpoints(),
            ClientConfig {
                host: "test-host".to_string(),
                user: user.to_string(),
                concurrency: 4,
                timeout_ms: 5_000,
            },
        )
    }
}

/// A node nobody can reach.
pub struct UnreachableEndpoint {
    address: NodeAddress,
}

impl UnreachableEndpoint {
    fn fail<T>(&self) -> network::Result<T> {
        Err(NetworkError::Timeout(format!("{} is unreachable", self.address)))
    }
}

#[async_trait]
impl NomadEndpoint for UnreachableEndpoint {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn discover(&self) -> network::Result<DiscoverResponse> {
        self.fail()
    }

    async fn prepare(&self, _message: PrepareMessage) -> network::Result<AcceptRejectResponse> {
        self.fail()
    }

    async fn commit(&self, _message: CommitMessage) -> network::Result<AcceptRejectResponse> {
        self.fail()
    }

    async fn rollback(&self, _message: RollbackMessage) -> network::Result<AcceptRejectResponse> {
        self.fail()
    }

    async fn takeover(&self, _message: TakeoverMessage) -> network::Result<AcceptRejectResponse> {
        self.fail()
    }
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
