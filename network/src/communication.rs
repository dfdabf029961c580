use async_trait::async_trait;
use consensus::{
    AcceptRejectResponse, CommitMessage, DiscoverResponse, NomadEntity, NomadMessage, NomadResponse,
    NomadServer, PrepareMessage, RollbackMessage, TakeoverMessage,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::{ClientConfig, NetworkError, NodeAddress, Result};

/// Client-side handle on one node.
#[async_trait]
pub trait NomadEndpoint: Send + Sync {
    fn address(&self) -> &NodeAddress;

    async fn discover(&self) -> Result<DiscoverResponse>;

    async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse>;

    async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse>;

    async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse>;

    async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse>;
}

/// Calls straight into a server living in the same process.
pub struct LocalEndpoint {
    address: NodeAddress,
    server: Arc<NomadServer>,
}

impl LocalEndpoint {
    pub fn new(address: NodeAddress, server: Arc<NomadServer>) -> Self {
        Self { address, server }
    }
}

#[async_trait]
impl NomadEndpoint for LocalEndpoint {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn discover(&self) -> Result<DiscoverResponse> {
        Ok(self.server.discover().await?)
    }

    async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        Ok(self.server.prepare(message).await?)
    }

    async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse> {
        Ok(self.server.commit(message).await?)
    }

    async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        Ok(self.server.rollback(message).await?)
    }

    async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        Ok(self.server.takeover(message).await?)
    }
}

/// Sends every message as JSON through a [`NomadEntity`], the way a real
/// transport would. The entity does not accept takeovers.
pub struct MessageEndpoint {
    address: NodeAddress,
    entity: NomadEntity,
}

impl MessageEndpoint {
    pub fn new(address: NodeAddress, entity: NomadEntity) -> Self {
        Self { address, entity }
    }

    async fn send(&self, message: NomadMessage) -> Result<NomadResponse> {
        let kind = message.kind();
        let request = serde_json::to_string(&message)?;
        tracing::trace!("Sending {} to {}", kind, self.address);
        let reply = self.entity.handle_json(&request).await?;
        Ok(serde_json::from_str(&reply)?)
    }

    async fn send_mutation(&self, message: NomadMessage) -> Result<AcceptRejectResponse> {
        match self.send(message).await? {
            NomadResponse::AcceptReject(response) => Ok(response),
            other => Err(NetworkError::Protocol(format!(
                "{} answered a mutative message with {:?}",
                self.address, other
            ))),
        }
    }
}

#[async_trait]
impl NomadEndpoint for MessageEndpoint {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn discover(&self) -> Result<DiscoverResponse> {
        match self.send(NomadMessage::Discover).await? {
            NomadResponse::Discover(response) => Ok(response),
            other => Err(NetworkError::Protocol(format!(
                "{} answered discover with {:?}",
                self.address, other
            ))),
        }
    }

    async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.send_mutation(NomadMessage::Prepare(message)).await
    }

    async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse> {
        self.send_mutation(NomadMessage::Commit(message)).await
    }

    async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.send_mutation(NomadMessage::Rollback(message)).await
    }

    async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.send_mutation(NomadMessage::Takeover(message)).await
    }
}

/// Runs one call per endpoint in parallel, bounded by a semaphore, each
/// call under its own timeout.
#[derive(Debug, Clone)]
pub struct Fanout {
    concurrency: usize,
    timeout: Duration,
}

impl Fanout {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.concurrency, config.timeout())
    }

    /// `on_result` sees each result as it arrives; the returned list keeps
    /// arrival order.
    pub async fn broadcast<T, F, Fut, R>(
        &self,
        endpoints: &[Arc<dyn NomadEndpoint>],
        call: F,
        mut on_result: R,
    ) -> Vec<(NodeAddress, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn NomadEndpoint>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        R: FnMut(&NodeAddress, &Result<T>),
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<NodeAddress> = BTreeSet::new();

        for endpoint in endpoints {
            let address = endpoint.address().clone();
            pending.insert(address.clone());

            let semaphore = Arc::clone(&semaphore);
            let limit = self.timeout;
            let call = call(Arc::clone(endpoint));

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (address, Err(NetworkError::TaskFailed(e.to_string()))),
                };
                let result = match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(NetworkError::Timeout(format!(
                        "{} did not answer within {:?}",
                        address, limit
                    ))),
                };
                (address, result)
            });
        }

        let mut results = Vec::with_capacity(endpoints.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((address, result)) => {
                    pending.remove(&address);
                    on_result(&address, &result);
                    results.push((address, result));
                }
                Err(e) => tracing::error!("Fan-out task failed: {}", e),
            }
        }

        for address in pending {
            let reason = format!("call to {} did not complete", address);
            let result = Err(NetworkError::TaskFailed(reason));
            on_result(&address, &result);
            results.push((address, result));
        }

        results
    }
}
