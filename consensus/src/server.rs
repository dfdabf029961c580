use std::path::Path;
use std::sync::Arc;
use storage::{LockManager, VerifyReport};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::messages::*;
use crate::store::{ChangeStore, StateChange};
use crate::{
    ChangeApplicator, ChangeRequest, ChangeRequestState, MutationOwner, PotentialApplicationResult,
    Result, ServerMode, MAX_VERSION,
};

/// Per-node state machine answering the protocol messages against the
/// node's change store. Reads share the lock, every mutation is exclusive.
pub struct NomadServer {
    node_name: String,
    store: RwLock<ChangeStore>,
    applicator: Arc<dyn ChangeApplicator>,
}

impl NomadServer {
    pub fn new(
        node_name: impl Into<String>,
        store: ChangeStore,
        applicator: Arc<dyn ChangeApplicator>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store: RwLock::new(store),
            applicator,
        }
    }

    pub fn open(
        node_name: impl Into<String>,
        directory: impl AsRef<Path>,
        locks: &LockManager,
        applicator: Arc<dyn ChangeApplicator>,
    ) -> Result<Self> {
        let node_name = node_name.into();
        let store = ChangeStore::open(directory, locks)?;
        tracing::info!(
            "Nomad server {} opened at version {} ({} mutative messages)",
            node_name,
            store.current_version(),
            store.mutative_message_count()
        );
        Ok(Self::new(node_name, store, applicator))
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub async fn discover(&self) -> Result<DiscoverResponse> {
        let store = self.store.read().await;
        Ok(DiscoverResponse {
            mode: store.mode()?,
            mutative_message_count: store.mutative_message_count(),
            last_mutation_host: store.last_mutation_host(),
            last_mutation_user: store.last_mutation_user(),
            last_mutation_timestamp: store.last_mutation_timestamp()?,
            current_version: store.current_version(),
            highest_version: store.highest_version(),
            latest_change: store.get_latest_change()?.map(|c| c.details()),
            latest_committed_change: store.get_current_committed_config()?.map(|c| c.details()),
        })
    }

    pub async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        let mut store = self.store.write().await;
        let uuid = message.change_uuid;

        if let Some(existing) = store.get_config(&uuid)? {
            return Ok(match existing.state {
                ChangeRequestState::Prepared => AcceptRejectResponse::Accept,
                state => {
                    let message = format!("change {} is already {}", uuid, state);
                    self.reject(&store, RejectionReason::Dead, message)
                }
            });
        }

        if let Some(stale) = self.stale(&store, message.expected_mutative_message_count) {
            return Ok(stale);
        }

        if store.mode()? == ServerMode::Takeover {
            return Ok(self.reject(
                &store,
                RejectionReason::Unacceptable,
                "a takeover is in progress".to_string(),
            ));
        }

        let latest = store.get_latest_change()?;
        if let Some(latest) = latest.as_ref().filter(|c| c.state == ChangeRequestState::Prepared) {
            return Ok(self.reject(
                &store,
                RejectionReason::Unacceptable,
                format!("change {} is still prepared", latest.uuid),
            ));
        }

        if message.version > MAX_VERSION {
            return Ok(self.reject(
                &store,
                RejectionReason::Bad,
                format!(
                    "version {} is above the largest storable version {}",
                    message.version, MAX_VERSION
                ),
            ));
        }

        let highest = store.highest_version();
        if message.version <= highest {
            return Ok(self.reject(
                &store,
                RejectionReason::Bad,
                format!("version {} is not above highest version {}", message.version, highest),
            ));
        }

        let current = store.get_current_committed_config()?.map(|c| c.result);
        let result = match self.applicator.try_apply(current.as_ref(), &message.change) {
            PotentialApplicationResult::Allowed(result) => result,
            PotentialApplicationResult::Rejected(reason) => {
                tracing::warn!("Node {} refused change {}: {}", self.node_name, uuid, reason);
                return Ok(self.reject(&store, RejectionReason::Unacceptable, reason));
            }
        };

        let request = ChangeRequest::prepared(&message, latest.map(|c| c.uuid), result);
        store.apply(
            StateChange::new()
                .set_highest_version(message.version)
                .set_latest_change_uuid(uuid)
                .set_last_mutation(
                    &message.mutation_host,
                    &message.mutation_user,
                    message.mutation_timestamp,
                )
                .put_change(request),
        )?;

        tracing::info!(
            "Node {} prepared change {} at version {}",
            self.node_name,
            uuid,
            message.version
        );
        Ok(AcceptRejectResponse::Accept)
    }

    pub async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse> {
        let mut store = self.store.write().await;
        let owner = MutationOwner::new(&message.mutation_host, &message.mutation_user);

        let mut request = match self.settle(
            &store,
            &message.change_uuid,
            ChangeRequestState::Committed,
            &owner,
            message.expected_mutative_message_count,
        )? {
            Ok(request) => request,
            Err(response) => return Ok(response),
        };

        let change = request.change.clone();
        request.state = ChangeRequestState::Committed;
        request.last_mutation_host = message.mutation_host.clone();
        request.last_mutation_user = message.mutation_user.clone();
        request.last_mutation_timestamp = message.mutation_timestamp;
        let version = request.version;

        store.apply(
            StateChange::new()
                .set_mode(ServerMode::Normal)
                .clear_takeover_owner()
                .set_current_version(version)
                .set_last_mutation(
                    &message.mutation_host,
                    &message.mutation_user,
                    message.mutation_timestamp,
                )
                .put_change(request),
        )?;

        if let Err(e) = self.applicator.apply(&change) {
            tracing::error!(
                "Node {} committed change {} but could not apply it: {}",
                self.node_name,
                message.change_uuid,
                e
            );
            return Err(e);
        }

        tracing::info!(
            "Node {} committed change {} (version {})",
            self.node_name,
            message.change_uuid,
            version
        );
        Ok(AcceptRejectResponse::Accept)
    }

    pub async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        let mut store = self.store.write().await;
        let owner = MutationOwner::new(&message.mutation_host, &message.mutation_user);

        let mut request = match self.settle(
            &store,
            &message.change_uuid,
            ChangeRequestState::RolledBack,
            &owner,
            message.expected_mutative_message_count,
        )? {
            Ok(request) => request,
            Err(response) => return Ok(response),
        };

        request.state = ChangeRequestState::RolledBack;
        request.last_mutation_host = message.mutation_host.clone();
        request.last_mutation_user = message.mutation_user.clone();
        request.last_mutation_timestamp = message.mutation_timestamp;

        store.apply(
            StateChange::new()
                .set_mode(ServerMode::Normal)
                .clear_takeover_owner()
                .set_last_mutation(
                    &message.mutation_host,
                    &message.mutation_user,
                    message.mutation_timestamp,
                )
                .put_change(request),
        )?;

        tracing::info!("Node {} rolled back change {}", self.node_name, message.change_uuid);
        Ok(AcceptRejectResponse::Accept)
    }

    /// Claims the prepared change for a recovering client. A settled node has
    /// nothing to protect; it only records the mutation and stays `Normal`.
    pub async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        let mut store = self.store.write().await;
        let owner = MutationOwner::new(&message.mutation_host, &message.mutation_user);

        if let Some(stale) = self.stale(&store, message.expected_mutative_message_count) {
            return Ok(stale);
        }

        let mut state_change = StateChange::new().set_last_mutation(
            &message.mutation_host,
            &message.mutation_user,
            message.mutation_timestamp,
        );
        let pending = store
            .get_latest_change()?
            .map_or(false, |c| c.state == ChangeRequestState::Prepared);
        if pending {
            state_change = state_change.set_mode(ServerMode::Takeover).set_takeover_owner(&owner);
        }
        store.apply(state_change)?;

        if pending {
            tracing::info!("Node {} taken over by {}", self.node_name, owner);
        } else {
            tracing::debug!(
                "Node {} has nothing pending; takeover by {} recorded",
                self.node_name,
                owner
            );
        }
        Ok(AcceptRejectResponse::Accept)
    }

    /// Replaces this node's history with one exported from a healthy peer.
    pub async fn force_sync(&self, history: Vec<ChangeRequest>) -> Result<()> {
        let mut store = self.store.write().await;
        let count = history.len();
        store.import_history(history)?;
        tracing::warn!("Node {} force-synced {} changes", self.node_name, count);
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        let mut store = self.store.write().await;
        store.reset()?;
        tracing::warn!("Node {} reset", self.node_name);
        Ok(())
    }

    pub async fn get_config(&self, uuid: &Uuid) -> Result<Option<ChangeRequest>> {
        self.store.read().await.get_config(uuid)
    }

    pub async fn has_incomplete_change(&self) -> Result<bool> {
        self.store.read().await.has_incomplete_change()
    }

    pub async fn get_current_committed_config(&self) -> Result<Option<ChangeRequest>> {
        self.store.read().await.get_current_committed_config()
    }

    pub async fn get_change_history(&self) -> Result<Vec<ChangeRequest>> {
        self.store.read().await.get_change_history()
    }

    pub async fn verify(&self) -> Result<VerifyReport> {
        Ok(self.store.read().await.log().verify()?)
    }

    /// Common checks before moving a change to `target`. `Err` carries the
    /// response to return without mutating anything. A contradiction of a
    /// terminal state is reported even when the sender is stale.
    fn settle(
        &self,
        store: &ChangeStore,
        uuid: &Uuid,
        target: ChangeRequestState,
        owner: &MutationOwner,
        expected_mutative_message_count: u64,
    ) -> Result<std::result::Result<ChangeRequest, AcceptRejectResponse>> {
        let Some(request) = store.get_config(uuid)? else {
            return Ok(Err(self.reject(
                store,
                RejectionReason::Bad,
                format!("no change {} on this node", uuid),
            )));
        };

        if request.state == target {
            return Ok(Err(AcceptRejectResponse::Accept));
        }

        if request.state != ChangeRequestState::Prepared {
            let message = format!(
                "change {} is {} and cannot become {}",
                uuid, request.state, target
            );
            tracing::error!("Node {}: {}", self.node_name, message);
            return Ok(Err(AcceptRejectResponse::Fatal(Inconsistency {
                change_uuid: *uuid,
                state: request.state,
                message,
            })));
        }

        if let Some(stale) = self.stale(store, expected_mutative_message_count) {
            return Ok(Err(stale));
        }

        if store.mode()? == ServerMode::Takeover {
            if let Some(taker) = store.takeover_owner().filter(|taker| taker != owner) {
                return Ok(Err(self.reject(
                    store,
                    RejectionReason::Unacceptable,
                    format!("node is taken over by {}", taker),
                )));
            }
        }

        Ok(Ok(request))
    }

    /// `Dead` when someone else mutated the node since the sender looked.
    fn stale(&self, store: &ChangeStore, expected: u64) -> Option<AcceptRejectResponse> {
        let actual = store.mutative_message_count();
        (expected != actual).then(|| {
            self.reject(
                store,
                RejectionReason::Dead,
                format!("expected mutative message count {} but node is at {}", expected, actual),
            )
        })
    }

    fn reject(
        &self,
        store: &ChangeStore,
        reason: RejectionReason,
        message: String,
    ) -> AcceptRejectResponse {
        tracing::warn!("Node {} rejected message ({:?}): {}", self.node_name, reason, message);
        AcceptRejectResponse::Reject(Rejection {
            reason,
            message,
            last_mutation_host: store.last_mutation_host(),
            last_mutation_user: store.last_mutation_user(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NomadChange, SettingsApplicator};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use storage::APPEND_LOG_FILE;
    use tempfile::{tempdir, TempDir};

    fn owner() -> MutationOwner {
        MutationOwner::new("host1", "admin")
    }

    fn server() -> (TempDir, NomadServer) {
        let dir = tempdir().unwrap();
        let server = NomadServer::open(
            "node-1",
            dir.path(),
            &LockManager::new(),
            Arc::new(SettingsApplicator::new()),
        )
        .unwrap();
        (dir, server)
    }

    fn prepare(expected: u64, uuid: Uuid, version: u64) -> PrepareMessage {
        PrepareMessage::new(
            &owner(),
            expected,
            uuid,
            version,
            NomadChange::new("set name", json!({ "name": version })),
        )
    }

    fn reason(response: &AcceptRejectResponse) -> Option<RejectionReason> {
        response.rejection_reason()
    }

    #[tokio::test]
    async fn prepare_then_commit() {
        let (_dir, server) = server();
        let uuid = Uuid::new_v4();

        assert!(server.prepare(prepare(0, uuid, 1)).await.unwrap().is_accepted());
        let discovered = server.discover().await.unwrap();
        assert!(discovered.is_prepared());
        assert_eq!(discovered.highest_version, 1);
        assert_eq!(discovered.current_version, 0);
        assert!(server.has_incomplete_change().await.unwrap());

        let committed = server.commit(CommitMessage::new(&owner(), 1, uuid)).await.unwrap();
        assert!(committed.is_accepted());
        let discovered = server.discover().await.unwrap();
        assert_eq!(discovered.current_version, 1);
        assert_eq!(discovered.mutative_message_count, 2);
        assert_eq!(discovered.latest_committed_change.unwrap().uuid, uuid);
        assert_eq!(
            server.get_current_committed_config().await.unwrap().unwrap().result,
            json!({ "name": 1 })
        );
    }

    #[tokio::test]
    async fn repeated_messages_are_idempotent() {
        let (_dir, server) = server();
        let uuid = Uuid::new_v4();

        server.prepare(prepare(0, uuid, 1)).await.unwrap();
        assert!(server.prepare(prepare(0, uuid, 1)).await.unwrap().is_accepted());
        server.commit(CommitMessage::new(&owner(), 1, uuid)).await.unwrap();
        assert!(server.commit(CommitMessage::new(&owner(), 1, uuid)).await.unwrap().is_accepted());

        assert_eq!(server.get_change_history().await.unwrap().len(), 1);
        assert_eq!(server.discover().await.unwrap().mutative_message_count, 2);
    }

    #[tokio::test]
    async fn terminal_states_are_fatal_to_contradict() {
        let (_dir, server) = server();
        let committed = Uuid::new_v4();
        let rolled_back = Uuid::new_v4();

        server.prepare(prepare(0, committed, 1)).await.unwrap();
        server.commit(CommitMessage::new(&owner(), 1, committed)).await.unwrap();
        let response = server.rollback(RollbackMessage::new(&owner(), 2, committed)).await.unwrap();
        assert!(response.is_fatal());
        assert_eq!(reason(&response), Some(RejectionReason::Bad));

        server.prepare(prepare(2, rolled_back, 2)).await.unwrap();
        server.rollback(RollbackMessage::new(&owner(), 3, rolled_back)).await.unwrap();
        assert!(server
            .commit(CommitMessage::new(&owner(), 4, rolled_back))
            .await
            .unwrap()
            .is_fatal());
        // A sender that missed the rollback still learns about the contradiction.
        assert!(server
            .commit(CommitMessage::new(&owner(), 3, rolled_back))
            .await
            .unwrap()
            .is_fatal());

        assert_eq!(
            reason(&server.prepare(prepare(4, committed, 3)).await.unwrap()),
            Some(RejectionReason::Dead)
        );
    }

    #[tokio::test]
    async fn prepare_rejections() {
        let (_dir, server) = server();
        let first = Uuid::new_v4();
        server.prepare(prepare(0, first, 1)).await.unwrap();

        let busy = server.prepare(prepare(1, Uuid::new_v4(), 2)).await.unwrap();
        assert_eq!(reason(&busy), Some(RejectionReason::Unacceptable));

        server.commit(CommitMessage::new(&owner(), 1, first)).await.unwrap();
        let old = server.prepare(prepare(2, Uuid::new_v4(), 1)).await.unwrap();
        assert_eq!(reason(&old), Some(RejectionReason::Bad));

        let refused = server
            .prepare(PrepareMessage::new(
                &owner(),
                2,
                Uuid::new_v4(),
                2,
                NomadChange::new("bogus", json!("not a map")),
            ))
            .await
            .unwrap();
        assert_eq!(reason(&refused), Some(RejectionReason::Unacceptable));
        assert_eq!(server.discover().await.unwrap().mutative_message_count, 2);

        let unknown = server.commit(CommitMessage::new(&owner(), 2, Uuid::new_v4())).await.unwrap();
        assert_eq!(reason(&unknown), Some(RejectionReason::Bad));
    }

    #[tokio::test]
    async fn oversized_version_is_bad_and_node_stays_usable() {
        let (_dir, server) = server();

        let response = server.prepare(prepare(0, Uuid::new_v4(), u64::MAX)).await.unwrap();
        assert_eq!(reason(&response), Some(RejectionReason::Bad));
        let response = server.prepare(prepare(0, Uuid::new_v4(), MAX_VERSION + 1)).await.unwrap();
        assert_eq!(reason(&response), Some(RejectionReason::Bad));

        let discovered = server.discover().await.unwrap();
        assert_eq!(discovered.mutative_message_count, 0);
        assert_eq!(discovered.highest_version, 0);

        let uuid = Uuid::new_v4();
        assert!(server.prepare(prepare(0, uuid, MAX_VERSION)).await.unwrap().is_accepted());
        assert!(server.commit(CommitMessage::new(&owner(), 1, uuid)).await.unwrap().is_accepted());
        assert_eq!(server.discover().await.unwrap().current_version, MAX_VERSION);
    }

    #[tokio::test]
    async fn stale_senders_are_dead() {
        let (_dir, server) = server();
        let uuid = Uuid::new_v4();

        let early = server.prepare(prepare(3, uuid, 1)).await.unwrap();
        assert_eq!(reason(&early), Some(RejectionReason::Dead));
        assert!(server.get_config(&uuid).await.unwrap().is_none());

        server.prepare(prepare(0, uuid, 1)).await.unwrap();
        let recoverer = MutationOwner::new("host2", "ops");
        assert!(server.takeover(TakeoverMessage::new(&recoverer, 1)).await.unwrap().is_accepted());

        // The original client still believes the node is at count 1.
        let commit = server.commit(CommitMessage::new(&owner(), 1, uuid)).await.unwrap();
        assert_eq!(reason(&commit), Some(RejectionReason::Dead));
        match &commit {
            AcceptRejectResponse::Reject(rejection) => {
                assert_eq!(rejection.last_mutation_host.as_deref(), Some("host2"));
                assert_eq!(rejection.last_mutation_user.as_deref(), Some("ops"));
            }
            other => panic!("unexpected response {:?}", other),
        }
        let takeover = server.takeover(TakeoverMessage::new(&owner(), 1)).await.unwrap();
        assert_eq!(reason(&takeover), Some(RejectionReason::Dead));

        assert_eq!(server.discover().await.unwrap().mutative_message_count, 2);
        assert_eq!(server.discover().await.unwrap().mode, ServerMode::Takeover);
        assert_eq!(
            server.get_config(&uuid).await.unwrap().unwrap().state,
            ChangeRequestState::Prepared
        );
    }

    #[tokio::test]
    async fn takeover_restricts_second_phase_to_owner() {
        let (_dir, server) = server();
        let uuid = Uuid::new_v4();
        server.prepare(prepare(0, uuid, 1)).await.unwrap();

        let recoverer = MutationOwner::new("host2", "ops");
        server.takeover(TakeoverMessage::new(&recoverer, 1)).await.unwrap();
        assert_eq!(server.discover().await.unwrap().mode, ServerMode::Takeover);

        let blocked = server.prepare(prepare(2, Uuid::new_v4(), 2)).await.unwrap();
        assert_eq!(reason(&blocked), Some(RejectionReason::Unacceptable));
        let other = server.commit(CommitMessage::new(&owner(), 2, uuid)).await.unwrap();
        assert_eq!(reason(&other), Some(RejectionReason::Unacceptable));

        let committed = server.commit(CommitMessage::new(&recoverer, 2, uuid)).await.unwrap();
        assert!(committed.is_accepted());
        let discovered = server.discover().await.unwrap();
        assert_eq!(discovered.mode, ServerMode::Normal);
        assert_eq!(discovered.last_mutation_host.as_deref(), Some("host2"));
    }

    #[tokio::test]
    async fn takeover_of_settled_node_keeps_it_accepting() {
        let (_dir, server) = server();
        let recoverer = MutationOwner::new("host2", "ops");

        assert!(server.takeover(TakeoverMessage::new(&recoverer, 0)).await.unwrap().is_accepted());

        let discovered = server.discover().await.unwrap();
        assert_eq!(discovered.mode, ServerMode::Normal);
        assert_eq!(discovered.mutative_message_count, 1);
        assert!(server.prepare(prepare(1, Uuid::new_v4(), 1)).await.unwrap().is_accepted());
    }

    /// Records whether the commit was already on disk when `apply` ran.
    struct LogWatchingApplicator {
        inner: SettingsApplicator,
        log: PathBuf,
        committed_on_disk: Mutex<Option<bool>>,
    }

    impl ChangeApplicator for LogWatchingApplicator {
        fn try_apply(
            &self,
            current: Option<&serde_json::Value>,
            change: &NomadChange,
        ) -> PotentialApplicationResult {
            self.inner.try_apply(current, change)
        }

        fn apply(&self, change: &NomadChange) -> Result<()> {
            let text = std::fs::read_to_string(&self.log).unwrap();
            *self.committed_on_disk.lock().unwrap() = Some(text.contains("COMMITTED"));
            self.inner.apply(change)
        }
    }

    #[tokio::test]
    async fn commit_is_durable_before_it_is_applied() {
        let dir = tempdir().unwrap();
        let applicator = Arc::new(LogWatchingApplicator {
            inner: SettingsApplicator::new(),
            log: dir.path().join(APPEND_LOG_FILE),
            committed_on_disk: Mutex::new(None),
        });
        let locks = LockManager::new();
        let server = NomadServer::open("node-1", dir.path(), &locks, applicator.clone()).unwrap();
        let uuid = Uuid::new_v4();

        server.prepare(prepare(0, uuid, 1)).await.unwrap();
        assert!(server.commit(CommitMessage::new(&owner(), 1, uuid)).await.unwrap().is_accepted());

        assert_eq!(*applicator.committed_on_disk.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn force_sync_copies_a_peer_history() {
        let (_dir, healthy) = server();
        let (_other_dir, behind) = server();
        let uuid = Uuid::new_v4();
        healthy.prepare(prepare(0, uuid, 1)).await.unwrap();
        healthy.commit(CommitMessage::new(&owner(), 1, uuid)).await.unwrap();

        behind.force_sync(healthy.get_change_history().await.unwrap()).await.unwrap();

        let discovered = behind.discover().await.unwrap();
        assert_eq!(discovered.current_version, 1);
        assert_eq!(discovered.latest_committed_change.unwrap().uuid, uuid);
    }

    #[tokio::test]
    async fn reset_forgets_everything() {
        let (_dir, server) = server();
        server.prepare(prepare(0, Uuid::new_v4(), 1)).await.unwrap();

        server.reset().await.unwrap();

        let discovered = server.discover().await.unwrap();
        assert_eq!(discovered.highest_version, 0);
        assert!(discovered.latest_change.is_none());
        assert!(server.verify().await.unwrap().is_clean());
    }
}
