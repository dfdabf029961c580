use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ChangeRequestState, MutationOwner, NomadChange, ServerMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NomadMessage {
    Discover,
    Prepare(PrepareMessage),
    Commit(CommitMessage),
    Rollback(RollbackMessage),
    Takeover(TakeoverMessage),
}

impl NomadMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NomadMessage::Discover => "discover",
            NomadMessage::Prepare(_) => "prepare",
            NomadMessage::Commit(_) => "commit",
            NomadMessage::Rollback(_) => "rollback",
            NomadMessage::Takeover(_) => "takeover",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NomadResponse {
    Discover(DiscoverResponse),
    AcceptReject(AcceptRejectResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareMessage {
    /// Mutative message count the sender last saw on this node.
    pub expected_mutative_message_count: u64,
    pub change_uuid: Uuid,
    pub version: u64,
    pub change: NomadChange,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMessage {
    pub expected_mutative_message_count: u64,
    pub change_uuid: Uuid,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackMessage {
    pub expected_mutative_message_count: u64,
    pub change_uuid: Uuid,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverMessage {
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

impl PrepareMessage {
    pub fn new(
        owner: &MutationOwner,
        expected_mutative_message_count: u64,
        change_uuid: Uuid,
        version: u64,
        change: NomadChange,
    ) -> Self {
        Self {
            expected_mutative_message_count,
            change_uuid,
            version,
            change,
            mutation_host: owner.host.clone(),
            mutation_user: owner.user.clone(),
            mutation_timestamp: Utc::now(),
        }
    }
}

impl CommitMessage {
    pub fn new(
        owner: &MutationOwner,
        expected_mutative_message_count: u64,
        change_uuid: Uuid,
    ) -> Self {
        Self {
            expected_mutative_message_count,
            change_uuid,
            mutation_host: owner.host.clone(),
            mutation_user: owner.user.clone(),
            mutation_timestamp: Utc::now(),
        }
    }
}

impl RollbackMessage {
    pub fn new(
        owner: &MutationOwner,
        expected_mutative_message_count: u64,
        change_uuid: Uuid,
    ) -> Self {
        Self {
            expected_mutative_message_count,
            change_uuid,
            mutation_host: owner.host.clone(),
            mutation_user: owner.user.clone(),
            mutation_timestamp: Utc::now(),
        }
    }
}

impl TakeoverMessage {
    pub fn new(owner: &MutationOwner, expected_mutative_message_count: u64) -> Self {
        Self {
            expected_mutative_message_count,
            mutation_host: owner.host.clone(),
            mutation_user: owner.user.clone(),
            mutation_timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    /// The message does not fit this node's state for the change.
    Bad,
    /// The change already reached a terminal state, or the sender's view
    /// of the node is stale because another client mutated it.
    Dead,
    /// The node is busy or refuses the change.
    Unacceptable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
}

/// A message that contradicts a terminal state, e.g. a rollback for a change
/// this node committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inconsistency {
    pub change_uuid: Uuid,
    pub state: ChangeRequestState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AcceptRejectResponse {
    Accept,
    Reject(Rejection),
    Fatal(Inconsistency),
}

impl AcceptRejectResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptRejectResponse::Accept)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AcceptRejectResponse::Fatal(_))
    }

    /// `Fatal` is reported as `Bad` to callers that only look at reasons.
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            AcceptRejectResponse::Accept => None,
            AcceptRejectResponse::Reject(rejection) => Some(rejection.reason),
            AcceptRejectResponse::Fatal(_) => Some(RejectionReason::Bad),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            AcceptRejectResponse::Accept => None,
            AcceptRejectResponse::Reject(rejection) => Some(&rejection.message),
            AcceptRejectResponse::Fatal(inconsistency) => Some(&inconsistency.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeDetails {
    pub uuid: Uuid,
    pub state: ChangeRequestState,
    pub version: u64,
    pub change: NomadChange,
    pub result: serde_json::Value,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverResponse {
    pub mode: ServerMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub current_version: u64,
    pub highest_version: u64,
    pub latest_change: Option<ChangeDetails>,
    pub latest_committed_change: Option<ChangeDetails>,
}

impl DiscoverResponse {
    pub fn latest_change_uuid(&self) -> Option<Uuid> {
        self.latest_change.as_ref().map(|c| c.uuid)
    }

    pub fn latest_change_state(&self) -> Option<ChangeRequestState> {
        self.latest_change.as_ref().map(|c| c.state)
    }

    pub fn is_prepared(&self) -> bool {
        self.latest_change_state() == Some(ChangeRequestState::Prepared)
    }
}
