mod applicator;
mod entity;
mod messages;
mod server;
mod store;

pub use applicator::{ChangeApplicator, PotentialApplicationResult, SettingsApplicator};
pub use entity::NomadEntity;
pub use messages::{
    AcceptRejectResponse, ChangeDetails, CommitMessage, DiscoverResponse, Inconsistency,
    NomadMessage, NomadResponse, PrepareMessage, Rejection, RejectionReason, RollbackMessage,
    TakeoverMessage,
};
pub use server::NomadServer;
pub use store::{ChangeStore, StateChange};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequestState {
    Prepared,
    Committed,
    RolledBack,
}

impl ChangeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequestState::Prepared => "PREPARED",
            ChangeRequestState::Committed => "COMMITTED",
            ChangeRequestState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PREPARED" => Some(ChangeRequestState::Prepared),
            "COMMITTED" => Some(ChangeRequestState::Committed),
            "ROLLED_BACK" => Some(ChangeRequestState::RolledBack),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChangeRequestState::Prepared)
    }
}

impl fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMode {
    #[default]
    Normal,
    Takeover,
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::Normal => "NORMAL",
            ServerMode::Takeover => "TAKEOVER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NORMAL" => Some(ServerMode::Normal),
            "TAKEOVER" => Some(ServerMode::Takeover),
            _ => None,
        }
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application-defined configuration mutation. Only the applicator
/// interprets the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NomadChange {
    pub summary: String,
    pub payload: serde_json::Value,
}

impl NomadChange {
    pub fn new(summary: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            summary: summary.into(),
            payload,
        }
    }
}

/// Host and user of the client that sent a mutative message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationOwner {
    pub host: String,
    pub user: String,
}

impl MutationOwner {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for MutationOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// One change as stored by a node, from prepare until it is committed or
/// rolled back. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRequest {
    pub uuid: Uuid,
    pub state: ChangeRequestState,
    pub version: u64,
    pub prev_change_uuid: Option<Uuid>,
    pub change: NomadChange,
    /// Configuration in force once this change is committed.
    pub result: serde_json::Value,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
    pub last_mutation_host: String,
    pub last_mutation_user: String,
    pub last_mutation_timestamp: DateTime<Utc>,
}

impl ChangeRequest {
    pub fn prepared(
        message: &PrepareMessage,
        prev_change_uuid: Option<Uuid>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            uuid: message.change_uuid,
            state: ChangeRequestState::Prepared,
            version: message.version,
            prev_change_uuid,
            change: message.change.clone(),
            result_hash: result_hash(&result),
            result,
            creation_host: message.mutation_host.clone(),
            creation_user: message.mutation_user.clone(),
            creation_timestamp: message.mutation_timestamp,
            last_mutation_host: message.mutation_host.clone(),
            last_mutation_user: message.mutation_user.clone(),
            last_mutation_timestamp: message.mutation_timestamp,
        }
    }

    pub fn details(&self) -> ChangeDetails {
        ChangeDetails {
            uuid: self.uuid,
            state: self.state,
            version: self.version,
            change: self.change.clone(),
            result: self.result.clone(),
            creation_host: self.creation_host.clone(),
            creation_user: self.creation_user.clone(),
            creation_timestamp: self.creation_timestamp,
        }
    }
}

/// SHA-256 over the canonical JSON form of a configuration.
pub fn result_hash(result: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(result.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Versions and counters are stored as signed 64-bit integers.
pub const MAX_VERSION: u64 = i64::MAX as u64;

pub type Result<T> = std::result::Result<T, NomadError>;

#[derive(Debug, thiserror::Error)]
pub enum NomadError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Corrupt change {uuid}: {reason}")]
    CorruptChange { uuid: Uuid, reason: String },

    #[error("Inconsistent change history: {0}")]
    InconsistentHistory(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Change applicator failed: {0}")]
    Applicator(String),

    #[error("{field} {value} does not fit in the log")]
    OutOfRange { field: &'static str, value: u64 },
}
