mod engine;
mod lines;
mod lock;
mod metadata;
mod object;
mod versioning;

pub use engine::{PersistentLog, VerifyReport, APPEND_LOG_FILE, HASH_0_FILE, HASH_1_FILE};
pub use lines::{Batch, BatchReader, LineReader, DEFAULT_READ_BUFFER};
pub use lock::{DirectoryLock, LockManager, LOCK_FILE};
pub use metadata::{CheckOutcome, HashChecker, HashFiles, HASH_LENGTH};
pub use object::{LogChange, LogObject, LogOperation, LogValue};
pub use versioning::{LogRecord, FORMAT_VERSION};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory already locked: {0}")]
    Locked(String),

    #[error("No log directory at {}", .0.display())]
    MissingDirectory(std::path::PathBuf),

    #[error("Corruption detected: {0}")]
    Corruption(#[from] CorruptionError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Log is unusable after an earlier write failure")]
    Unusable,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Integrity failures found while replaying the append log. These are never
/// repaired by the log itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptionError {
    #[error("hash file {file} does not match any record")]
    OrphanedHash { file: String },

    #[error("{count} records follow the last recognized hash")]
    UnhashedRecords { count: usize },

    #[error("hash files {first} and {second} do not mark consecutive records")]
    AmbiguousHashes { first: String, second: String },

    #[error("hash mismatch in record {index}: got {found}, computed {computed}")]
    HashMismatch {
        index: usize,
        found: String,
        computed: String,
    },

    #[error("invalid record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("invalid hash file {file}: {reason}")]
    InvalidHashFile { file: String, reason: String },

    #[error("invalid UTF-8 in line ending at byte {offset}")]
    InvalidUtf8 { offset: u64 },
}
