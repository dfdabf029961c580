//! Offline maintenance of a node's nomad directory. The directory must
//! exist and the node must be stopped: everything but `verify` takes the
//! directory lock. Only `reset` changes the log.

use consensus::{ChangeRequest, ChangeStore};
use std::path::{Path, PathBuf};
use storage::{LockManager, LogObject, PersistentLog, StorageError, VerifyReport};

use crate::Result;

/// Read-only integrity check; does not take the lock or repair anything.
pub fn verify(directory: &Path) -> Result<VerifyReport> {
    Ok(PersistentLog::verify_directory(directory)?)
}

/// Materialized key/value state of the log, as the node would load it.
pub fn dump(directory: &Path) -> Result<LogObject> {
    Ok(PersistentLog::read_directory(directory, &LockManager::new())?)
}

/// Change history, oldest first, as the node would report it.
pub fn history(directory: &Path) -> Result<Vec<ChangeRequest>> {
    let snapshot = PersistentLog::read_directory(directory, &LockManager::new())?;
    Ok(ChangeStore::history_of(&snapshot)?)
}

pub fn backup(directory: &Path, label: &str) -> Result<Option<PathBuf>> {
    Ok(PersistentLog::backup_directory(directory, &LockManager::new(), label)?)
}

/// Moves the log aside and leaves an empty directory.
pub fn reset(directory: &Path) -> Result<Option<PathBuf>> {
    if !directory.is_dir() {
        return Err(StorageError::MissingDirectory(directory.to_path_buf()).into());
    }
    let mut log = PersistentLog::open(directory, &LockManager::new())?;
    let moved = log.reset()?;
    log.close();
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus::{
        CommitMessage, MutationOwner, NomadChange, NomadServer, PrepareMessage, SettingsApplicator,
    };
    use std::sync::Arc;
    use uuid::Uuid;

    async fn committed_node(directory: &Path) -> Uuid {
        let server = NomadServer::open(
            "node-0",
            directory,
            &LockManager::new(),
            Arc::new(SettingsApplicator::new()),
        )
        .unwrap();
        let owner = MutationOwner::new("host1", "admin");
        let uuid = Uuid::new_v4();
        server
            .prepare(PrepareMessage::new(
                &owner,
                0,
                uuid,
                1,
                NomadChange::new("set name", serde_json::json!({ "name": "c1" })),
            ))
            .await
            .unwrap();
        server.commit(CommitMessage::new(&owner, 1, uuid)).await.unwrap();
        uuid
    }

    #[tokio::test]
    async fn inspects_a_stopped_node() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = committed_node(dir.path()).await;

        let report = verify(dir.path()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.records, 2);

        let history = history(dir.path()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].uuid, uuid);

        assert!(!dump(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn backup_then_reset() {
        let dir = tempfile::tempdir().unwrap();
        committed_node(dir.path()).await;

        let copy = backup(dir.path(), "manual").unwrap().unwrap();
        assert!(copy.exists());

        let moved = reset(dir.path()).unwrap().unwrap();
        assert!(moved.exists());
        assert!(history(dir.path()).unwrap().is_empty());
        assert_eq!(verify(dir.path()).unwrap().records, 0);
    }

    #[test]
    fn fresh_directory_has_nothing_to_back_up() {
        let dir = tempfile::tempdir().unwrap();
        assert!(backup(dir.path(), "empty").unwrap().is_none());
    }

    #[test]
    fn missing_directory_is_refused_and_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("node-9");

        let missing_dir = |e: crate::NomadToolError| {
            matches!(e, crate::NomadToolError::Storage(StorageError::MissingDirectory(_)))
        };
        assert!(missing_dir(verify(&missing).unwrap_err()));
        assert!(missing_dir(dump(&missing).unwrap_err()));
        assert!(missing_dir(history(&missing).unwrap_err()));
        assert!(missing_dir(backup(&missing, "x").unwrap_err()));
        assert!(missing_dir(reset(&missing).unwrap_err()));
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn inspection_leaves_a_torn_log_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = committed_node(dir.path()).await;
        let log = dir.path().join(storage::APPEND_LOG_FILE);
        let mut text = std::fs::read_to_string(&log).unwrap();
        text.push_str("{\"hash\":\"01");
        std::fs::write(&log, &text).unwrap();

        assert_eq!(history(dir.path()).unwrap()[0].uuid, uuid);
        assert!(!dump(dir.path()).unwrap().is_empty());
        assert!(backup(dir.path(), "torn").unwrap().is_some());

        assert_eq!(std::fs::read_to_string(&log).unwrap(), text);
        assert!(!verify(dir.path()).unwrap().is_clean());
    }
}
