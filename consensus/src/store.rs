use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;
use std::path::Path;
use storage::{LockManager, LogChange, LogObject, PersistentLog};
use uuid::Uuid;

use crate::{
    result_hash, ChangeRequest, ChangeRequestState, MutationOwner, NomadChange, NomadError, Result,
    ServerMode,
};

const MODE: &str = "mode";
const MUTATIVE_MESSAGE_COUNT: &str = "mutativeMessageCount";
const CURRENT_VERSION: &str = "currentVersion";
const HIGHEST_VERSION: &str = "highestVersion";
const LAST_MUTATION_HOST: &str = "lastMutationHost";
const LAST_MUTATION_USER: &str = "lastMutationUser";
const LAST_MUTATION_TIMESTAMP: &str = "lastMutationTimestamp";
const LATEST_CHANGE_UUID: &str = "latestChangeUuid";
const TAKEOVER_HOST: &str = "takeoverHost";
const TAKEOVER_USER: &str = "takeoverUser";

const CHANGE_PREFIX: &str = "change:";

const STATE: &str = "state";
const VERSION: &str = "version";
const PREV_CHANGE_UUID: &str = "prevChangeUuid";
const CHANGE: &str = "change";
const RESULT: &str = "result";
const RESULT_HASH: &str = "resultHash";
const CREATION_HOST: &str = "creationHost";
const CREATION_USER: &str = "creationUser";
const CREATION_TIMESTAMP: &str = "creationTimestamp";

/// Accumulates the log operations of one protocol mutation. Applying it
/// always bumps the mutative message count. A value that cannot be stored
/// is remembered and fails the apply.
#[derive(Debug, Default)]
pub struct StateChange {
    change: LogChange,
    requests: Vec<ChangeRequest>,
    invalid: Option<NomadError>,
}

impl StateChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(mut self, mode: ServerMode) -> Self {
        self.change = self.change.set_string(MODE, mode.as_str());
        self
    }

    pub fn set_current_version(self, version: u64) -> Self {
        self.set_u64(CURRENT_VERSION, version)
    }

    pub fn set_highest_version(self, version: u64) -> Self {
        self.set_u64(HIGHEST_VERSION, version)
    }

    pub fn set_latest_change_uuid(mut self, uuid: Uuid) -> Self {
        self.change = self.change.set_string(LATEST_CHANGE_UUID, uuid.to_string());
        self
    }

    pub fn set_last_mutation(mut self, host: &str, user: &str, timestamp: DateTime<Utc>) -> Self {
        self.change = self
            .change
            .set_string(LAST_MUTATION_HOST, host)
            .set_string(LAST_MUTATION_USER, user)
            .set_string(LAST_MUTATION_TIMESTAMP, format_timestamp(&timestamp));
        self
    }

    pub fn set_takeover_owner(mut self, owner: &MutationOwner) -> Self {
        self.change = self
            .change
            .set_string(TAKEOVER_HOST, owner.host.as_str())
            .set_string(TAKEOVER_USER, owner.user.as_str());
        self
    }

    pub fn clear_takeover_owner(mut self) -> Self {
        self.change = self.change.remove(TAKEOVER_HOST).remove(TAKEOVER_USER);
        self
    }

    /// Writes the full change request, replacing any earlier record of it.
    pub fn put_change(mut self, request: ChangeRequest) -> Self {
        self.requests.push(request);
        self
    }

    fn set_u64(mut self, key: &'static str, value: u64) -> Self {
        match to_long(key, value) {
            Ok(value) => self.change = self.change.set_long(key, value),
            Err(e) => {
                self.invalid.get_or_insert(e);
            }
        }
        self
    }

    fn into_log_change(self, mutative_message_count: u64) -> Result<LogChange> {
        if let Some(e) = self.invalid {
            return Err(e);
        }
        let mut change = self.change;
        for request in &self.requests {
            change = change.set_object(change_key(&request.uuid), encode_request(request)?);
        }
        Ok(change.set_long(
            MUTATIVE_MESSAGE_COUNT,
            to_long(MUTATIVE_MESSAGE_COUNT, mutative_message_count)?,
        ))
    }
}

/// Domain view over a node's persistent log.
pub struct ChangeStore {
    log: PersistentLog,
}

impl ChangeStore {
    pub fn open(directory: impl AsRef<Path>, locks: &LockManager) -> Result<Self> {
        Ok(Self::new(PersistentLog::open(directory, locks)?))
    }

    pub fn new(log: PersistentLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &PersistentLog {
        &self.log
    }

    pub fn apply(&mut self, state_change: StateChange) -> Result<()> {
        let count = self.mutative_message_count() + 1;
        let change = state_change.into_log_change(count)?;
        self.log.apply_change(&change)?;
        Ok(())
    }

    pub fn mode(&self) -> Result<ServerMode> {
        match self.log.get_string(MODE) {
            None => Ok(ServerMode::Normal),
            Some(value) => ServerMode::parse(value)
                .ok_or_else(|| NomadError::InvalidState(format!("unknown server mode {}", value))),
        }
    }

    pub fn mutative_message_count(&self) -> u64 {
        self.get_u64(MUTATIVE_MESSAGE_COUNT)
    }

    pub fn current_version(&self) -> u64 {
        self.get_u64(CURRENT_VERSION)
    }

    pub fn highest_version(&self) -> u64 {
        self.get_u64(HIGHEST_VERSION)
    }

    pub fn last_mutation_host(&self) -> Option<String> {
        self.log.get_string(LAST_MUTATION_HOST).map(String::from)
    }

    pub fn last_mutation_user(&self) -> Option<String> {
        self.log.get_string(LAST_MUTATION_USER).map(String::from)
    }

    pub fn last_mutation_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.log
            .get_string(LAST_MUTATION_TIMESTAMP)
            .map(|value| parse_timestamp(LAST_MUTATION_TIMESTAMP, value))
            .transpose()
    }

    pub fn latest_change_uuid(&self) -> Result<Option<Uuid>> {
        self.log.get_string(LATEST_CHANGE_UUID).map(parse_latest).transpose()
    }

    pub fn takeover_owner(&self) -> Option<MutationOwner> {
        match (self.log.get_string(TAKEOVER_HOST), self.log.get_string(TAKEOVER_USER)) {
            (Some(host), Some(user)) => Some(MutationOwner::new(host, user)),
            _ => None,
        }
    }

    pub fn get_config(&self, uuid: &Uuid) -> Result<Option<ChangeRequest>> {
        self.log
            .get_object(&change_key(uuid))
            .map(|object| decode_request(*uuid, object))
            .transpose()
    }

    pub fn get_latest_change(&self) -> Result<Option<ChangeRequest>> {
        match self.latest_change_uuid()? {
            Some(uuid) => self.require_config(&uuid).map(Some),
            None => Ok(None),
        }
    }

    pub fn save_change(&mut self, request: ChangeRequest) -> Result<()> {
        self.apply(StateChange::new().put_change(request))
    }

    pub fn get_current_committed_config(&self) -> Result<Option<ChangeRequest>> {
        let mut next = self.latest_change_uuid()?;
        let mut seen = HashSet::new();
        while let Some(uuid) = next {
            if !seen.insert(uuid) {
                return Err(cycle(uuid));
            }
            let request = self.require_config(&uuid)?;
            if request.state == ChangeRequestState::Committed {
                return Ok(Some(request));
            }
            next = request.prev_change_uuid;
        }
        Ok(None)
    }

    /// All changes, oldest first, following the `prev_change_uuid` links back
    /// from the latest one.
    pub fn get_change_history(&self) -> Result<Vec<ChangeRequest>> {
        walk_history(self.latest_change_uuid()?, |uuid| self.log.get_object(&change_key(uuid)))
    }

    /// Same as `get_change_history`, over a snapshot read without opening
    /// the log.
    pub fn history_of(snapshot: &LogObject) -> Result<Vec<ChangeRequest>> {
        let latest = snapshot.get_string(LATEST_CHANGE_UUID).map(parse_latest).transpose()?;
        walk_history(latest, |uuid| snapshot.get_object(&change_key(uuid)))
    }

    pub fn has_incomplete_change(&self) -> Result<bool> {
        Ok(self
            .get_latest_change()?
            .map(|request| request.state == ChangeRequestState::Prepared)
            .unwrap_or(false))
    }

    pub fn export_history(&self) -> Result<Vec<ChangeRequest>> {
        self.get_change_history()
    }

    /// Replaces all local state by `history`, as exported by another node.
    pub fn import_history(&mut self, history: Vec<ChangeRequest>) -> Result<()> {
        check_history(&history)?;
        for request in &history {
            let computed = result_hash(&request.result);
            if computed != request.result_hash {
                return Err(NomadError::CorruptChange {
                    uuid: request.uuid,
                    reason: format!(
                        "result hash {} does not match {}",
                        request.result_hash, computed
                    ),
                });
            }
        }

        self.reset()?;
        let Some(latest) = history.last().cloned() else {
            return Ok(());
        };

        let current_version = history
            .iter()
            .rev()
            .find(|r| r.state == ChangeRequestState::Committed)
            .map(|r| r.version)
            .unwrap_or(0);

        let mut state_change = StateChange::new()
            .set_mode(ServerMode::Normal)
            .set_current_version(current_version)
            .set_highest_version(latest.version)
            .set_latest_change_uuid(latest.uuid)
            .set_last_mutation(
                &latest.last_mutation_host,
                &latest.last_mutation_user,
                latest.last_mutation_timestamp,
            );
        for request in history {
            state_change = state_change.put_change(request);
        }
        self.apply(state_change)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.log.reset()?;
        Ok(())
    }

    fn require_config(&self, uuid: &Uuid) -> Result<ChangeRequest> {
        self.get_config(uuid)?.ok_or_else(|| missing(*uuid))
    }

    fn get_u64(&self, key: &str) -> u64 {
        self.log
            .get_long(key)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0)
    }
}

fn check_history(history: &[ChangeRequest]) -> Result<()> {
    for pair in history.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(NomadError::InconsistentHistory(format!(
                "change {} (version {}) follows change {} (version {})",
                pair[1].uuid, pair[1].version, pair[0].uuid, pair[0].version
            )));
        }
        if pair[1].prev_change_uuid != Some(pair[0].uuid) {
            return Err(NomadError::InconsistentHistory(format!(
                "change {} does not link to change {}",
                pair[1].uuid, pair[0].uuid
            )));
        }
    }
    Ok(())
}

fn walk_history<'a>(
    latest: Option<Uuid>,
    lookup: impl Fn(&Uuid) -> Option<&'a LogObject>,
) -> Result<Vec<ChangeRequest>> {
    let mut history = Vec::new();
    let mut next = latest;
    let mut seen = HashSet::new();
    while let Some(uuid) = next {
        if !seen.insert(uuid) {
            return Err(cycle(uuid));
        }
        let object = lookup(&uuid).ok_or_else(|| missing(uuid))?;
        let request = decode_request(uuid, object)?;
        next = request.prev_change_uuid;
        history.push(request);
    }
    history.reverse();
    check_history(&history)?;
    Ok(history)
}

fn parse_latest(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| NomadError::InvalidState(format!("bad latest change uuid {}: {}", value, e)))
}

fn missing(uuid: Uuid) -> NomadError {
    NomadError::InconsistentHistory(format!("change {} is referenced but missing", uuid))
}

fn cycle(uuid: Uuid) -> NomadError {
    NomadError::InconsistentHistory(format!("change {} appears twice in the history chain", uuid))
}

fn to_long(field: &'static str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| NomadError::OutOfRange { field, value })
}

fn change_key(uuid: &Uuid) -> String {
    format!("{}{}", CHANGE_PREFIX, uuid)
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(key: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| NomadError::InvalidState(format!("bad timestamp in {}: {}", key, e)))
}

fn encode_request(request: &ChangeRequest) -> Result<LogObject> {
    let mut object = LogObject::new()
        .with_string(STATE, request.state.as_str())
        .with_long(VERSION, to_long(VERSION, request.version)?)
        .with_string(CHANGE, serde_json::to_string(&request.change)?)
        .with_string(RESULT, request.result.to_string())
        .with_string(RESULT_HASH, request.result_hash.as_str())
        .with_string(CREATION_HOST, request.creation_host.as_str())
        .with_string(CREATION_USER, request.creation_user.as_str())
        .with_string(CREATION_TIMESTAMP, format_timestamp(&request.creation_timestamp))
        .with_string(LAST_MUTATION_HOST, request.last_mutation_host.as_str())
        .with_string(LAST_MUTATION_USER, request.last_mutation_user.as_str())
        .with_string(LAST_MUTATION_TIMESTAMP, format_timestamp(&request.last_mutation_timestamp));
    if let Some(prev) = request.prev_change_uuid {
        object = object.with_string(PREV_CHANGE_UUID, prev.to_string());
    }
    Ok(object)
}

fn decode_request(uuid: Uuid, object: &LogObject) -> Result<ChangeRequest> {
    let corrupt = |reason: String| NomadError::CorruptChange { uuid, reason };
    let string = |key: &str| {
        object
            .get_string(key)
            .map(String::from)
            .ok_or_else(|| corrupt(format!("missing {}", key)))
    };

    let state_name = string(STATE)?;
    let state = ChangeRequestState::parse(&state_name)
        .ok_or_else(|| corrupt(format!("unknown state {}", state_name)))?;
    let version = object
        .get_long(VERSION)
        .ok_or_else(|| corrupt(format!("missing {}", VERSION)))?;
    let version = u64::try_from(version)
        .map_err(|_| corrupt(format!("negative {} {}", VERSION, version)))?;
    let prev_change_uuid = match object.get_string(PREV_CHANGE_UUID) {
        Some(value) => Some(
            Uuid::parse_str(value).map_err(|e| corrupt(format!("bad previous uuid: {}", e)))?,
        ),
        None => None,
    };
    let change: NomadChange = serde_json::from_str(&string(CHANGE)?)
        .map_err(|e| corrupt(format!("unreadable change: {}", e)))?;
    let result: serde_json::Value = serde_json::from_str(&string(RESULT)?)
        .map_err(|e| corrupt(format!("unreadable result: {}", e)))?;

    let stored_hash = string(RESULT_HASH)?;
    let computed = result_hash(&result);
    if stored_hash != computed {
        return Err(corrupt(format!("result hash {} does not match {}", stored_hash, computed)));
    }

    let timestamp = |key: &str| -> Result<DateTime<Utc>> {
        parse_timestamp(key, &string(key)?).map_err(|e| corrupt(e.to_string()))
    };

    Ok(ChangeRequest {
        uuid,
        state,
        version,
        prev_change_uuid,
        change,
        result,
        result_hash: stored_hash,
        creation_host: string(CREATION_HOST)?,
        creation_user: string(CREATION_USER)?,
        creation_timestamp: timestamp(CREATION_TIMESTAMP)?,
        last_mutation_host: string(LAST_MUTATION_HOST)?,
        last_mutation_user: string(LAST_MUTATION_USER)?,
        last_mutation_timestamp: timestamp(LAST_MUTATION_TIMESTAMP)?,
    })
}
