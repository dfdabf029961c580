use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::lines::{BatchReader, LineReader, DEFAULT_READ_BUFFER};
use crate::lock::{DirectoryLock, LockManager};
use crate::metadata::{CheckOutcome, HashChecker, HashFiles};
use crate::object::{LogChange, LogObject};
use crate::versioning::LogRecord;
use crate::{CorruptionError, Result, StorageError};

pub const APPEND_LOG_FILE: &str = "append.log";
pub const HASH_0_FILE: &str = "hash0";
pub const HASH_1_FILE: &str = "hash1";

const HASH_FILES: [&str; 2] = [HASH_0_FILE, HASH_1_FILE];

/// Summary of a read-only integrity walk over a log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Records covered by a hash marker.
    pub records: usize,
    pub last_hash: Option<String>,
    pub latest_marker: Option<String>,
    pub stale_marker: Option<String>,
    pub partial_markers: Vec<String>,
    /// A complete record follows the last marker; it is dropped on open.
    pub torn_record: bool,
    /// Bytes after the last accepted record that open would truncate.
    pub trailing_bytes: u64,
}

impl VerifyReport {
    /// True when opening the directory would not repair anything.
    pub fn is_clean(&self) -> bool {
        self.stale_marker.is_none()
            && self.partial_markers.is_empty()
            && !self.torn_record
            && self.trailing_bytes == 0
    }
}

struct Scan {
    records: Vec<LogRecord>,
    valid_length: u64,
    file_length: u64,
    outcome: CheckOutcome,
    partial: Vec<String>,
    unhashed: usize,
}

impl Scan {
    fn report(&self) -> VerifyReport {
        VerifyReport {
            records: self.records.len(),
            last_hash: self.records.last().map(|r| r.hash.clone()),
            latest_marker: self.outcome.latest_file.clone(),
            stale_marker: self.outcome.stale_file.clone(),
            partial_markers: self.partial.clone(),
            torn_record: self.unhashed > 0,
            trailing_bytes: self.file_length - self.valid_length,
        }
    }
}

/// Durable append-only record log with a hash chain and alternating hash
/// marker files. Holds the directory lock for as long as it is open.
///
/// Writers must be serialized by the caller.
pub struct PersistentLog {
    directory: PathBuf,
    read_buffer: usize,
    object: LogObject,
    last_hash: Option<String>,
    record_count: usize,
    next_hash_file: &'static str,
    poisoned: bool,
    _lock: DirectoryLock,
}

impl PersistentLog {
    pub fn open(directory: impl AsRef<Path>, locks: &LockManager) -> Result<Self> {
        Self::open_with_read_buffer(directory, locks, DEFAULT_READ_BUFFER)
    }

    pub fn open_with_read_buffer(
        directory: impl AsRef<Path>,
        locks: &LockManager,
        read_buffer: usize,
    ) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        let lock = locks.lock(&directory)?;

        let scan = match Self::scan(&directory, read_buffer) {
            Ok(scan) => scan,
            Err(e) => {
                tracing::error!("Refusing to open log at {:?}: {}", directory, e);
                return Err(e);
            }
        };
        Self::repair(&directory, &scan)?;

        let mut object = LogObject::new();
        for record in &scan.records {
            object.apply(&record.change()?);
        }

        tracing::info!(
            "Opened log at {:?} with {} records",
            directory,
            scan.records.len()
        );

        Ok(Self {
            read_buffer,
            object,
            last_hash: scan.records.last().map(|r| r.hash.clone()),
            record_count: scan.records.len(),
            next_hash_file: Self::static_name(&scan.outcome.next_file),
            poisoned: false,
            directory,
            _lock: lock,
        })
    }

    /// Walks the directory without taking the lock or changing any file.
    pub fn verify_directory(directory: impl AsRef<Path>) -> Result<VerifyReport> {
        let directory = Self::existing_directory(directory.as_ref())?;
        Ok(Self::scan(directory, DEFAULT_READ_BUFFER)?.report())
    }

    /// Replays an existing directory the way `open` would, without creating,
    /// repairing or truncating anything. Unconfirmed trailing data is left on
    /// disk and ignored. Fails with `Locked` while the log is open elsewhere.
    pub fn read_directory(directory: impl AsRef<Path>, locks: &LockManager) -> Result<LogObject> {
        let directory = Self::existing_directory(directory.as_ref())?;
        let _lock = locks.lock(directory)?;

        let scan = Self::scan(directory, DEFAULT_READ_BUFFER)?;
        let mut object = LogObject::new();
        for record in &scan.records {
            object.apply(&record.change()?);
        }
        tracing::debug!("Read {} records from {:?}", scan.records.len(), directory);
        Ok(object)
    }

    /// Copies the append log of a closed directory aside without opening it.
    pub fn backup_directory(
        directory: impl AsRef<Path>,
        locks: &LockManager,
        label: &str,
    ) -> Result<Option<PathBuf>> {
        let directory = Self::existing_directory(directory.as_ref())?;
        let _lock = locks.lock(directory)?;
        Self::copy_log(directory, label)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        self.ensure_usable()?;
        Ok(Self::scan(&self.directory, self.read_buffer)?.report())
    }

    pub fn append(&mut self, change: &LogChange) -> Result<LogRecord> {
        self.ensure_usable()?;

        let record = LogRecord::new(change.to_json()?, self.last_hash.as_deref());
        if let Err(e) = self.write_record(&record) {
            tracing::error!(
                "Write to log at {:?} failed, log is now unusable: {}",
                self.directory,
                e
            );
            self.poisoned = true;
            return Err(e);
        }

        tracing::trace!("Appended record {} with hash {}", self.record_count, record.hash);

        self.object.apply(change);
        self.last_hash = Some(record.hash.clone());
        self.record_count += 1;
        self.next_hash_file = Self::other_hash_file(self.next_hash_file);
        Ok(record)
    }

    pub fn apply_change(&mut self, change: &LogChange) -> Result<()> {
        self.append(change).map(|_| ())
    }

    /// Replays every complete record from the start of the log, checking the
    /// hash chain but not the marker files.
    pub fn read(&self) -> Result<Vec<LogRecord>> {
        self.ensure_usable()?;
        let Some(file) = Self::open_existing(&self.directory.join(APPEND_LOG_FILE))? else {
            return Ok(Vec::new());
        };

        let mut records: Vec<LogRecord> = Vec::new();
        let batches = BatchReader::new(LineReader::with_capacity(self.read_buffer, file));
        for (index, batch) in batches.enumerate() {
            let record = LogRecord::parse(index, batch?.lines)?;
            record.verify_hash(index, records.last().map(|r| r.hash.as_str()))?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.object.get_string(key)
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.object.get_long(key)
    }

    pub fn get_object(&self, key: &str) -> Option<&LogObject> {
        self.object.get_object(key)
    }

    pub fn snapshot(&self) -> LogObject {
        self.object.clone()
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Copies the append log aside. Returns `None` when nothing was written yet.
    pub fn backup(&self, label: &str) -> Result<Option<PathBuf>> {
        self.ensure_usable()?;
        Self::copy_log(&self.directory, label)
    }

    /// Deletes both markers, moves the append log aside and starts over empty.
    pub fn reset(&mut self) -> Result<Option<PathBuf>> {
        self.ensure_usable()?;
        match self.clear_files() {
            Ok(moved) => {
                self.object = LogObject::new();
                self.last_hash = None;
                self.record_count = 0;
                self.next_hash_file = HASH_0_FILE;
                tracing::info!("Reset log at {:?}", self.directory);
                Ok(moved)
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    pub fn close(self) {
        tracing::debug!("Closing log at {:?}", self.directory);
    }

    fn scan(directory: &Path, read_buffer: usize) -> Result<Scan> {
        let markers = HashFiles::load(directory, HASH_FILES)?;
        let mut checker = HashChecker::new(HASH_FILES, &markers);
        let mut records: Vec<LogRecord> = Vec::new();
        let mut ends = Vec::new();
        let mut file_length = 0;

        if let Some(file) = Self::open_existing(&directory.join(APPEND_LOG_FILE))? {
            file_length = file.metadata()?.len();
            let batches = BatchReader::new(LineReader::with_capacity(read_buffer, file));
            for (index, batch) in batches.enumerate() {
                let batch = batch?;
                let record = LogRecord::parse(index, batch.lines)?;
                record.verify_hash(index, records.last().map(|r| r.hash.as_str()))?;
                checker.check(index, &record.marker())?;
                ends.push(batch.end_offset);
                records.push(record);
            }
        }

        let outcome = checker.finish(records.len())?;
        let accepted = outcome.accepted_records;
        let unhashed = records.len() - accepted;
        records.truncate(accepted);

        for (index, record) in records.iter().enumerate() {
            if let Err(e) = record.change() {
                return Err(CorruptionError::InvalidRecord {
                    index,
                    reason: e.to_string(),
                }
                .into());
            }
        }

        Ok(Scan {
            valid_length: accepted.checked_sub(1).map(|i| ends[i]).unwrap_or(0),
            file_length,
            records,
            outcome,
            partial: markers.partial,
            unhashed,
        })
    }

    fn repair(directory: &Path, scan: &Scan) -> Result<()> {
        if scan.file_length > scan.valid_length {
            tracing::warn!(
                "Truncating {} bytes of unconfirmed data from {:?}",
                scan.file_length - scan.valid_length,
                directory
            );
            let file = OpenOptions::new().write(true).open(directory.join(APPEND_LOG_FILE))?;
            file.set_len(scan.valid_length)?;
            file.sync_all()?;
        }

        for name in scan.partial.iter().chain(scan.outcome.stale_file.iter()) {
            tracing::warn!("Removing hash file {} from {:?}", name, directory);
            Self::remove_if_exists(&directory.join(name))?;
        }
        Ok(())
    }

    fn write_record(&self, record: &LogRecord) -> Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.directory.join(APPEND_LOG_FILE))?;
        log.write_all(record.to_text().as_bytes())?;
        log.sync_all()?;

        let mut marker = File::create(self.directory.join(self.next_hash_file))?;
        marker.write_all(record.marker().as_bytes())?;
        marker.sync_all()?;

        Self::remove_if_exists(&self.directory.join(Self::other_hash_file(self.next_hash_file)))
    }

    fn clear_files(&self) -> Result<Option<PathBuf>> {
        for name in HASH_FILES {
            Self::remove_if_exists(&self.directory.join(name))?;
        }

        let log = self.directory.join(APPEND_LOG_FILE);
        if !log.exists() {
            return Ok(None);
        }
        let target = Self::backup_path(&self.directory, "reset");
        fs::rename(&log, &target)?;
        Ok(Some(target))
    }

    fn copy_log(directory: &Path, label: &str) -> Result<Option<PathBuf>> {
        let source = directory.join(APPEND_LOG_FILE);
        if !source.exists() {
            return Ok(None);
        }

        let target = Self::backup_path(directory, label);
        fs::copy(&source, &target)?;
        tracing::info!("Backed up {:?} to {:?}", source, target);
        Ok(Some(target))
    }

    fn backup_path(directory: &Path, label: &str) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        directory.join(format!("backup-{}-{}.log", label, timestamp))
    }

    fn existing_directory(directory: &Path) -> Result<&Path> {
        if directory.is_dir() {
            Ok(directory)
        } else {
            Err(StorageError::MissingDirectory(directory.to_path_buf()))
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(StorageError::Unusable);
        }
        Ok(())
    }

    fn open_existing(path: &Path) -> Result<Option<File>> {
        match File::open(path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn static_name(name: &str) -> &'static str {
        if name == HASH_1_FILE {
            HASH_1_FILE
        } else {
            HASH_0_FILE
        }
    }

    fn other_hash_file(name: &str) -> &'static str {
        if name == HASH_0_FILE {
            HASH_1_FILE
        } else {
            HASH_0_FILE
        }
    }
}
