//! Hash marker files (`hash0` / `hash1`) and the checker deciding which
//! record was the last one fully committed.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::{CorruptionError, Result};

/// Length of a hex encoded SHA-256 marker.
pub const HASH_LENGTH: usize = 64;

pub(crate) fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Contents of both marker files as found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashFiles {
    pub hash0: Option<String>,
    pub hash1: Option<String>,
    /// Marker files shorter than a full hash: torn writes to be discarded.
    pub partial: Vec<String>,
}

impl HashFiles {
    pub fn load(directory: &Path, names: [&str; 2]) -> Result<Self> {
        let mut files = HashFiles::default();
        files.hash0 = Self::load_one(directory, names[0], &mut files.partial)?;
        files.hash1 = Self::load_one(directory, names[1], &mut files.partial)?;
        Ok(files)
    }

    fn load_one(directory: &Path, name: &str, partial: &mut Vec<String>) -> Result<Option<String>> {
        let bytes = match fs::read(directory.join(name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() > HASH_LENGTH {
            return Err(CorruptionError::InvalidHashFile {
                file: name.to_string(),
                reason: format!("{} bytes, expected {}", bytes.len(), HASH_LENGTH),
            }
            .into());
        }

        if bytes.len() < HASH_LENGTH {
            tracing::debug!("Ignoring partial hash file {} ({} bytes)", name, bytes.len());
            partial.push(name.to_string());
            return Ok(None);
        }

        let hash = String::from_utf8(bytes).map_err(|_| CorruptionError::InvalidHashFile {
            file: name.to_string(),
            reason: "not UTF-8".to_string(),
        })?;
        Ok(Some(hash))
    }
}

#[derive(Debug)]
struct Candidate {
    file: String,
    hash: Option<String>,
    matched_at: Option<usize>,
}

/// Matches record markers against the two marker files while the log is
/// replayed.
#[derive(Debug)]
pub struct HashChecker {
    candidates: [Candidate; 2],
}

/// Result of a complete replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Number of leading records covered by a marker.
    pub accepted_records: usize,
    /// Marker file naming the last accepted record.
    pub latest_file: Option<String>,
    /// Older marker that is superseded by `latest_file`.
    pub stale_file: Option<String>,
    /// File the next append writes its marker to.
    pub next_file: String,
}

impl HashChecker {
    pub fn new(names: [&str; 2], files: &HashFiles) -> Self {
        Self {
            candidates: [
                Candidate {
                    file: names[0].to_string(),
                    hash: files.hash0.clone(),
                    matched_at: None,
                },
                Candidate {
                    file: names[1].to_string(),
                    hash: files.hash1.clone(),
                    matched_at: None,
                },
            ],
        }
    }

    /// Returns whether `marker`, computed for record `index`, is one of the
    /// recorded markers.
    pub fn check(
        &mut self,
        index: usize,
        marker: &str,
    ) -> std::result::Result<bool, CorruptionError> {
        let Some(slot) = self
            .candidates
            .iter()
            .position(|c| c.hash.as_deref() == Some(marker))
        else {
            return Ok(false);
        };

        let other = 1 - slot;
        if self.candidates[slot].matched_at.is_some() {
            return Err(self.ambiguous());
        }
        if let Some(previous) = self.candidates[other].matched_at {
            if previous + 1 != index {
                return Err(self.ambiguous());
            }
        }

        self.candidates[slot].matched_at = Some(index);
        Ok(true)
    }

    pub fn finish(
        &self,
        record_count: usize,
    ) -> std::result::Result<CheckOutcome, CorruptionError> {
        for candidate in &self.candidates {
            if candidate.hash.is_some() && candidate.matched_at.is_none() {
                return Err(CorruptionError::OrphanedHash {
                    file: candidate.file.clone(),
                });
            }
        }

        let latest = self
            .candidates
            .iter()
            .enumerate()
            .filter_map(|(slot, c)| c.matched_at.map(|index| (slot, index)))
            .max_by_key(|(_, index)| *index);

        let accepted_records = latest.map(|(_, index)| index + 1).unwrap_or(0);
        let unhashed = record_count.saturating_sub(accepted_records);
        if unhashed > 1 {
            return Err(CorruptionError::UnhashedRecords { count: unhashed });
        }

        Ok(match latest {
            Some((slot, _)) => {
                let other = &self.candidates[1 - slot];
                CheckOutcome {
                    accepted_records,
                    latest_file: Some(self.candidates[slot].file.clone()),
                    stale_file: other.matched_at.map(|_| other.file.clone()),
                    next_file: other.file.clone(),
                }
            }
            None => CheckOutcome {
                accepted_records,
                latest_file: None,
                stale_file: None,
                next_file: self.candidates[0].file.clone(),
            },
        })
    }

    fn ambiguous(&self) -> CorruptionError {
        CorruptionError::AmbiguousHashes {
            first: self.candidates[0].file.clone(),
            second: self.candidates[1].file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: [&str; 2] = ["hash0", "hash1"];

    fn files(hash0: Option<&str>, hash1: Option<&str>) -> HashFiles {
        HashFiles {
            hash0: hash0.map(String::from),
            hash1: hash1.map(String::from),
            partial: Vec::new(),
        }
    }

    #[test]
    fn empty_log_without_markers_writes_hash0_next() {
        let checker = HashChecker::new(NAMES, &files(None, None));
        let outcome = checker.finish(0).unwrap();

        assert_eq!(outcome.accepted_records, 0);
        assert_eq!(outcome.next_file, "hash0");
    }

    #[test]
    fn single_unmarked_record_is_a_torn_write() {
        let checker = HashChecker::new(NAMES, &files(None, None));
        let outcome = checker.finish(1).unwrap();

        assert_eq!(outcome.accepted_records, 0);
    }

    #[test]
    fn two_unmarked_records_are_corruption() {
        let checker = HashChecker::new(NAMES, &files(None, None));
        assert_eq!(
            checker.finish(2).unwrap_err(),
            CorruptionError::UnhashedRecords { count: 2 }
        );
    }

    #[test]
    fn later_marker_supersedes_earlier_one() {
        let mut checker = HashChecker::new(NAMES, &files(Some("a"), Some("b")));
        assert!(checker.check(0, "a").unwrap());
        assert!(checker.check(1, "b").unwrap());

        let outcome = checker.finish(2).unwrap();
        assert_eq!(outcome.accepted_records, 2);
        assert_eq!(outcome.latest_file.as_deref(), Some("hash1"));
        assert_eq!(outcome.stale_file.as_deref(), Some("hash0"));
        assert_eq!(outcome.next_file, "hash0");
    }

    #[test]
    fn markers_must_be_consecutive() {
        let mut checker = HashChecker::new(NAMES, &files(Some("a"), Some("c")));
        assert!(checker.check(0, "a").unwrap());
        assert!(!checker.check(1, "b").unwrap());

        assert!(matches!(
            checker.check(2, "c"),
            Err(CorruptionError::AmbiguousHashes { .. })
        ));
    }

    #[test]
    fn marker_without_record_is_orphaned() {
        let mut checker = HashChecker::new(NAMES, &files(Some("a"), Some("zzz")));
        assert!(checker.check(0, "a").unwrap());

        assert_eq!(
            checker.finish(1).unwrap_err(),
            CorruptionError::OrphanedHash { file: "hash1".to_string() }
        );
    }
}
