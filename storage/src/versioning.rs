use chrono::{SecondsFormat, Utc};

use crate::metadata::sha256_hex;
use crate::object::LogChange;
use crate::{CorruptionError, Result};

pub const FORMAT_VERSION: u32 = 1;

const FORMAT_PREFIX: &str = "format version: ";

/// One batch of the append log:
///
/// ```text
/// format version: 1
/// 2026-10-17T08:15:02.114Z
/// [{"op":"set_long","key":"currentVersion","value":3}]
/// 4be1...e09a
///
/// ```
///
/// Records written before format versions existed start with the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub format_version: Option<u32>,
    pub timestamp: String,
    pub data: String,
    pub hash: String,
}

impl LogRecord {
    pub fn new(data: String, previous_hash: Option<&str>) -> Self {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let hash = Self::compute_hash(previous_hash, &timestamp, &data);
        Self {
            format_version: Some(FORMAT_VERSION),
            timestamp,
            data,
            hash,
        }
    }

    /// Chained record hash: the first record covers its own timestamp and
    /// data, every later one also covers the previous record's hash.
    pub fn compute_hash(previous_hash: Option<&str>, timestamp: &str, data: &str) -> String {
        match previous_hash {
            None => sha256_hex(&[timestamp, "\n", data]),
            Some(previous) => sha256_hex(&[previous, "\n", "\n", timestamp, "\n", data]),
        }
    }

    /// Value written to a hash marker file once this record is durable.
    pub fn marker(&self) -> String {
        sha256_hex(&[&self.hash])
    }

    pub fn to_text(&self) -> String {
        let mut text = String::with_capacity(self.data.len() + 160);
        if let Some(version) = self.format_version {
            text.push_str(FORMAT_PREFIX);
            text.push_str(&version.to_string());
            text.push('\n');
        }
        text.push_str(&self.timestamp);
        text.push('\n');
        text.push_str(&self.data);
        text.push('\n');
        text.push_str(&self.hash);
        text.push_str("\n\n");
        text
    }

    pub fn parse(
        index: usize,
        mut lines: Vec<String>,
    ) -> std::result::Result<Self, CorruptionError> {
        let invalid = |reason: &str| CorruptionError::InvalidRecord {
            index,
            reason: reason.to_string(),
        };

        if lines.len() < 3 {
            return Err(invalid("expected at least timestamp, data and hash lines"));
        }

        let declared = lines[0]
            .strip_prefix(FORMAT_PREFIX)
            .map(|version| version.trim().parse::<u32>());

        let format_version = match declared {
            Some(Err(_)) => return Err(invalid("unreadable format version")),
            Some(Ok(version)) => {
                lines.remove(0);
                if lines.len() < 3 {
                    return Err(invalid("expected at least timestamp, data and hash lines"));
                }
                Some(version)
            }
            None => None,
        };

        let hash = lines.pop().ok_or_else(|| invalid("missing hash"))?;
        let timestamp = lines.remove(0);
        let data = lines.join("\n");

        Ok(Self {
            format_version,
            timestamp,
            data,
            hash,
        })
    }

    pub fn verify_hash(
        &self,
        index: usize,
        previous_hash: Option<&str>,
    ) -> std::result::Result<(), CorruptionError> {
        let computed = Self::compute_hash(previous_hash, &self.timestamp, &self.data);
        if computed != self.hash {
            return Err(CorruptionError::HashMismatch {
                index,
                found: self.hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    pub fn change(&self) -> Result<LogChange> {
        LogChange::from_json(&self.data)
    }
}
