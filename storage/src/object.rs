use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Leaf or nested value stored under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogValue {
    Long(i64),
    String(String),
    Object(LogObject),
}

/// Hierarchical key/value object materialized from the append log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogObject {
    entries: BTreeMap<String, LogValue>,
}

impl LogObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&LogValue> {
        self.entries.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(LogValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(LogValue::Long(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_object(&self, key: &str) -> Option<&LogObject> {
        match self.entries.get(key) {
            Some(LogValue::Object(value)) => Some(value),
            _ => None,
        }
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), LogValue::String(value.into()));
        self
    }

    pub fn with_long(mut self, key: impl Into<String>, value: i64) -> Self {
        self.entries.insert(key.into(), LogValue::Long(value));
        self
    }

    pub fn with_object(mut self, key: impl Into<String>, value: LogObject) -> Self {
        self.entries.insert(key.into(), LogValue::Object(value));
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&mut self, change: &LogChange) {
        for operation in &change.operations {
            match operation {
                LogOperation::SetString { key, value } => {
                    self.entries.insert(key.clone(), LogValue::String(value.clone()));
                }
                LogOperation::SetLong { key, value } => {
                    self.entries.insert(key.clone(), LogValue::Long(*value));
                }
                LogOperation::SetObject { key, value } => {
                    self.entries.insert(key.clone(), LogValue::Object(value.clone()));
                }
                LogOperation::Remove { key } => {
                    self.entries.remove(key);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogOperation {
    SetString { key: String, value: String },
    SetLong { key: String, value: i64 },
    SetObject { key: String, value: LogObject },
    Remove { key: String },
}

/// The data carried by one append-log record: an ordered list of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogChange {
    operations: Vec<LogOperation>,
}

impl LogChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.operations.push(LogOperation::SetString {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_long(mut self, key: impl Into<String>, value: i64) -> Self {
        self.operations.push(LogOperation::SetLong {
            key: key.into(),
            value,
        });
        self
    }

    pub fn set_object(mut self, key: impl Into<String>, value: LogObject) -> Self {
        self.operations.push(LogOperation::SetObject {
            key: key.into(),
            value,
        });
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.operations.push(LogOperation::Remove { key: key.into() });
        self
    }

    pub fn push(&mut self, operation: LogOperation) {
        self.operations.push(operation);
    }

    pub fn operations(&self) -> &[LogOperation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_operations_win() {
        let mut object = LogObject::new();
        object.apply(
            &LogChange::new()
                .set_string("mode", "NORMAL")
                .set_long("count", 1)
                .set_string("mode", "TAKEOVER"),
        );

        assert_eq!(object.get_string("mode"), Some("TAKEOVER"));
        assert_eq!(object.get_long("count"), Some(1));
        assert_eq!(object.get_long("mode"), None);
    }

    #[test]
    fn remove_drops_the_key() {
        let mut object = LogObject::new().with_string("a", "1");
        object.apply(&LogChange::new().remove("a"));

        assert!(object.is_empty());
    }

    #[test]
    fn json_form_is_a_single_line() {
        let nested = LogObject::new()
            .with_string("note", "line one\nline two")
            .with_long("version", 3);
        let change = LogChange::new()
            .set_object("7f3c", nested.clone())
            .remove("old");

        let json = change.to_json().unwrap();
        assert!(!json.contains('\n'));

        let parsed = LogChange::from_json(&json).unwrap();
        assert_eq!(parsed, change);

        let mut object = LogObject::new();
        object.apply(&parsed);
        assert_eq!(object.get_object("7f3c"), Some(&nested));
    }
}
