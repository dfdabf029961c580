use serde_json::{Map, Value};
use std::sync::{Mutex, MutexGuard};

use crate::{NomadChange, NomadError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum PotentialApplicationResult {
    /// The change is acceptable; carries the configuration it would produce.
    Allowed(Value),
    Rejected(String),
}

impl PotentialApplicationResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PotentialApplicationResult::Allowed(_))
    }
}

/// Application hook deciding whether a change is acceptable and putting
/// committed changes into effect.
pub trait ChangeApplicator: Send + Sync {
    /// Computes the configuration resulting from `change` on top of the
    /// currently committed one, without side effects.
    fn try_apply(&self, current: Option<&Value>, change: &NomadChange)
        -> PotentialApplicationResult;

    /// Puts a committed change into effect.
    fn apply(&self, change: &NomadChange) -> Result<()>;
}

/// Treats the configuration as a flat JSON settings map. A change payload is
/// an object merged into it; `null` values remove keys.
#[derive(Debug, Default)]
pub struct SettingsApplicator {
    live: Mutex<Map<String, Value>>,
}

impl SettingsApplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from settings already in force, e.g. the last committed result.
    pub fn with_settings(settings: Map<String, Value>) -> Self {
        Self {
            live: Mutex::new(settings),
        }
    }

    pub fn live_settings(&self) -> Map<String, Value> {
        self.live().clone()
    }

    fn merge(target: &mut Map<String, Value>, payload: &Map<String, Value>) {
        for (key, value) in payload {
            if value.is_null() {
                target.remove(key);
            } else {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    fn live(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChangeApplicator for SettingsApplicator {
    fn try_apply(
        &self,
        current: Option<&Value>,
        change: &NomadChange,
    ) -> PotentialApplicationResult {
        let Value::Object(payload) = &change.payload else {
            return PotentialApplicationResult::Rejected(format!(
                "change '{}' is not a settings object",
                change.summary
            ));
        };

        let mut settings = match current {
            None => Map::new(),
            Some(Value::Object(settings)) => settings.clone(),
            Some(other) => {
                return PotentialApplicationResult::Rejected(format!(
                    "current configuration is not a settings object: {}",
                    other
                ))
            }
        };

        Self::merge(&mut settings, payload);
        PotentialApplicationResult::Allowed(Value::Object(settings))
    }

    fn apply(&self, change: &NomadChange) -> Result<()> {
        let Value::Object(payload) = &change.payload else {
            return Err(NomadError::Applicator(format!(
                "change '{}' is not a settings object",
                change.summary
            )));
        };

        Self::merge(&mut self.live(), payload);
        tracing::info!("Applied settings change: {}", change.summary);
        Ok(())
    }
}
