use serde::{Deserialize, Serialize};

use crate::Error;

/// Runtime settings of an [EventMachine](crate::EventMachine).
///
/// Missing fields take their default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The version of the application. Read models are built per version.
    pub app_version: String,
    /// Appends events and updates read models in one transaction.
    pub immediate_consistency: bool,
    /// Takes a snapshot of an aggregate every N versions.
    pub snapshot_frequency: Option<u64>,
    /// Persists projection positions every N events.
    pub persist_block_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_version: "0.1.0".into(),
            immediate_consistency: false,
            snapshot_frequency: None,
            persist_block_size: 1,
        }
    }
}

impl Settings {
    /// Reads settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let settings: Settings = serde_json::from_str(json)?;
        if settings.persist_block_size == 0 {
            return Err(Error::configuration("persist_block_size must be at least 1"));
        }
        if settings.snapshot_frequency == Some(0) {
            return Err(Error::configuration("snapshot_frequency must be at least 1"));
        }
        Ok(settings)
    }
}
