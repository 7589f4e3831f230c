use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-run settings handed over by the client when a stream is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    pub run_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub skip_transaction_log: bool,
    /// Where the transaction log is written; defaults under the state root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_dir: Option<PathBuf>,
    /// Replays an existing transaction log instead of taking live records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_file: Option<PathBuf>,
}

impl RunSettings {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn is_replay(&self) -> bool {
        self.replay_file.is_some()
    }
}
