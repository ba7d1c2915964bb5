use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod autosave;

pub use autosave::*;

/// Observable state of the autosave pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    #[default]
    Idle,
    Pending,
    Saving,
    Success,
    Error,
}

impl SaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveStatus::Idle => "idle",
            SaveStatus::Pending => "pending",
            SaveStatus::Saving => "saving",
            SaveStatus::Success => "success",
            SaveStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view published to the UI after every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutosaveSnapshot {
    pub status: SaveStatus,
    pub last_error: Option<String>,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub has_unsaved_changes: bool,
}
