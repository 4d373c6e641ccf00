use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of the singleton lock row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LockState {
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub owner: Option<Uuid>,
}

/// In-memory phase of the orchestrator. Not persisted; only the lock row survives a restart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Acquiring,
    Running,
    Releasing,
    SkippedBusy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Cli,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Cli => "cli",
        };
        f.write_str(s)
    }
}
