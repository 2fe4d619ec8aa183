use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Running,
    Completed,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
        })
    }
}

impl CheckpointStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            _ => Self::Running,
        }
    }
}

/// Resumable position of a reconciliation pass over one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub entity_type: EntityType,
    /// Upstream cursor of the next page to fetch; `None` means "from the start".
    pub cursor: Option<String>,
    pub pages_synced: u64,
    pub records_applied: u64,
    pub records_stale: u64,
    pub status: CheckpointStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    pub fn start(entity_type: EntityType) -> Self {
        let now = Utc::now();
        Self {
            entity_type,
            cursor: None,
            pages_synced: 0,
            records_applied: 0,
            records_stale: 0,
            status: CheckpointStatus::Running,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.status == CheckpointStatus::Running
    }
}
