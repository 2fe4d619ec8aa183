use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityType;
use super::webhook::WebhookAction;

/// Post-commit work enqueued inside the webhook apply transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredJob {
    pub id: i64,
    pub event_id: String,
    pub entity_type: EntityType,
    pub external_id: String,
    pub action: WebhookAction,
    pub version: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Change notification published once a deferred job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub entity_type: EntityType,
    pub external_id: String,
    pub action: WebhookAction,
    pub version: u64,
    pub event_id: String,
}

impl From<&DeferredJob> for ChangeNotice {
    fn from(job: &DeferredJob) -> Self {
        Self {
            entity_type: job.entity_type.clone(),
            external_id: job.external_id.clone(),
            action: job.action,
            version: job.version,
            event_id: job.event_id.clone(),
        }
    }
}
