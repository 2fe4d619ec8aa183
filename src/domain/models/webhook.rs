use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::entity::{EntityType, VersionSource};
use crate::domain::errors::{SyncError, SyncResult};

/// What a change event does to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    Upsert,
    Delete,
}

/// A verified, decoded change notification from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub topic: String,
    pub entity_type: EntityType,
    pub action: WebhookAction,
    pub external_id: String,
    pub version: u64,
    pub payload: Value,
}

impl WebhookEvent {
    /// Decode a delivery body.
    ///
    /// The topic has the form `<entity_type>/<verb>`; `delete` tombstones,
    /// every other verb (`create`, `update`, `paid`, ...) is an upsert.
    /// The event id comes from the delivery header when present, otherwise
    /// from the body's `event_id` field.
    pub fn parse(
        event_id_header: Option<&str>,
        topic: &str,
        body: &[u8],
        id_field: &str,
        version_source: VersionSource,
    ) -> SyncResult<Self> {
        let (entity, verb) = topic
            .split_once('/')
            .ok_or_else(|| SyncError::MalformedEvent(format!("topic '{topic}' is not <entity>/<verb>")))?;
        let entity_type =
            EntityType::new(entity).map_err(|e| SyncError::MalformedEvent(e.to_string()))?;
        let action = if verb == "delete" {
            WebhookAction::Delete
        } else {
            WebhookAction::Upsert
        };

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| SyncError::MalformedEvent(format!("invalid JSON body: {e}")))?;
        if !payload.is_object() {
            return Err(SyncError::MalformedEvent("body must be a JSON object".to_string()));
        }

        let event_id = match event_id_header.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => payload
                .get("event_id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| SyncError::MalformedEvent("missing event id".to_string()))?,
        };

        let external_id = match payload.get(id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(SyncError::MalformedEvent(format!(
                    "body missing '{id_field}' field"
                )))
            }
        };
        let version = version_source.extract(&payload)?;

        Ok(Self {
            event_id,
            topic: topic.to_string(),
            entity_type,
            action,
            external_id,
            version,
            payload,
        })
    }

    /// Serialization key for per-entity ordering.
    pub fn entity_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.external_id)
    }
}

/// Result of a transactional apply, none of which is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ApplyOutcome {
    /// Replica advanced to the event's version.
    Applied,
    /// Event version not newer than stored; discarded and counted.
    Stale { stored_version: u64 },
    /// Event id already in the idempotency ledger; nothing changed.
    Duplicate,
}

impl ApplyOutcome {
    pub fn mutated(self) -> bool {
        matches!(self, Self::Applied)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Stale { .. } => "stale",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Processing stage of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookState {
    Received,
    Verified,
    Rejected,
    Duplicate,
    Applied,
    Acknowledged,
    CacheInvalidated,
    Failed,
}

impl fmt::Display for WebhookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::Duplicate => "duplicate",
            Self::Applied => "applied",
            Self::Acknowledged => "acknowledged",
            Self::CacheInvalidated => "cache_invalidated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Idempotency ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedWebhookRecord {
    pub event_id: String,
    pub entity_type: EntityType,
    pub external_id: String,
    pub topic: String,
    pub outcome: String,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: &Value) -> Vec<u8> {
        serde_json::to_vec(v).unwrap()
    }

    #[test]
    fn test_parse_update_with_header_id() {
        let event = WebhookEvent::parse(
            Some("evt-1"),
            "products/update",
            &body(&json!({"id": 42, "version": 10, "title": "Gnawa Fest"})),
            "id",
            VersionSource::Sequence,
        )
        .unwrap();

        assert_eq!(event.event_id, "evt-1");
        assert_eq!(event.entity_type.as_str(), "products");
        assert_eq!(event.action, WebhookAction::Upsert);
        assert_eq!(event.external_id, "42");
        assert_eq!(event.version, 10);
        assert_eq!(event.entity_key(), "products:42");
    }

    #[test]
    fn test_parse_delete_with_body_event_id() {
        let event = WebhookEvent::parse(
            None,
            "variants/delete",
            &body(&json!({"event_id": "evt-9", "id": "v1", "version": 4})),
            "id",
            VersionSource::Sequence,
        )
        .unwrap();
        assert_eq!(event.event_id, "evt-9");
        assert_eq!(event.action, WebhookAction::Delete);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let parse = |topic: &str, b: &[u8]| {
            WebhookEvent::parse(Some("e"), topic, b, "id", VersionSource::Sequence)
        };
        assert!(parse("products", &body(&json!({"id": 1, "version": 1}))).is_err());
        assert!(parse("products/update", b"not json").is_err());
        assert!(parse("products/update", &body(&json!([1, 2]))).is_err());
        assert!(parse("products/update", &body(&json!({"version": 1}))).is_err());
        assert!(parse("products/update", &body(&json!({"id": 1}))).is_err());
        assert!(matches!(
            WebhookEvent::parse(None, "products/update", &body(&json!({"id": 1, "version": 1})), "id", VersionSource::Sequence),
            Err(SyncError::MalformedEvent(_))
        ));
    }
}
