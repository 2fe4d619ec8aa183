use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::domain::errors::{SyncError, SyncResult};

/// Upstream entity kind (`products`, `variants`, `inventory_levels`, ...).
///
/// Restricted to lowercase ASCII, digits and `_` so it can be embedded in
/// cache keys, tags and URL paths without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> SyncResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(SyncError::Validation("entity type cannot be empty".to_string()));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(SyncError::Validation(format!(
                "entity type '{name}' must be lowercase alphanumeric or '_'"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityType {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

/// How the monotonic upstream version of a record is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    /// Integer `version` field supplied by upstream. Immune to clock skew.
    #[default]
    Sequence,
    /// RFC 3339 `updated_at` timestamp, compared at microsecond precision.
    UpdatedAt,
}

impl VersionSource {
    pub fn field(self) -> &'static str {
        match self {
            Self::Sequence => "version",
            Self::UpdatedAt => "updated_at",
        }
    }

    /// Extract the version from a record body.
    pub fn extract(self, body: &Value) -> SyncResult<u64> {
        let raw = body
            .get(self.field())
            .ok_or_else(|| SyncError::MalformedEvent(format!("missing '{}' field", self.field())))?;

        let version = match self {
            Self::Sequence => match raw {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse::<u64>().ok(),
                _ => None,
            }
            .ok_or_else(|| SyncError::MalformedEvent(format!("invalid version: {raw}")))?,
            Self::UpdatedAt => {
                let s = raw
                    .as_str()
                    .ok_or_else(|| SyncError::MalformedEvent(format!("invalid updated_at: {raw}")))?;
                let ts = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| SyncError::MalformedEvent(format!("invalid updated_at '{s}': {e}")))?;
                u64::try_from(ts.timestamp_micros())
                    .map_err(|_| SyncError::MalformedEvent(format!("updated_at before epoch: {s}")))?
            }
        };

        if i64::try_from(version).is_err() {
            return Err(SyncError::MalformedEvent(format!("version {version} out of range")));
        }
        Ok(version)
    }
}

/// Local durable copy of one upstream entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaEntity {
    pub entity_type: EntityType,
    pub external_id: String,
    /// Non-decreasing per `external_id` regardless of arrival order.
    pub upstream_version: u64,
    pub payload: Value,
    pub tombstoned: bool,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
    /// When the row was last confirmed against upstream (write or re-sync).
    pub synced_at: DateTime<Utc>,
}

/// A record as returned by upstream, already decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub external_id: String,
    pub version: u64,
    pub payload: Value,
}

impl UpstreamRecord {
    /// Decode a raw upstream object using the configured id field and version source.
    pub fn decode(body: Value, id_field: &str, version_source: VersionSource) -> SyncResult<Self> {
        let external_id = match body.get(id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(SyncError::MalformedEvent(format!(
                    "record missing '{id_field}' field"
                )))
            }
        };
        let version = version_source.extract(&body)?;
        Ok(Self {
            external_id,
            version,
            payload: body,
        })
    }
}

/// One page of an upstream collection listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPage {
    pub records: Vec<UpstreamRecord>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_validation() {
        assert!(EntityType::new("products").is_ok());
        assert!(EntityType::new("inventory_levels").is_ok());
        assert!(EntityType::new("").is_err());
        assert!(EntityType::new("Products").is_err());
        assert!(EntityType::new("events:*").is_err());
    }

    #[test]
    fn test_sequence_version() {
        let v = VersionSource::Sequence.extract(&json!({"version": 10})).unwrap();
        assert_eq!(v, 10);
        let v = VersionSource::Sequence.extract(&json!({"version": "12"})).unwrap();
        assert_eq!(v, 12);
        assert!(VersionSource::Sequence.extract(&json!({"version": -1})).is_err());
        assert!(VersionSource::Sequence.extract(&json!({})).is_err());
    }

    #[test]
    fn test_updated_at_version_orders_by_time() {
        let older = VersionSource::UpdatedAt
            .extract(&json!({"updated_at": "2024-05-01T10:00:00Z"}))
            .unwrap();
        let newer = VersionSource::UpdatedAt
            .extract(&json!({"updated_at": "2024-05-01T10:00:00.000001Z"}))
            .unwrap();
        assert!(newer > older);
    }

    #[test]
    fn test_decode_numeric_id() {
        let record = UpstreamRecord::decode(
            json!({"id": 8_123_456, "version": 3, "title": "Sahel Night"}),
            "id",
            VersionSource::Sequence,
        )
        .unwrap();
        assert_eq!(record.external_id, "8123456");
        assert_eq!(record.version, 3);
        assert_eq!(record.payload["title"], "Sahel Night");
    }
}
