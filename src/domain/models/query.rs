use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::entity::{EntityType, ReplicaEntity};
use super::format_timestamp;
use crate::domain::errors::{SyncError, SyncResult};

/// Upper bound on page size, matching upstream's own listing limit.
pub const MAX_PAGE_SIZE: u32 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gte,
    Lte,
    /// Case-insensitive substring match on the text value.
    Contains,
}

/// Predicate on a top-level (or dotted) payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Contains,
            value: Value::String(needle.into()),
        }
    }

    /// SQLite JSON path for the field, e.g. `$.venue.city`.
    pub fn json_path(&self) -> String {
        format!("$.{}", self.field)
    }
}

/// Ordering of a replica listing.
///
/// Only `ExternalId` pages without skips or repeats while rows change
/// between pages. With `UpdatedAt` or `Field`, a row whose sort value moves
/// past the cursor mid-session can be listed twice or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "field")]
pub enum SortKey {
    #[default]
    ExternalId,
    UpdatedAt,
    Field(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl SortSpec {
    fn label(&self) -> String {
        let key = match &self.key {
            SortKey::ExternalId => "external_id".to_string(),
            SortKey::UpdatedAt => "updated_at".to_string(),
            SortKey::Field(f) => format!("field:{f}"),
        };
        let dir = match self.direction {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        };
        format!("{key}:{dir}")
    }
}

/// Replica listing request: filters, optional free-text search, sort and keyset page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaQuery {
    pub entity_type: EntityType,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    /// Case-insensitive substring match against the whole payload text.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort: SortSpec,
    pub limit: u32,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl ReplicaQuery {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            filters: Vec::new(),
            search: None,
            sort: SortSpec::default(),
            limit: 50,
            cursor: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn sort_by(mut self, key: SortKey, direction: SortDirection) -> Self {
        self.sort = SortSpec { key, direction };
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            return Err(SyncError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.limit
            )));
        }
        for filter in &self.filters {
            validate_field_name(&filter.field)?;
        }
        if let SortKey::Field(field) = &self.sort.key {
            validate_field_name(field)?;
        }
        Ok(())
    }

    /// Deterministic signature of everything that affects the result set.
    ///
    /// Filter order does not change the signature.
    pub fn signature(&self) -> String {
        let mut filters: Vec<String> = self
            .filters
            .iter()
            .map(|f| format!("{}|{:?}|{}", f.field, f.op, f.value))
            .collect();
        filters.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.entity_type.as_str());
        for f in &filters {
            hasher.update(b"\x1f");
            hasher.update(f.as_bytes());
        }
        hasher.update(b"\x1e");
        hasher.update(self.search.as_deref().unwrap_or("").to_lowercase());
        hasher.update(b"\x1e");
        hasher.update(self.sort.label());
        hasher.update(b"\x1e");
        hasher.update(self.limit.to_string());
        hasher.update(b"\x1e");
        hasher.update(self.cursor.as_deref().unwrap_or(""));
        hex::encode(&hasher.finalize()[..16])
    }

    /// Decode the page cursor, rejecting cursors minted for another sort order.
    pub fn decode_cursor(&self) -> SyncResult<Option<PageCursor>> {
        let Some(raw) = self.cursor.as_deref() else {
            return Ok(None);
        };
        let cursor = PageCursor::decode(raw)?;
        if cursor.sort != self.sort.label() {
            return Err(SyncError::InvalidCursor(format!(
                "cursor was issued for sort '{}', query sorts by '{}'",
                cursor.sort,
                self.sort.label()
            )));
        }
        Ok(Some(cursor))
    }

    /// Build the cursor that resumes after `last`.
    pub fn cursor_after(&self, last: &ReplicaEntity) -> String {
        let sort_value = match &self.sort.key {
            SortKey::ExternalId => Value::String(last.external_id.clone()),
            SortKey::UpdatedAt => Value::String(format_timestamp(&last.updated_at)),
            SortKey::Field(field) => lookup_path(&last.payload, field)
                .map(normalize_sort_value)
                .unwrap_or_else(|| Value::String(String::new())),
        };
        PageCursor {
            sort: self.sort.label(),
            sort_value,
            external_id: last.external_id.clone(),
        }
        .encode()
    }
}

fn validate_field_name(field: &str) -> SyncResult<()> {
    let valid = !field.is_empty()
        && field
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::Validation(format!("invalid field name '{field}'")))
    }
}

fn lookup_path<'a>(payload: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(payload, |v, part| v.get(part))
}

/// Mirror SQLite's `IFNULL(json_extract(..), '')` so cursor values compare like rows do.
fn normalize_sort_value(v: &Value) -> Value {
    match v {
        Value::Null => Value::String(String::new()),
        Value::Array(_) | Value::Object(_) => Value::String(v.to_string()),
        Value::Bool(b) => Value::from(i64::from(*b)),
        other => other.clone(),
    }
}

/// Keyset position: the sort value and tie-break id of the last row served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCursor {
    pub sort: String,
    pub sort_value: Value,
    pub external_id: String,
}

impl PageCursor {
    pub fn encode(&self) -> String {
        // Serializing a struct of plain fields cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> SyncResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| SyncError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::InvalidCursor(e.to_string()))
    }
}

/// One page of replica rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaPage {
    pub items: Vec<ReplicaEntity>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn products() -> EntityType {
        EntityType::new("products").unwrap()
    }

    #[test]
    fn test_signature_ignores_filter_order() {
        let a = ReplicaQuery::new(products())
            .filter(FieldFilter::eq("city", "Dakar"))
            .filter(FieldFilter::eq("category", "music"));
        let b = ReplicaQuery::new(products())
            .filter(FieldFilter::eq("category", "music"))
            .filter(FieldFilter::eq("city", "Dakar"));
        assert_eq!(a.signature(), b.signature());

        let c = b.clone().limit(10);
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_validate_rejects_injection_in_field() {
        let q = ReplicaQuery::new(products()).filter(FieldFilter::eq("title') OR 1=1 --", "x"));
        assert!(matches!(q.validate(), Err(SyncError::Validation(_))));

        let q = ReplicaQuery::new(products()).filter(FieldFilter::eq("venue.city", "Dakar"));
        assert!(q.validate().is_ok());
    }

    #[test]
    fn test_validate_limit_bounds() {
        assert!(ReplicaQuery::new(products()).limit(0).validate().is_err());
        assert!(ReplicaQuery::new(products()).limit(251).validate().is_err());
        assert!(ReplicaQuery::new(products()).limit(250).validate().is_ok());
    }

    #[test]
    fn test_cursor_bound_to_sort_order() {
        let by_title = ReplicaQuery::new(products())
            .sort_by(SortKey::Field("title".to_string()), SortDirection::Asc);
        let cursor = PageCursor {
            sort: by_title.sort.label(),
            sort_value: json!("Afro Jazz"),
            external_id: "7".to_string(),
        }
        .encode();

        let ok = by_title.clone().after(Some(cursor.clone()));
        assert_eq!(ok.decode_cursor().unwrap().unwrap().external_id, "7");

        let other = ReplicaQuery::new(products()).after(Some(cursor));
        assert!(matches!(other.decode_cursor(), Err(SyncError::InvalidCursor(_))));

        let garbage = ReplicaQuery::new(products()).after(Some("%%%".to_string()));
        assert!(garbage.decode_cursor().is_err());
    }
}
