//! SQLite implementation of the ReplicaStore trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::{debug, trace};

use super::job_repository::action_to_string;
use super::{parse_datetime, parse_entity_type, version_from_sql, version_to_sql};
use crate::domain::errors::SyncResult;
use crate::domain::models::{
    format_timestamp, ApplyOutcome, EntityType, ReplicaEntity, ReplicaPage, ReplicaQuery, SortDirection,
    SortKey, WebhookAction, WebhookEvent, FilterOp,
};
use crate::domain::ports::ReplicaStore;

/// Insert, or replace only when strictly newer. A newer write clears a tombstone.
const UPSERT_SQL: &str = r"
    INSERT INTO replica_entities
        (entity_type, external_id, upstream_version, payload, tombstoned, updated_at, synced_at)
    VALUES (?, ?, ?, ?, 0, ?, ?)
    ON CONFLICT (entity_type, external_id) DO UPDATE SET
        upstream_version = excluded.upstream_version,
        payload = excluded.payload,
        tombstoned = 0,
        updated_at = excluded.updated_at,
        synced_at = excluded.synced_at
    WHERE excluded.upstream_version > replica_entities.upstream_version
";

/// Tombstone, creating the row when unknown. The last known payload is kept.
const TOMBSTONE_SQL: &str = r"
    INSERT INTO replica_entities
        (entity_type, external_id, upstream_version, payload, tombstoned, updated_at, synced_at)
    VALUES (?, ?, ?, '{}', 1, ?, ?)
    ON CONFLICT (entity_type, external_id) DO UPDATE SET
        upstream_version = excluded.upstream_version,
        tombstoned = 1,
        updated_at = excluded.updated_at,
        synced_at = excluded.synced_at
    WHERE excluded.upstream_version > replica_entities.upstream_version
";

const SELECT_COLUMNS: &str =
    "SELECT entity_type, external_id, upstream_version, payload, tombstoned, updated_at, synced_at FROM replica_entities";

enum Change<'a> {
    Upsert(&'a Value),
    Tombstone,
}

/// Dynamically bound SQL parameter.
#[derive(Debug, Clone)]
enum Bind {
    Text(String),
    Int(i64),
    Real(f64),
    Null,
}

impl From<&Value> for Bind {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Int(i64::from(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Real))
                .unwrap_or(Self::Null),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReplicaRow {
    entity_type: String,
    external_id: String,
    upstream_version: i64,
    payload: String,
    tombstoned: bool,
    updated_at: String,
    synced_at: String,
}

impl ReplicaRow {
    fn into_entity(self) -> SyncResult<ReplicaEntity> {
        Ok(ReplicaEntity {
            entity_type: parse_entity_type(self.entity_type)?,
            external_id: self.external_id,
            upstream_version: version_from_sql(self.upstream_version)?,
            payload: serde_json::from_str(&self.payload)?,
            tombstoned: self.tombstoned,
            updated_at: parse_datetime(&self.updated_at)?,
            synced_at: parse_datetime(&self.synced_at)?,
        })
    }
}

/// SQLite-backed replica of upstream entities.
#[derive(Clone)]
pub struct SqliteReplicaRepository {
    pool: SqlitePool,
}

impl SqliteReplicaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run the version-gated write. Returns true when the row changed.
    async fn gated_write<'e, E: SqliteExecutor<'e>>(
        executor: E,
        entity_type: &EntityType,
        external_id: &str,
        version: u64,
        change: Change<'_>,
    ) -> SyncResult<bool> {
        let version = version_to_sql(version)?;
        let now = format_timestamp(&Utc::now());

        let result = match change {
            Change::Upsert(payload) => {
                sqlx::query(UPSERT_SQL)
                    .bind(entity_type.as_str())
                    .bind(external_id)
                    .bind(version)
                    .bind(serde_json::to_string(payload)?)
                    .bind(&now)
                    .bind(&now)
                    .execute(executor)
                    .await?
            }
            Change::Tombstone => {
                sqlx::query(TOMBSTONE_SQL)
                    .bind(entity_type.as_str())
                    .bind(external_id)
                    .bind(version)
                    .bind(&now)
                    .bind(&now)
                    .execute(executor)
                    .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    async fn stored_version<'e, E: SqliteExecutor<'e>>(
        executor: E,
        entity_type: &EntityType,
        external_id: &str,
    ) -> SyncResult<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT upstream_version FROM replica_entities WHERE entity_type = ? AND external_id = ?",
        )
        .bind(entity_type.as_str())
        .bind(external_id)
        .fetch_optional(executor)
        .await?;
        row.map(|(v,)| version_from_sql(v)).transpose()
    }

    async fn write(
        &self,
        entity_type: &EntityType,
        external_id: &str,
        version: u64,
        change: Change<'_>,
    ) -> SyncResult<ApplyOutcome> {
        if Self::gated_write(&self.pool, entity_type, external_id, version, change).await? {
            trace!(%entity_type, external_id, version, "replica advanced");
            return Ok(ApplyOutcome::Applied);
        }
        let stored_version = Self::stored_version(&self.pool, entity_type, external_id)
            .await?
            .unwrap_or(version);
        debug!(%entity_type, external_id, version, stored_version, "discarded stale write");
        Ok(ApplyOutcome::Stale { stored_version })
    }
}

#[async_trait]
impl ReplicaStore for SqliteReplicaRepository {
    async fn upsert(
        &self,
        entity_type: &EntityType,
        external_id: &str,
        payload: &Value,
        version: u64,
    ) -> SyncResult<ApplyOutcome> {
        self.write(entity_type, external_id, version, Change::Upsert(payload)).await
    }

    async fn delete(&self, entity_type: &EntityType, external_id: &str, version: u64) -> SyncResult<ApplyOutcome> {
        self.write(entity_type, external_id, version, Change::Tombstone).await
    }

    async fn get(&self, entity_type: &EntityType, external_id: &str) -> SyncResult<Option<ReplicaEntity>> {
        let sql = format!("{SELECT_COLUMNS} WHERE entity_type = ? AND external_id = ?");
        let row = sqlx::query_as::<_, ReplicaRow>(&sql)
            .bind(entity_type.as_str())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ReplicaRow::into_entity).transpose()
    }

    async fn query(&self, query: &ReplicaQuery) -> SyncResult<ReplicaPage> {
        query.validate()?;
        let cursor = query.decode_cursor()?;

        let mut sql = format!("{SELECT_COLUMNS} WHERE entity_type = ? AND tombstoned = 0");
        let mut binds = vec![Bind::Text(query.entity_type.to_string())];

        for filter in &query.filters {
            let path = Bind::Text(filter.json_path());
            match filter.op {
                FilterOp::Contains => {
                    sql.push_str(" AND instr(lower(CAST(json_extract(payload, ?) AS TEXT)), lower(?)) > 0");
                    binds.push(path);
                    binds.push(Bind::Text(
                        filter.value.as_str().map_or_else(|| filter.value.to_string(), str::to_string),
                    ));
                }
                FilterOp::Eq | FilterOp::Ne if filter.value.is_null() => {
                    let op = if filter.op == FilterOp::Eq { "IS NULL" } else { "IS NOT NULL" };
                    sql.push_str(&format!(" AND json_extract(payload, ?) {op}"));
                    binds.push(path);
                }
                op => {
                    let op = match op {
                        FilterOp::Eq => "=",
                        FilterOp::Ne => "IS NOT",
                        FilterOp::Gte => ">=",
                        _ => "<=",
                    };
                    sql.push_str(&format!(" AND json_extract(payload, ?) {op} ?"));
                    binds.push(path);
                    binds.push(Bind::from(&filter.value));
                }
            }
        }

        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            sql.push_str(" AND instr(lower(payload), lower(?)) > 0");
            binds.push(Bind::Text(search.trim().to_string()));
        }

        let (sort_expr, sort_binds) = match &query.sort.key {
            SortKey::ExternalId => ("external_id", vec![]),
            SortKey::UpdatedAt => ("updated_at", vec![]),
            SortKey::Field(field) => (
                "IFNULL(json_extract(payload, ?), '')",
                vec![Bind::Text(format!("$.{field}"))],
            ),
        };
        let (cmp, dir) = match query.sort.direction {
            SortDirection::Asc => (">", "ASC"),
            SortDirection::Desc => ("<", "DESC"),
        };

        // Keyset continuation on (sort value, external_id): rows inserted or
        // removed elsewhere in the ordering cannot shift this page boundary.
        if let Some(cursor) = &cursor {
            if query.sort.key == SortKey::ExternalId {
                sql.push_str(&format!(" AND external_id {cmp} ?"));
            } else {
                sql.push_str(&format!(" AND ({sort_expr}, external_id) {cmp} (?, ?)"));
                binds.extend(sort_binds.iter().cloned());
                binds.push(Bind::from(&cursor.sort_value));
            }
            binds.push(Bind::Text(cursor.external_id.clone()));
        }

        if query.sort.key == SortKey::ExternalId {
            sql.push_str(&format!(" ORDER BY external_id {dir}"));
        } else {
            sql.push_str(&format!(" ORDER BY {sort_expr} {dir}, external_id {dir}"));
            binds.extend(sort_binds.iter().cloned());
        }
        sql.push_str(" LIMIT ?");
        binds.push(Bind::Int(i64::from(query.limit) + 1));

        let mut q = sqlx::query_as::<_, ReplicaRow>(&sql);
        for bind in binds {
            q = match bind {
                Bind::Text(s) => q.bind(s),
                Bind::Int(i) => q.bind(i),
                Bind::Real(f) => q.bind(f),
                Bind::Null => q.bind(Option::<String>::None),
            };
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut items = rows
            .into_iter()
            .map(ReplicaRow::into_entity)
            .collect::<SyncResult<Vec<_>>>()?;

        let limit = query.limit as usize;
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| query.cursor_after(last))
        } else {
            None
        };

        Ok(ReplicaPage { items, next_cursor })
    }

    async fn apply_event(&self, event: &WebhookEvent) -> SyncResult<ApplyOutcome> {
        let now = format_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        // First statement is a write so the transaction holds the write lock
        // for the version read below.
        let recorded = sqlx::query(
            r"INSERT INTO processed_webhooks (event_id, entity_type, external_id, topic, outcome, processed_at)
              VALUES (?, ?, ?, ?, 'pending', ?)
              ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(event.entity_type.as_str())
        .bind(&event.external_id)
        .bind(&event.topic)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if recorded == 0 {
            tx.rollback().await?;
            return Ok(ApplyOutcome::Duplicate);
        }

        let change = match event.action {
            WebhookAction::Upsert => Change::Upsert(&event.payload),
            WebhookAction::Delete => Change::Tombstone,
        };
        let applied =
            Self::gated_write(&mut *tx, &event.entity_type, &event.external_id, event.version, change).await?;

        let outcome = if applied {
            ApplyOutcome::Applied
        } else {
            let stored_version = Self::stored_version(&mut *tx, &event.entity_type, &event.external_id)
                .await?
                .unwrap_or(event.version);
            ApplyOutcome::Stale { stored_version }
        };

        sqlx::query("UPDATE processed_webhooks SET outcome = ? WHERE event_id = ?")
            .bind(outcome.as_str())
            .bind(&event.event_id)
            .execute(&mut *tx)
            .await?;

        if applied {
            sqlx::query(
                r"INSERT INTO deferred_jobs (event_id, entity_type, external_id, action, version, run_after, created_at)
                  VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.event_id)
            .bind(event.entity_type.as_str())
            .bind(&event.external_id)
            .bind(action_to_string(event.action))
            .bind(version_to_sql(event.version)?)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn mark_synced(&self, entity_type: &EntityType, external_ids: &[String]) -> SyncResult<u64> {
        let now = format_timestamp(&Utc::now());
        let mut touched = 0;
        for chunk in external_ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE replica_entities SET synced_at = ? WHERE entity_type = ? AND external_id IN ({placeholders})"
            );
            let mut q = sqlx::query(&sql).bind(&now).bind(entity_type.as_str());
            for id in chunk {
                q = q.bind(id);
            }
            touched += q.execute(&self.pool).await?.rows_affected();
        }
        Ok(touched)
    }

    async fn sweep_tombstones(&self, older_than: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM replica_entities WHERE tombstoned = 1 AND updated_at < ?")
            .bind(format_timestamp(&older_than))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
