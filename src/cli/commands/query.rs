//! Read commands: `get` and `query`.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use super::load_config;
use crate::application::SyncRuntime;
use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::domain::models::{
    EntityType, FieldFilter, Fresh, ReplicaEntity, ReplicaPage, ReplicaQuery, SortDirection, SortKey, Staleness,
};

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Entity type, e.g. products
    pub entity_type: String,

    /// Exact match on a payload field (repeatable), e.g. --filter vendor=Atlas
    #[arg(short, long, value_name = "FIELD=VALUE")]
    pub filter: Vec<String>,

    /// Case-insensitive substring match on a payload field (repeatable)
    #[arg(long, value_name = "FIELD=TEXT")]
    pub contains: Vec<String>,

    /// Free-text search across the whole payload
    #[arg(short, long)]
    pub search: Option<String>,

    /// Sort by a payload field, or by `updated_at`
    #[arg(long)]
    pub sort: Option<String>,

    /// Sort descending
    #[arg(long)]
    pub desc: bool,

    /// Page size
    #[arg(short, long, default_value = "50")]
    pub limit: u32,

    /// Cursor returned by the previous page
    #[arg(long)]
    pub cursor: Option<String>,
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((field, value)) if !field.is_empty() => Ok((field, value)),
        _ => bail!("expected FIELD=VALUE, got '{raw}'"),
    }
}

/// Numbers and booleans compare as JSON values, everything else as text.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(|v| v.is_number() || v.is_boolean() || v.is_null())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

impl QueryArgs {
    pub fn to_query(&self) -> Result<ReplicaQuery> {
        let entity_type = EntityType::new(self.entity_type.as_str())?;
        let mut query = ReplicaQuery::new(entity_type).limit(self.limit).after(self.cursor.clone());

        for raw in &self.filter {
            let (field, value) = split_pair(raw)?;
            query = query.filter(FieldFilter::eq(field, parse_value(value)));
        }
        for raw in &self.contains {
            let (field, value) = split_pair(raw)?;
            query = query.filter(FieldFilter::contains(field, value));
        }
        query.search = self.search.clone().filter(|s| !s.is_empty());

        let direction = if self.desc { SortDirection::Desc } else { SortDirection::Asc };
        let key = match self.sort.as_deref() {
            None | Some("id" | "external_id") => SortKey::ExternalId,
            Some("updated_at") => SortKey::UpdatedAt,
            Some(field) => SortKey::Field(field.to_string()),
        };
        Ok(query.sort_by(key, direction))
    }
}

#[derive(Debug, Serialize)]
pub struct EntityOutput {
    pub entity: ReplicaEntity,
    pub staleness: Staleness,
}

impl CommandOutput for EntityOutput {
    fn to_human(&self) -> String {
        TableFormatter::new().format_entity(&self.entity, &self.staleness)
    }
}

#[derive(Debug, Serialize)]
pub struct PageOutput {
    pub items: Vec<ReplicaEntity>,
    pub next_cursor: Option<String>,
    pub staleness: Staleness,
}

impl From<Fresh<ReplicaPage>> for PageOutput {
    fn from(page: Fresh<ReplicaPage>) -> Self {
        Self {
            items: page.value.items,
            next_cursor: page.value.next_cursor,
            staleness: page.staleness,
        }
    }
}

impl CommandOutput for PageOutput {
    fn to_human(&self) -> String {
        if self.items.is_empty() {
            return "No matching entities.".to_string();
        }
        let mut out = TableFormatter::new().format_entities(&self.items);
        out.push_str(&format!("\n{} row(s), data age {}s", self.items.len(), self.staleness.age.as_secs()));
        if let Some(cursor) = &self.next_cursor {
            out.push_str(&format!("\nNext page: --cursor {cursor}"));
        }
        out
    }
}

pub async fn execute_get(entity_type: &str, id: &str, config_path: Option<&Path>, json: bool) -> Result<()> {
    let entity_type = EntityType::new(entity_type)?;
    let runtime = SyncRuntime::build(load_config(config_path)?).await?;
    let read = runtime
        .catalog
        .get_entity(&entity_type, id)
        .await
        .with_context(|| format!("Failed to read {entity_type} {id}"))?;
    output(
        &EntityOutput {
            entity: read.value,
            staleness: read.staleness,
        },
        json,
    );
    Ok(())
}

pub async fn execute_query(args: QueryArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let query = args.to_query()?;
    let runtime = SyncRuntime::build(load_config(config_path)?).await?;
    let page = runtime.catalog.query(&query).await?;
    output(&PageOutput::from(page), json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::FilterOp;

    fn args() -> QueryArgs {
        QueryArgs {
            entity_type: "products".into(),
            filter: vec!["vendor=Atlas".into(), "inventory=3".into()],
            contains: vec!["title=drum".into()],
            search: Some(String::new()),
            sort: Some("price".into()),
            desc: true,
            limit: 20,
            cursor: None,
        }
    }

    #[test]
    fn test_args_build_query() {
        let query = args().to_query().unwrap();
        assert_eq!(query.filters.len(), 3);
        assert_eq!(query.filters[0].value, Value::String("Atlas".into()));
        assert_eq!(query.filters[1].value, serde_json::json!(3));
        assert_eq!(query.filters[2].op, FilterOp::Contains);
        assert!(query.search.is_none());
        assert_eq!(query.sort.key, SortKey::Field("price".into()));
        assert_eq!(query.sort.direction, SortDirection::Desc);
        assert_eq!(query.limit, 20);
    }

    #[test]
    fn test_bad_filter_rejected() {
        let mut bad = args();
        bad.filter = vec!["=x".into()];
        assert!(bad.to_query().is_err());
        bad.filter = vec!["novalue".into()];
        assert!(bad.to_query().is_err());
    }
}
