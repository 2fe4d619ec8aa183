//! Table output formatting for CLI commands
//!
//! Formats replica rows and governor state using comfy-table.

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use serde_json::Value;
use std::env;

use super::truncate;
use crate::domain::models::{DataSource, ReplicaEntity, Staleness};
use crate::services::GovernorStats;

/// Payload fields tried, in order, for the summary column.
const LABEL_FIELDS: [&str; 4] = ["title", "name", "handle", "sku"];

/// Table formatter for CLI output
pub struct TableFormatter {
    use_colors: bool,
    max_width: Option<u16>,
}

impl TableFormatter {
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
            max_width: None,
        }
    }

    pub fn with_config(use_colors: bool, max_width: Option<u16>) -> Self {
        Self { use_colors, max_width }
    }

    fn header(&self, names: &[&str]) -> Vec<Cell> {
        names
            .iter()
            .map(|n| Cell::new(*n).add_attribute(Attribute::Bold))
            .collect()
    }

    /// One row per entity.
    pub fn format_entities(&self, entities: &[ReplicaEntity]) -> String {
        let mut table = self.create_base_table();
        table.set_header(self.header(&["ID", "Label", "Version", "Updated", "Synced"]));

        for entity in entities {
            table.add_row(vec![
                Cell::new(&entity.external_id),
                Cell::new(truncate(&label(&entity.payload), 40)),
                Cell::new(entity.upstream_version),
                Cell::new(entity.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                Cell::new(entity.synced_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            ]);
        }

        table.to_string()
    }

    /// Field/value listing of one entity's top-level payload.
    pub fn format_entity(&self, entity: &ReplicaEntity, staleness: &Staleness) -> String {
        let mut table = self.create_base_table();
        table.set_header(self.header(&["Field", "Value"]));

        let source = if self.use_colors {
            Cell::new(source_label(staleness)).fg(source_color(staleness))
        } else {
            Cell::new(source_label(staleness))
        };
        table.add_row(vec![Cell::new("source"), source]);
        table.add_row(vec![Cell::new("age"), Cell::new(format!("{}s", staleness.age.as_secs()))]);
        table.add_row(vec![Cell::new("version"), Cell::new(entity.upstream_version)]);

        if let Value::Object(fields) = &entity.payload {
            for (field, value) in fields {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                table.add_row(vec![Cell::new(field), Cell::new(truncate(&rendered, 60))]);
            }
        }

        table.to_string()
    }

    pub fn format_governors(&self, stats: &[GovernorStats]) -> String {
        let mut table = self.create_base_table();
        table.set_header(self.header(&["Surface", "Granted", "Timed Out", "Saturated", "429s", "Rate/s"]));

        for s in stats {
            let rate = if self.use_colors && s.rate_limited > 0 {
                Cell::new(format!("{:.2}", s.effective_rate)).fg(Color::Yellow)
            } else {
                Cell::new(format!("{:.2}", s.effective_rate))
            };
            table.add_row(vec![
                Cell::new(s.surface.to_string()),
                Cell::new(s.granted),
                Cell::new(s.timed_out),
                Cell::new(s.saturated),
                Cell::new(s.rate_limited),
                rate,
            ]);
        }

        table.to_string()
    }

    fn create_base_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        if let Some(width) = self.max_width {
            table.set_width(width);
        }
        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Best human label for a payload.
pub fn label(payload: &Value) -> String {
    LABEL_FIELDS
        .iter()
        .find_map(|f| payload.get(*f).and_then(Value::as_str))
        .unwrap_or("-")
        .to_string()
}

fn source_label(staleness: &Staleness) -> String {
    let source = match staleness.source {
        DataSource::Cache => "cache",
        DataSource::Upstream => "upstream",
        DataSource::Replica => "replica",
        DataSource::StaleCache => "stale cache",
    };
    if staleness.degraded {
        format!("{source} (degraded)")
    } else {
        source.to_string()
    }
}

fn source_color(staleness: &Staleness) -> Color {
    if staleness.degraded {
        Color::Yellow
    } else {
        Color::Green
    }
}

/// Check if color output is supported
fn supports_color() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    !matches!(env::var("TERM").as_deref(), Ok("dumb"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::EntityType;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn entity() -> ReplicaEntity {
        ReplicaEntity {
            entity_type: EntityType::new("products").unwrap(),
            external_id: "8123".into(),
            upstream_version: 4,
            payload: json!({"title": "Tbilat drum", "price": "45.00"}),
            tombstoned: false,
            updated_at: Utc::now(),
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_entities_table_contains_rows() {
        let out = TableFormatter::with_config(false, Some(120)).format_entities(&[entity()]);
        assert!(out.contains("8123"));
        assert!(out.contains("Tbilat drum"));
    }

    #[test]
    fn test_entity_detail_shows_degraded_source() {
        let staleness = Staleness::degraded(DataSource::Replica, Duration::from_secs(90));
        let out = TableFormatter::with_config(false, Some(120)).format_entity(&entity(), &staleness);
        assert!(out.contains("replica (degraded)"));
        assert!(out.contains("90s"));
        assert!(out.contains("45.00"));
    }

    #[test]
    fn test_label_fallbacks() {
        assert_eq!(label(&json!({"name": "Oud"})), "Oud");
        assert_eq!(label(&json!({"sku": 12})), "-");
    }
}
