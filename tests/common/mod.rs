//! Common test utilities for integration tests
//!
//! Provides an in-process upstream double and a runtime wired to an
//! in-memory database.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shelfsync::adapters::sqlite::create_migrated_test_pool;
use shelfsync::domain::models::{
    ApiSurface, Config, EntityType, GovernorSettings, UpstreamPage, UpstreamRecord,
};
use shelfsync::services::{sign, WebhookRequest};
use shelfsync::{SyncRuntime, UpstreamClient, UpstreamError};

pub const SECRET: &str = "integration-secret";

/// Setup test logging
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Upstream double holding one collection in id order.
pub struct FakeUpstream {
    records: Mutex<BTreeMap<String, UpstreamRecord>>,
    fetch_delay: Duration,
    pub fetch_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// Every `fetch_entity` sleeps this long before answering.
    pub fn with_delay(fetch_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(BTreeMap::new()),
            fetch_delay,
            fetch_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        })
    }

    pub fn put(&self, id: &str, version: u64, payload: Value) {
        self.records.lock().unwrap().insert(
            id.to_string(),
            UpstreamRecord {
                external_id: id.to_string(),
                version,
                payload,
            },
        );
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstream {
    fn surface(&self) -> ApiSurface {
        ApiSurface::Rest
    }

    async fn fetch_entity(&self, _: &EntityType, external_id: &str) -> Result<Option<UpstreamRecord>, UpstreamError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        Ok(self.records.lock().unwrap().get(external_id).cloned())
    }

    async fn list_page(&self, _: &EntityType, cursor: Option<&str>, limit: u32) -> Result<UpstreamPage, UpstreamError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.lock().unwrap();
        let page: Vec<UpstreamRecord> = records
            .values()
            .filter(|r| cursor.is_none_or(|c| r.external_id.as_str() > c))
            .take(limit as usize)
            .cloned()
            .collect();
        let next_cursor = match page.last() {
            Some(last) if records.keys().any(|k| k > &last.external_id) => Some(last.external_id.clone()),
            _ => None,
        };
        Ok(UpstreamPage {
            records: page,
            next_cursor,
        })
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.webhook.secret = Some(SECRET.to_string());
    config.governor.rest = GovernorSettings::new(100, 100.0);
    config.retry.max_retries = 1;
    config.reconciliation.entity_types = vec!["products".to_string()];
    config.reconciliation.page_size = 2;
    config
}

/// Runtime over a fresh in-memory database and the given upstream double.
pub async fn runtime(upstream: Arc<FakeUpstream>) -> SyncRuntime {
    runtime_with(test_config(), upstream).await
}

pub async fn runtime_with(config: Config, upstream: Arc<FakeUpstream>) -> SyncRuntime {
    let pool = create_migrated_test_pool()
        .await
        .expect("Failed to create test database");
    SyncRuntime::with_upstream(config, pool, upstream)
}

pub fn products() -> EntityType {
    EntityType::new("products").unwrap()
}

pub fn product(id: &str, version: u64, title: &str) -> Value {
    json!({"id": id, "version": version, "title": title})
}

/// A delivery signed with [`SECRET`].
pub fn delivery(event_id: &str, topic: &str, body: &Value) -> WebhookRequest {
    let body = serde_json::to_vec(body).unwrap();
    WebhookRequest {
        event_id: Some(event_id.to_string()),
        topic: topic.to_string(),
        signature: Some(sign(SECRET, &body).unwrap()),
        body,
    }
}
