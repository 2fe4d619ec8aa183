//! Webhook ingestion end to end: idempotency, version gating and the
//! follow-up job queue.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{delivery, product, products, runtime, FakeUpstream};
use shelfsync::adapters::cache::detail_key;
use shelfsync::domain::models::{ApplyOutcome, DataSource, WebhookState};
use shelfsync::services::WebhookResponse;
use shelfsync::{IdempotencyLedger, JobQueue, ReplicaStore};

#[tokio::test]
async fn test_replayed_event_mutates_once_and_acks_twice() {
    let runtime = runtime(FakeUpstream::new()).await;
    let request = delivery("evt-42", "products/update", &product("P1", 1, "Cajon"));

    let first = runtime.webhooks.handle(request.clone()).await;
    let second = runtime.webhooks.handle(request).await;

    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(first.outcome, Some(ApplyOutcome::Applied));
    assert_eq!(second.outcome, Some(ApplyOutcome::Duplicate));
    assert_eq!(second.state, WebhookState::Duplicate);

    let metrics = runtime.webhooks.metrics();
    assert_eq!(metrics.applied, 1);
    assert_eq!(metrics.duplicates, 1);
    assert!(runtime.ledger.get("evt-42").await.unwrap().is_some());
    // One mutation means one follow-up job.
    assert_eq!(runtime.jobs.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_older_version_after_newer_is_discarded() {
    let runtime = runtime(FakeUpstream::new()).await;

    let v5 = runtime
        .webhooks
        .handle(delivery("evt-a", "products/update", &product("P1", 5, "Five")))
        .await;
    let v3 = runtime
        .webhooks
        .handle(delivery("evt-b", "products/update", &product("P1", 3, "Three")))
        .await;

    assert_eq!(v5.outcome, Some(ApplyOutcome::Applied));
    assert!(v3.is_success());
    assert!(matches!(v3.outcome, Some(ApplyOutcome::Stale { stored_version: 5 })));

    let stored = runtime.replica.get(&products(), "P1").await.unwrap().unwrap();
    assert_eq!(stored.upstream_version, 5);
    assert_eq!(stored.payload["title"], "Five");
    assert_eq!(runtime.webhooks.metrics().stale, 1);
}

#[tokio::test]
async fn test_newer_version_advances_replica_and_invalidates_cache() {
    let upstream = FakeUpstream::new();
    upstream.put("E1", 8, product("E1", 8, "Eight"));
    let runtime = runtime(upstream.clone()).await;

    let warm = runtime.catalog.get_entity(&products(), "E1").await.unwrap();
    assert_eq!(warm.value.upstream_version, 8);
    let key = detail_key(&products(), "E1");
    assert!(runtime.cache.get(&key).is_some());

    let response = runtime
        .webhooks
        .handle(delivery("evt-10", "products/update", &product("E1", 10, "Ten")))
        .await;
    assert_eq!(response.state, WebhookState::CacheInvalidated);

    assert_eq!(runtime.replica.get(&products(), "E1").await.unwrap().unwrap().upstream_version, 10);
    assert!(runtime.cache.get(&key).is_none());

    upstream.put("E1", 10, product("E1", 10, "Ten"));
    let read = runtime.catalog.get_entity(&products(), "E1").await.unwrap();
    assert_eq!(read.staleness.source, DataSource::Upstream);
    assert_eq!(read.value.upstream_version, 10);
}

#[tokio::test]
async fn test_delete_then_late_update_stays_deleted() {
    let runtime = runtime(FakeUpstream::new()).await;

    runtime
        .webhooks
        .handle(delivery("evt-1", "products/create", &product("P9", 1, "Shaker")))
        .await;
    let deleted = runtime
        .webhooks
        .handle(delivery("evt-2", "products/delete", &product("P9", 4, "Shaker")))
        .await;
    let late = runtime
        .webhooks
        .handle(delivery("evt-3", "products/update", &product("P9", 2, "Shaker v2")))
        .await;

    assert_eq!(deleted.outcome, Some(ApplyOutcome::Applied));
    assert!(late.is_success());
    assert!(runtime.replica.get(&products(), "P9").await.unwrap().unwrap().tombstoned);
}

#[tokio::test]
async fn test_unsigned_delivery_is_rejected() {
    let runtime = runtime(FakeUpstream::new()).await;
    let mut request = delivery("evt-1", "products/update", &product("P1", 1, "Forged"));
    request.signature = None;

    let response = runtime.webhooks.handle(request).await;
    assert_eq!(response.status, 401);
    assert!(runtime.replica.get(&products(), "P1").await.unwrap().is_none());
    assert!(runtime.ledger.get("evt-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_applied_event_wakes_the_job_worker() {
    let runtime = runtime(FakeUpstream::new()).await;
    let worker = Arc::new(runtime.job_worker());
    let mut notices = worker.subscribe();
    let handle = Arc::clone(&worker).start();

    runtime
        .webhooks
        .handle(delivery("evt-7", "products/update", &product("P7", 1, "Bongo")))
        .await;

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .expect("worker did not run")
        .unwrap();
    assert_eq!(notice.external_id, "P7");
    handle.shutdown().await;
    assert_eq!(runtime.jobs.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_mutate_once_and_keep_highest_version() {
    let runtime = Arc::new(runtime(FakeUpstream::new()).await);

    let same_event = (0..10).map(|_| delivery("evt-same", "products/update", &product("P1", 1, "Snare")));
    let racing_versions = (1..=20u64)
        .rev()
        .map(|v| delivery(&format!("evt-v{v}"), "products/update", &product("P2", v, &format!("Kick v{v}"))));
    let tasks: Vec<_> = same_event
        .chain(racing_versions)
        .map(|request| {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.webhooks.handle(request).await })
        })
        .collect();
    let responses: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(responses.iter().all(|r| r.is_success()), "{responses:?}");
    let (same, racing) = responses.split_at(10);
    let applied = |rs: &[WebhookResponse]| {
        rs.iter().filter(|r| r.outcome == Some(ApplyOutcome::Applied)).count()
    };
    assert_eq!(applied(same), 1);
    assert_eq!(
        same.iter().filter(|r| r.outcome == Some(ApplyOutcome::Duplicate)).count(),
        9
    );
    assert!(applied(racing) >= 1);

    let p2 = runtime.replica.get(&products(), "P2").await.unwrap().unwrap();
    assert_eq!(p2.upstream_version, 20);
    assert_eq!(p2.payload["title"], "Kick v20");

    let metrics = runtime.webhooks.metrics();
    assert_eq!(metrics.applied as usize, 1 + applied(racing));
    assert_eq!(metrics.duplicates, 9);
    assert_eq!(metrics.stale as usize, 20 - applied(racing));
    assert_eq!(
        runtime.jobs.pending_count().await.unwrap() as usize,
        1 + applied(racing)
    );
}
