//! Tag-based invalidation on the cache manager.

use std::time::Duration;

use shelfsync::adapters::cache::CacheManager;

fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

#[tokio::test]
async fn test_invalidate_tag_misses_every_tagged_key() {
    let cache: CacheManager<String> = CacheManager::with_limits(1_000, Duration::from_secs(60));
    let ttl = Duration::from_secs(300);
    cache.set("events:list:1", "page one".into(), ttl, &tags(&["events"]));
    cache.set("events:list:2", "page two".into(), ttl, &tags(&["events"]));
    cache.set("events:E1", "detail".into(), ttl, &tags(&["events", "events:E1"]));
    cache.set("venues:V1", "venue".into(), ttl, &tags(&["venues"]));

    let dropped = cache.invalidate("events");
    assert_eq!(dropped, 3);

    assert!(cache.get("events:list:1").is_none());
    assert!(cache.get("events:list:2").is_none());
    assert!(cache.get("events:E1").is_none());
    assert_eq!(cache.get("venues:V1").as_deref(), Some("venue"));
}

#[tokio::test]
async fn test_fill_started_before_invalidation_is_dropped() {
    let cache: CacheManager<String> = CacheManager::with_limits(1_000, Duration::from_secs(60));
    let ticket = cache.ticket(&tags(&["events"]));

    cache.invalidate("events");
    let stored = cache.set_with_ticket("events:E1", "old".into(), Duration::from_secs(60), &ticket);

    assert!(!stored);
    assert!(cache.get("events:E1").is_none());
    assert_eq!(cache.stats().dropped_fills, 1);
}

#[tokio::test]
async fn test_invalidated_key_can_be_refilled() {
    let cache: CacheManager<String> = CacheManager::with_limits(1_000, Duration::from_secs(60));
    cache.set("events:E1", "v1".into(), Duration::from_secs(60), &tags(&["events"]));
    cache.invalidate("events");

    let ticket = cache.ticket(&tags(&["events"]));
    assert!(cache.set_with_ticket("events:E1", "v2".into(), Duration::from_secs(60), &ticket));
    assert_eq!(cache.get("events:E1").as_deref(), Some("v2"));
}
