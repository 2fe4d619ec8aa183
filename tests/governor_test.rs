//! Token bucket timing under a paused clock.

use std::time::Duration;
use tokio::time::Instant;

use shelfsync::domain::models::{ApiSurface, GovernorSettings};
use shelfsync::{Priority, UpstreamGovernor};

fn bucket(capacity: u32, rate: f64) -> UpstreamGovernor {
    UpstreamGovernor::new(
        ApiSurface::Rest,
        GovernorSettings::new(capacity, rate).with_max_wait(Duration::from_secs(3_600)),
    )
}

#[tokio::test(start_paused = true)]
async fn test_hundred_acquires_respect_window_and_total_time() {
    let governor = bucket(2, 2.0);
    let start = Instant::now();
    let mut grants = Vec::with_capacity(100);
    for _ in 0..100 {
        governor.acquire(1, Priority::Interactive).await.unwrap();
        grants.push(start.elapsed());
    }

    // No more than 2 grants inside any 1-second window.
    for window in grants.windows(3) {
        assert!(
            window[2] - window[0] >= Duration::from_secs(1),
            "three grants within one second: {window:?}"
        );
    }
    let last = grants[99];
    assert!(last >= Duration::from_secs(49), "100th grant at {last:?}");
    assert!(last < Duration::from_secs(51), "100th grant at {last:?}");
    assert_eq!(governor.stats().granted, 100);
}

#[tokio::test(start_paused = true)]
async fn test_ten_acquires_take_at_least_four_seconds() {
    let governor = bucket(2, 2.0);
    let start = Instant::now();
    for _ in 0..10 {
        governor.acquire(1, Priority::Interactive).await.unwrap();
    }
    assert!(start.elapsed() >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_applies_new_rate() {
    let governor = bucket(1, 0.5);
    governor.acquire(1, Priority::Interactive).await.unwrap();

    governor.reconfigure(GovernorSettings::new(1, 10.0).with_max_wait(Duration::from_secs(3_600)));
    let start = Instant::now();
    governor.acquire(1, Priority::Interactive).await.unwrap();
    assert!(start.elapsed() <= Duration::from_secs(1));
}
