use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a read result was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Live cache entry within its TTL.
    Cache,
    /// Fetched from upstream for this request (or a coalesced one).
    Upstream,
    /// Served from the local replica.
    Replica,
    /// Cache entry past its TTL, served because upstream was not reachable in time.
    StaleCache,
}

/// Staleness indicator returned alongside every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staleness {
    pub source: DataSource,
    /// Age of the served copy relative to when it was last confirmed.
    #[serde(with = "duration_millis")]
    pub age: Duration,
    /// True when the read fell back because upstream could not be reached.
    pub degraded: bool,
}

impl Staleness {
    pub fn fresh(source: DataSource, age: Duration) -> Self {
        Self {
            source,
            age,
            degraded: false,
        }
    }

    pub fn degraded(source: DataSource, age: Duration) -> Self {
        Self {
            source,
            age,
            degraded: true,
        }
    }
}

/// A value plus its staleness indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fresh<T> {
    pub value: T,
    pub staleness: Staleness,
}

impl<T> Fresh<T> {
    pub fn new(value: T, staleness: Staleness) -> Self {
        Self { value, staleness }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fresh<U> {
        Fresh {
            value: f(self.value),
            staleness: self.staleness,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
