//! In-memory caching layer for hot-path reads.
//!
//! Uses `moka` for TTL-based concurrent caching with an explicit tag index
//! for invalidation. Key and tag naming lives here so every writer and
//! invalidator agrees on it.

pub mod cache_manager;

pub use cache_manager::{CacheEntry, CacheManager, CacheStats, CacheTicket};

use crate::domain::models::{EntityType, ReplicaQuery};

/// Cache key of a single entity.
pub fn detail_key(entity_type: &EntityType, external_id: &str) -> String {
    format!("{entity_type}:full:{external_id}")
}

/// Cache key of a list query result.
pub fn list_key(query: &ReplicaQuery) -> String {
    format!("{}:list:{}", query.entity_type, query.signature())
}

/// Tag carried by everything cached for one entity.
pub fn entity_tag(entity_type: &EntityType, external_id: &str) -> String {
    format!("{entity_type}:{external_id}")
}

/// Tag carried by every list result of an entity type.
pub fn list_tag(entity_type: &EntityType) -> String {
    format!("{entity_type}:list")
}

pub fn detail_tags(entity_type: &EntityType, external_id: &str) -> Vec<String> {
    vec![entity_type.to_string(), entity_tag(entity_type, external_id)]
}

pub fn list_tags(entity_type: &EntityType) -> Vec<String> {
    vec![entity_type.to_string(), list_tag(entity_type)]
}
