use async_trait::async_trait;

use crate::domain::errors::SyncResult;
use crate::domain::models::{EntityType, SyncCheckpoint};

/// Persistence for reconciliation checkpoints, one per entity type.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn load(&self, entity_type: &EntityType) -> SyncResult<Option<SyncCheckpoint>>;

    async fn save(&self, checkpoint: &SyncCheckpoint) -> SyncResult<()>;
}
