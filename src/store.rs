mod memory;
mod postgres;

#[cfg(test)]
mod tests;

pub use memory::MemoryStore;
pub use postgres::{build_pool, PgRecordStore};

use crate::record::{FieldPatch, RawRecord, RecordId};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached. The pass stops and waits for the next trigger.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// The external record store. Implementations must apply `update_fields` as a partial
/// update and treat deletes of missing ids as no-ops.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Newest-first rows, with `doc` projected down to `keys`.
    async fn find_recent(&self, keys: &[&str], limit: usize) -> Result<Vec<RawRecord>, StoreError>;

    /// Returns the number of modified rows (0 when `id` no longer exists).
    async fn update_fields(&self, id: RecordId, patch: &FieldPatch) -> Result<u64, StoreError>;

    /// Returns the number of rows actually removed.
    async fn delete_many(&self, ids: &[RecordId]) -> Result<u64, StoreError>;
}
