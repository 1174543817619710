// store.rs - Storage adapter contract (spec.md §6, "Store adapter (consumed)")
//
// The local persistent store is an external collaborator — a transactional
// key/value+metadata adapter the host owns. The engine only ever touches it
// through this trait; individual operations are assumed atomic, but the core
// does not use multi-statement transactions across them (spec.md §5).

use async_trait::async_trait;

use crate::model::{Record, SyncMetadata};
use crate::Result;

/// Storage adapter consumed by C3, C4.5, and C7 to read and write record and
/// metadata rows.
///
/// Implementations must be cheap to clone (an `Arc` wrapper is typical) since
/// every per-model queue and the error processor hold their own handle.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn save_record(&self, record: Record) -> Result<Record>;

    async fn save_metadata(&self, model_type: &str, id: &str, metadata: SyncMetadata) -> Result<SyncMetadata>;

    async fn delete_record(&self, model_type: &str, id: &str) -> Result<()>;

    async fn query_records(&self, model_type: &str) -> Result<Vec<Record>>;

    async fn query_sync_metadata(&self, model_type: &str, id: &str) -> Result<Option<SyncMetadata>>;
}
