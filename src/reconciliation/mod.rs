// reconciliation/mod.rs - Incoming event reconciliation (C3, C4, C4.5)

pub mod aggregate;
pub mod model_queue;

pub use aggregate::{AggregateEvent, IncomingEventQueue};
pub(crate) use aggregate::IncomingEvent;
pub use model_queue::ModelQueue;

use std::sync::Arc;

use crate::bus::AppBus;
use crate::model::{AppEvent, MutationEvent, MutationSync, MutationType};
use crate::store::StorageAdapter;
use crate::Result;

/// Local Reconciliation Primitive shared by C3 and C7 (spec.md §4.5).
///
/// Applies a server-authoritative `MutationSync` to the store, in this
/// order: upsert-or-delete the record row per `remote.deleted`, then write
/// `remote.sync_metadata`. Metadata-last guarantees that an interrupted
/// reconciliation leaves the store with the old version and can be safely
/// re-applied (spec.md §8 invariant 4).
pub async fn apply_remote(
    store: &Arc<dyn StorageAdapter>,
    bus: &AppBus,
    model_type: &str,
    remote: MutationSync,
) -> Result<MutationEvent> {
    let id = remote.record.id.clone();
    let payload_json = remote.record.serialized_payload.clone();
    let metadata = remote.sync_metadata;

    if metadata.deleted {
        store.delete_record(model_type, &id).await?;
    } else {
        store.save_record(remote.record).await?;
    }
    store.save_metadata(model_type, &id, metadata).await?;

    let mutation_type = if metadata.deleted {
        MutationType::Delete
    } else if metadata.version == 1 {
        MutationType::Create
    } else {
        MutationType::Update
    };

    let event = MutationEvent::new(
        id,
        model_type,
        mutation_type,
        payload_json,
        metadata.last_changed_at,
    );
    bus.publish(AppEvent::SyncReceived(event.clone()));
    Ok(event)
}

/// The drop-or-apply decision for one incoming subscription/initial-sync
/// payload (spec.md §4.1 processing rule). Returns `None` when the event was
/// dropped as stale (version <= current); in every other case the record is
/// absent, stale-free, or a tombstone, and `apply_remote` handles all three
/// uniformly since upserting/deleting an absent row is itself idempotent.
pub async fn reconcile_one(
    store: &Arc<dyn StorageAdapter>,
    bus: &AppBus,
    model_type: &str,
    payload: MutationSync,
) -> Result<Option<MutationEvent>> {
    if let Some(current) = store.query_sync_metadata(model_type, payload.id()).await? {
        if payload.sync_metadata.version <= current.version {
            return Ok(None);
        }
    }
    apply_remote(store, bus, model_type, payload).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, SyncMetadata};
    use crate::testing::InMemoryStore;

    fn payload(id: &str, version: u64, deleted: bool) -> MutationSync {
        MutationSync {
            record: Record {
                id: id.to_string(),
                model_type: "widget".to_string(),
                serialized_payload: "{}".to_string(),
            },
            sync_metadata: SyncMetadata {
                version,
                last_changed_at: 0,
                deleted,
            },
        }
    }

    // S2 - update-after-delete is dropped.
    #[tokio::test]
    async fn stale_update_after_delete_is_dropped() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let bus = AppBus::new();

        store
            .save_metadata(
                "widget",
                "id-1",
                SyncMetadata {
                    version: 2,
                    last_changed_at: 0,
                    deleted: true,
                },
            )
            .await
            .unwrap();

        let result = reconcile_one(&store, &bus, "widget", payload("id-1", 1, false))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(store.query_records("widget").await.unwrap().is_empty());
        let metadata = store.query_sync_metadata("widget", "id-1").await.unwrap().unwrap();
        assert_eq!(metadata.version, 2);
        assert!(metadata.deleted);
    }

    // S3 - delete with no local model.
    #[tokio::test]
    async fn delete_with_no_local_record_writes_tombstone_only() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let bus = AppBus::new();
        let mut receiver = bus.subscribe();

        let event = reconcile_one(&store, &bus, "widget", payload("id-1", 2, true))
            .await
            .unwrap()
            .expect("non-stale event should reconcile");

        assert_eq!(event.mutation_type, MutationType::Delete);
        assert!(store.query_records("widget").await.unwrap().is_empty());
        let metadata = store.query_sync_metadata("widget", "id-1").await.unwrap().unwrap();
        assert_eq!(metadata.version, 2);
        assert!(metadata.deleted);

        match receiver.try_recv().unwrap() {
            AppEvent::SyncReceived(e) => assert_eq!(e.model_id, "id-1"),
            other => panic!("expected SyncReceived, got {other:?}"),
        }
    }
}
