// testing.rs - In-process fakes for the store and wire collaborators
//
// Hand-written fakes, no mocking framework — the same testing style the
// teacher uses throughout (see its `focus_time`/`commands` test modules):
// a small struct that implements the real trait with an in-memory backing
// structure, plus a handful of knobs tests can flip to inject failures.

#![cfg(any(test, feature = "test-support"))]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::model::{ConnectionState, MutationSync, Record, SyncMetadata};
use crate::store::StorageAdapter;
use crate::wire::{
    MutateError, MutationRequest, Subscription, SubscriptionEvent, SyncPage, SyncPageRequest,
    WireClient,
};
use crate::{Error, Result};

/// In-memory storage adapter. Keyed by `(model_type, id)`.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<(String, String), Record>>,
    metadata: Mutex<HashMap<(String, String), SyncMetadata>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, model_type: &str, id: &str) -> Option<Record> {
        self.records
            .lock()
            .await
            .get(&(model_type.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn metadata_for(&self, model_type: &str, id: &str) -> Option<SyncMetadata> {
        self.metadata
            .lock()
            .await
            .get(&(model_type.to_string(), id.to_string()))
            .copied()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStore {
    async fn save_record(&self, record: Record) -> Result<Record> {
        let key = (record.model_type.clone(), record.id.clone());
        self.records.lock().await.insert(key, record.clone());
        Ok(record)
    }

    async fn save_metadata(&self, model_type: &str, id: &str, metadata: SyncMetadata) -> Result<SyncMetadata> {
        let key = (model_type.to_string(), id.to_string());
        self.metadata.lock().await.insert(key, metadata);
        Ok(metadata)
    }

    async fn delete_record(&self, model_type: &str, id: &str) -> Result<()> {
        let key = (model_type.to_string(), id.to_string());
        self.records.lock().await.remove(&key);
        Ok(())
    }

    async fn query_records(&self, model_type: &str) -> Result<Vec<Record>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.model_type == model_type)
            .cloned()
            .collect())
    }

    async fn query_sync_metadata(&self, model_type: &str, id: &str) -> Result<Option<SyncMetadata>> {
        let key = (model_type.to_string(), id.to_string());
        Ok(self.metadata.lock().await.get(&key).copied())
    }
}

/// In-memory wire client. Subscriptions are driven by handles tests keep and
/// push events onto directly (`push_data`, `push_connection`,
/// `terminate`); `mutate` calls are recorded and, by default, echoed back as
/// successful (`sync_metadata.version = expected_version.unwrap_or(1)`).
/// Tests override `mutate`'s outcome per-model by queuing responses with
/// `queue_mutate_result`.
pub struct FakeWireClient {
    subscriptions: Mutex<HashMap<String, mpsc::Sender<SubscriptionEvent>>>,
    mutate_log: Mutex<Vec<MutationRequest>>,
    mutate_queue: Mutex<Vec<std::result::Result<MutationSync, MutateError>>>,
    sync_pages: Mutex<HashMap<String, Vec<SyncPage>>>,
}

impl Default for FakeWireClient {
    fn default() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            mutate_log: Mutex::new(Vec::new()),
            mutate_queue: Mutex::new(Vec::new()),
            sync_pages: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeWireClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_data(&self, model_type: &str, payload: MutationSync) {
        if let Some(tx) = self.subscriptions.lock().await.get(model_type) {
            let _ = tx.send(SubscriptionEvent::Data(payload)).await;
        }
    }

    pub async fn push_connection(&self, model_type: &str, state: ConnectionState) {
        if let Some(tx) = self.subscriptions.lock().await.get(model_type) {
            let _ = tx.send(SubscriptionEvent::Connection(state)).await;
        }
    }

    pub async fn terminate(&self, model_type: &str, error: Option<Error>) {
        if let Some(tx) = self.subscriptions.lock().await.get(model_type) {
            let _ = tx.send(SubscriptionEvent::Terminated(error)).await;
        }
    }

    pub async fn mutate_log(&self) -> Vec<MutationRequest> {
        self.mutate_log.lock().await.clone()
    }

    /// Queues the next N `mutate` outcomes in FIFO order; once exhausted,
    /// `mutate` falls back to an automatic success echo.
    pub async fn queue_mutate_result(&self, result: std::result::Result<MutationSync, MutateError>) {
        self.mutate_queue.lock().await.push(result);
    }

    pub async fn seed_sync_page(&self, model_type: &str, page: SyncPage) {
        self.sync_pages
            .lock()
            .await
            .entry(model_type.to_string())
            .or_default()
            .push(page);
    }
}

#[async_trait]
impl WireClient for FakeWireClient {
    fn subscribe(&self, model_type: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(64);
        let (cancel_tx, _cancel_rx) = oneshot::channel();
        // `try_lock` here would race; subscriptions are registered before
        // the engine drains, which always happens on the same task.
        if let Ok(mut subs) = self.subscriptions.try_lock() {
            subs.insert(model_type.to_string(), tx);
        }
        Subscription::new(rx, cancel_tx)
    }

    async fn mutate(&self, request: MutationRequest) -> std::result::Result<MutationSync, MutateError> {
        self.mutate_log.lock().await.push(request.clone());

        let queued = {
            let mut queue = self.mutate_queue.lock().await;
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };
        if let Some(queued) = queued {
            return queued;
        }

        let version = request.expected_version.unwrap_or(1);
        Ok(MutationSync {
            record: Record {
                id: request.mutation_event.model_id,
                model_type: request.mutation_event.model_name,
                serialized_payload: request.mutation_event.payload_json,
            },
            sync_metadata: SyncMetadata {
                version,
                last_changed_at: request.mutation_event.created_at,
                deleted: matches!(request.mutation_event.mutation_type, crate::model::MutationType::Delete),
            },
        })
    }

    async fn query_sync_page(&self, request: SyncPageRequest) -> Result<SyncPage> {
        let mut pages = self.sync_pages.lock().await;
        if let Some(queue) = pages.get_mut(&request.model_type) {
            if !queue.is_empty() {
                return Ok(queue.remove(0));
            }
        }
        Ok(SyncPage {
            items: Vec::new(),
            next_token: None,
        })
    }
}

pub fn fake_wire_client() -> Arc<FakeWireClient> {
    Arc::new(FakeWireClient::new())
}

pub fn in_memory_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}
