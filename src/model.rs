// model.rs - Core data model shared by every component (spec.md §3)

use serde::{Deserialize, Serialize};

/// Opaque application payload. The engine never inspects `serialized_payload`;
/// it is carried verbatim between the wire client, the storage adapter, and
/// the application's own model codecs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub model_type: String,
    pub serialized_payload: String,
}

/// One metadata row per record id, independent of whether a record row
/// exists. `version` is monotonically non-decreasing across the lifetime of
/// the store for a given id; a later event with `version <= current` is
/// dropped by the reconciliation queue (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub version: u64,
    pub last_changed_at: i64,
    pub deleted: bool,
}

/// The unit exchanged with the backend: a record plus the version metadata
/// that accompanies it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationSync {
    pub record: Record,
    pub sync_metadata: SyncMetadata,
}

impl MutationSync {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn model_type(&self) -> &str {
        &self.record.model_type
    }
}

/// The three ways a local mutation can change a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

/// A local mutation queued for upload (C5). Persisted so the queue survives
/// restarts; at most one event per `model_id` has `in_process == true` at any
/// time (spec.md §8 invariant 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEvent {
    pub id: String,
    pub model_id: String,
    pub model_name: String,
    pub mutation_type: MutationType,
    pub payload_json: String,
    pub created_at: i64,
    pub in_process: bool,
    pub version: Option<u64>,
    /// Times this event has been handed to the wire client. Not named in
    /// spec.md's data model but required by C1's `Advice` contract, which
    /// takes an attempt count; incremented by C5 on every dispatch.
    pub attempt_count: u32,
}

impl MutationEvent {
    pub fn new(
        model_id: impl Into<String>,
        model_name: impl Into<String>,
        mutation_type: MutationType,
        payload_json: String,
        created_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            model_name: model_name.into(),
            mutation_type,
            payload_json,
            created_at,
            in_process: false,
            version: None,
            attempt_count: 0,
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }
}

/// In-memory `{model_type, MutationSync}` buffered by C3 until the model is
/// started.
#[derive(Debug, Clone)]
pub struct PendingSubscriptionEvent {
    pub model_type: String,
    pub payload: MutationSync,
}

/// Per-model connection state tracked by C4's aggregate map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Failed,
}

/// Named states of the top-level engine state machine (C8). Transitions are
/// total and forward-only within one run; any failure jumps to `CleaningUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    NotStarted,
    StorageReady,
    SubscriptionsPaused,
    MutationsPaused,
    ClearedMutationState,
    SubscriptionsInitialized,
    InitialSyncDone,
    SubscriptionsActivated,
    MutationQueueStarted,
    Syncing,
    CleaningUp,
    CleaningUpForTermination,
    CleanedUp,
    Terminated,
}

/// Events emitted on the engine's publisher: one per named state transition,
/// plus reconciled mutation events and the terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    StorageReady,
    SubscriptionsPaused,
    MutationsPaused,
    ClearedStateOutgoingMutations,
    SubscriptionsInitialized,
    PerformedInitialSync,
    SubscriptionsActivated,
    MutationQueueStarted,
    SyncStarted,
    CleaningUp,
    CleanedUp,
    Terminated,
    /// A remote mutation was reconciled into the local store.
    MutationEvent(MutationEvent),
    /// The engine hit a terminal, unrecoverable error and will not restart.
    Failed(crate::Error),
}

/// Application-bus events (spec.md §6) — named events the host's own event
/// bus republishes to observers outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppEvent {
    /// `DataStore.syncReceived`
    SyncReceived(MutationEvent),
    /// `DataStore.conditionalSaveFailed`
    ConditionalSaveFailed(MutationEvent),
    /// `DataStore.ready`
    Ready,
}
