// lib.rs - Main library entry point
//
// Public surface of the sync engine: the error type, the data model, the
// four external-collaborator traits (store, wire client, conflict handler,
// mutation error handler), and the engine itself (`EngineBuilder` /
// `RemoteSyncEngine`). Everything else is implementation detail of C1–C8.

mod bus;
mod config;
mod conflict;
mod engine;
mod error;
mod error_processor;
mod initial_sync;
mod metrics;
mod model;
mod mutation_queue;
mod reconciliation;
mod retry;
mod store;
mod wire;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use bus::{AppBus, DEFAULT_BUS_CAPACITY};
pub use config::EngineConfig;
pub use conflict::{AlwaysApplyRemote, ConflictHandler, Resolution};
pub use engine::{EngineBuilder, RemoteSyncEngine};
pub use error::{Error, Result};
pub use error_processor::{LoggingErrorHandler, MutationErrorHandler};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use model::{
    AppEvent, ConnectionState, EngineEvent, EngineState, MutationEvent, MutationSync, MutationType,
    PendingSubscriptionEvent, Record, SyncMetadata,
};
pub use reconciliation::AggregateEvent;
pub use retry::{Advice, ExponentialBackoff, RetryPolicy};
pub use store::StorageAdapter;
pub use wire::{
    GraphQlError, GraphQlResponseError, MutateError, MutationRequest, Subscription,
    SubscriptionEvent, SyncPage, SyncPageRequest, WireClient, ERROR_TYPE_CONDITIONAL_CHECK,
    ERROR_TYPE_CONFLICT_UNHANDLED,
};
