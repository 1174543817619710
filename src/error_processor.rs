// error_processor.rs - Mutation Error Processor (C7, spec.md §4.4)
//
// Decides what to do with a remote error for one outgoing mutation:
// classify, resolve, reconcile. Output is always `Ok(())` (error absorbed,
// C5 moves on) or `Err(...)` (logged, C5 still moves on) — nothing is
// retried at this layer automatically except the explicit retry-sends this
// processor itself issues while resolving an update/update conflict.

use std::sync::Arc;

use crate::bus::AppBus;
use crate::conflict::{ConflictHandler, Resolution};
use crate::model::{AppEvent, MutationEvent, MutationType, Record};
use crate::reconciliation::apply_remote;
use crate::store::StorageAdapter;
use crate::wire::{
    GraphQlResponseError, MutationRequest, WireClient, ERROR_TYPE_CONDITIONAL_CHECK,
    ERROR_TYPE_CONFLICT_UNHANDLED,
};
use crate::{Error, Result};

/// Host-supplied sink for mutation errors that reached a terminal outcome
/// without being absorbed into a store reconciliation — unclassified remote
/// errors, and any error a C7-issued retry-send comes back with.
pub trait MutationErrorHandler: Send + Sync {
    fn handle(&self, mutation_event: &MutationEvent, error: &Error);
}

/// Default handler that just logs; hosts almost always want to supply their
/// own (surface to UI, increment a metric, etc).
pub struct LoggingErrorHandler;

impl MutationErrorHandler for LoggingErrorHandler {
    fn handle(&self, mutation_event: &MutationEvent, error: &Error) {
        tracing::warn!(
            mutation_id = %mutation_event.id,
            model = %mutation_event.model_name,
            error = %error,
            "outgoing mutation failed terminally"
        );
    }
}

pub struct MutationErrorProcessor {
    store: Arc<dyn StorageAdapter>,
    wire_client: Arc<dyn WireClient>,
    bus: AppBus,
    error_handler: Arc<dyn MutationErrorHandler>,
}

impl MutationErrorProcessor {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        wire_client: Arc<dyn WireClient>,
        bus: AppBus,
        error_handler: Arc<dyn MutationErrorHandler>,
    ) -> Self {
        Self {
            store,
            wire_client,
            bus,
            error_handler,
        }
    }

    /// Classify `error` for `mutation_event` and reconcile. Called by C5's
    /// dispatch loop once per mutation error; never invokes the conflict
    /// handler more than once per call.
    pub async fn process(
        &self,
        mutation_event: &MutationEvent,
        error: GraphQlResponseError,
        conflict_handler: &dyn ConflictHandler,
    ) -> Result<()> {
        let Some(single) = error.single_error() else {
            // Not a single-error response: nothing actionable here.
            return Ok(());
        };

        match single.error_type.as_str() {
            ERROR_TYPE_CONDITIONAL_CHECK => {
                self.bus
                    .publish(AppEvent::ConditionalSaveFailed(mutation_event.clone()));
                Ok(())
            }
            ERROR_TYPE_CONFLICT_UNHANDLED => {
                let remote = single
                    .remote
                    .clone()
                    .ok_or_else(|| Error::Invariant("ConflictUnhandled with no remote model attached".into()))?;

                match mutation_event.mutation_type {
                    MutationType::Create => Err(Error::Invariant(
                        "conflict reported on a create mutation, which should never conflict".into(),
                    )),
                    MutationType::Delete if remote.sync_metadata.deleted => {
                        // Both sides deleted; nothing to reconcile.
                        Ok(())
                    }
                    MutationType::Delete => {
                        // Remote still has it: recreate locally from remote.
                        apply_remote(&self.store, &self.bus, &mutation_event.model_name, remote).await?;
                        Ok(())
                    }
                    MutationType::Update if remote.sync_metadata.deleted => {
                        // Remote deleted it: delete locally, tombstone.
                        apply_remote(&self.store, &self.bus, &mutation_event.model_name, remote).await?;
                        Ok(())
                    }
                    MutationType::Update => {
                        let local = Record {
                            id: mutation_event.model_id.clone(),
                            model_type: mutation_event.model_name.clone(),
                            serialized_payload: mutation_event.payload_json.clone(),
                        };
                        let resolution = conflict_handler
                            .resolve(local, remote.record.clone())
                            .await;
                        let expected_version = remote.sync_metadata.version;

                        match resolution {
                            Resolution::ApplyRemote => {
                                apply_remote(&self.store, &self.bus, &mutation_event.model_name, remote)
                                    .await?;
                                Ok(())
                            }
                            Resolution::RetryLocal => {
                                self.retry_send(mutation_event.clone(), expected_version).await;
                                Ok(())
                            }
                            Resolution::RetryWith(new_local) => {
                                let mut retried = mutation_event.clone();
                                retried.payload_json = new_local.serialized_payload;
                                self.retry_send(retried, expected_version).await;
                                Ok(())
                            }
                        }
                    }
                }
            }
            // Any other error type — including the AppSync source's
            // unclassified fall-through, which spec.md §9 flags as a bug
            // that leaves the caller hanging — is always completed here.
            _ => {
                self.error_handler.handle(
                    mutation_event,
                    &Error::Conflict(format!("unclassified remote error: {}", single.error_type)),
                );
                Ok(())
            }
        }
    }

    /// Re-send a mutation with an explicit expected version, per a conflict
    /// resolution. Any error from this retry is handed to the user's error
    /// handler and is not looped back into `process`.
    async fn retry_send(&self, mutation_event: MutationEvent, expected_version: u64) {
        let request = MutationRequest {
            mutation_event: mutation_event.clone(),
            expected_version: Some(expected_version),
        };
        if let Err(err) = self.wire_client.mutate(request).await {
            let error = match err {
                crate::wire::MutateError::Response(resp) => Error::Conflict(format!(
                    "retry after conflict resolution failed: {:?}",
                    resp.single_error().map(|e| e.error_type.clone())
                )),
                crate::wire::MutateError::Transport(e) => e,
            };
            self.error_handler.handle(&mutation_event, &error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    use super::*;
    use crate::model::{MutationEvent, MutationType};
    use crate::testing::{FakeWireClient, InMemoryStore};
    use crate::wire::{GraphQlError, GraphQlResponseError};

    struct RecordingErrorHandler {
        calls: TokioMutex<Vec<(String, String)>>,
    }

    impl RecordingErrorHandler {
        fn new() -> Self {
            Self {
                calls: TokioMutex::new(Vec::new()),
            }
        }
    }

    impl MutationErrorHandler for RecordingErrorHandler {
        fn handle(&self, mutation_event: &MutationEvent, error: &Error) {
            if let Ok(mut calls) = self.calls.try_lock() {
                calls.push((mutation_event.id.clone(), error.to_string()));
            }
        }
    }

    /// Conflict handler stub that records its invocation count and args,
    /// and always returns a pre-configured resolution — the same "stub
    /// plus assertion" shape the teacher's own test doubles use.
    struct StubConflictHandler {
        resolution: Resolution,
        calls: AtomicUsize,
    }

    impl StubConflictHandler {
        fn new(resolution: Resolution) -> Self {
            Self {
                resolution,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConflictHandler for StubConflictHandler {
        async fn resolve(&self, _local: Record, _remote: Record) -> Resolution {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.resolution.clone()
        }
    }

    fn local_update_event(id: &str, payload: &str) -> MutationEvent {
        let mut event = MutationEvent::new(id, "widget", MutationType::Update, payload.to_string(), 0);
        event.version = Some(1);
        event
    }

    fn remote_mutation_sync(id: &str, title: &str, version: u64, deleted: bool) -> crate::model::MutationSync {
        crate::model::MutationSync {
            record: Record {
                id: id.to_string(),
                model_type: "widget".to_string(),
                serialized_payload: format!("{{\"title\":\"{title}\"}}"),
            },
            sync_metadata: crate::model::SyncMetadata {
                version,
                last_changed_at: 0,
                deleted,
            },
        }
    }

    fn conflict_unhandled(remote: crate::model::MutationSync) -> GraphQlResponseError {
        GraphQlResponseError::single(GraphQlError {
            error_type: ERROR_TYPE_CONFLICT_UNHANDLED.to_string(),
            message: "conflict".to_string(),
            remote: Some(remote),
        })
    }

    // S6 - conflict resolved to ApplyRemote.
    #[tokio::test]
    async fn conflict_apply_remote_reconciles_store_and_calls_handler_once() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let wire: Arc<dyn WireClient> = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let mut bus_rx = bus.subscribe();
        let error_handler = Arc::new(LoggingErrorHandler);
        let processor = MutationErrorProcessor::new(store.clone(), wire, bus, error_handler);

        let conflict_handler = StubConflictHandler::new(Resolution::ApplyRemote);
        let mutation_event = local_update_event("id-1", "{\"title\":\"local\"}");
        let remote = remote_mutation_sync("id-1", "remote", 2, false);
        let error = conflict_unhandled(remote);

        processor
            .process(&mutation_event, error, &conflict_handler)
            .await
            .unwrap();

        assert_eq!(conflict_handler.call_count(), 1);
        let record = store.record("widget", "id-1").await.expect("record written");
        assert!(record.serialized_payload.contains("remote"));
        let metadata = store.metadata_for("widget", "id-1").await.expect("metadata written");
        assert_eq!(metadata.version, 2);
        assert!(!metadata.deleted);

        match bus_rx.try_recv().unwrap() {
            AppEvent::SyncReceived(e) => assert_eq!(e.model_id, "id-1"),
            other => panic!("expected SyncReceived, got {other:?}"),
        }
    }

    // S7 - conflict resolved to RetryLocal.
    #[tokio::test]
    async fn conflict_retry_local_resends_local_payload_with_remote_version() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let wire = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let error_handler = Arc::new(LoggingErrorHandler);
        let processor = MutationErrorProcessor::new(
            store,
            wire.clone() as Arc<dyn WireClient>,
            bus,
            error_handler,
        );

        let conflict_handler = StubConflictHandler::new(Resolution::RetryLocal);
        let mutation_event = local_update_event("id-1", "{\"title\":\"local\"}");
        let remote = remote_mutation_sync("id-1", "remote", 2, false);
        let error = conflict_unhandled(remote);

        processor
            .process(&mutation_event, error, &conflict_handler)
            .await
            .unwrap();

        assert_eq!(conflict_handler.call_count(), 1);
        let log = wire.mutate_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].expected_version, Some(2));
        assert_eq!(log[0].mutation_event.payload_json, "{\"title\":\"local\"}");
    }

    #[tokio::test]
    async fn conflict_retry_with_resends_handler_supplied_payload() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let wire = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let error_handler = Arc::new(LoggingErrorHandler);
        let processor = MutationErrorProcessor::new(
            store,
            wire.clone() as Arc<dyn WireClient>,
            bus,
            error_handler,
        );

        let replacement = Record {
            id: "id-1".to_string(),
            model_type: "widget".to_string(),
            serialized_payload: "{\"title\":\"merged\"}".to_string(),
        };
        let conflict_handler = StubConflictHandler::new(Resolution::RetryWith(replacement));
        let mutation_event = local_update_event("id-1", "{\"title\":\"local\"}");
        let remote = remote_mutation_sync("id-1", "remote", 3, false);
        let error = conflict_unhandled(remote);

        processor
            .process(&mutation_event, error, &conflict_handler)
            .await
            .unwrap();

        let log = wire.mutate_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].expected_version, Some(3));
        assert_eq!(log[0].mutation_event.payload_json, "{\"title\":\"merged\"}");
    }

    #[tokio::test]
    async fn create_conflict_is_an_invariant_violation() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let wire: Arc<dyn WireClient> = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let error_handler = Arc::new(LoggingErrorHandler);
        let processor = MutationErrorProcessor::new(store, wire, bus, error_handler);

        let mut mutation_event = local_update_event("id-1", "{}");
        mutation_event.mutation_type = MutationType::Create;
        let remote = remote_mutation_sync("id-1", "remote", 2, false);
        let error = conflict_unhandled(remote);
        let conflict_handler = StubConflictHandler::new(Resolution::ApplyRemote);

        let result = processor.process(&mutation_event, error, &conflict_handler).await;
        assert!(matches!(result, Err(Error::Invariant(_))));
        assert_eq!(conflict_handler.call_count(), 0);
    }

    #[tokio::test]
    async fn both_sides_deleted_is_absorbed_without_conflict_handler() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let wire: Arc<dyn WireClient> = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let error_handler = Arc::new(LoggingErrorHandler);
        let processor = MutationErrorProcessor::new(store, wire, bus, error_handler);

        let mut mutation_event = local_update_event("id-1", "{}");
        mutation_event.mutation_type = MutationType::Delete;
        let remote = remote_mutation_sync("id-1", "remote", 2, true);
        let error = conflict_unhandled(remote);
        let conflict_handler = StubConflictHandler::new(Resolution::ApplyRemote);

        processor
            .process(&mutation_event, error, &conflict_handler)
            .await
            .unwrap();
        assert_eq!(conflict_handler.call_count(), 0);
    }

    #[tokio::test]
    async fn conditional_check_failure_publishes_bus_event() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let wire: Arc<dyn WireClient> = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let mut bus_rx = bus.subscribe();
        let error_handler = Arc::new(LoggingErrorHandler);
        let processor = MutationErrorProcessor::new(store, wire, bus, error_handler);

        let mutation_event = local_update_event("id-1", "{}");
        let error = GraphQlResponseError::single(GraphQlError {
            error_type: ERROR_TYPE_CONDITIONAL_CHECK.to_string(),
            message: "version mismatch".to_string(),
            remote: None,
        });
        let conflict_handler = StubConflictHandler::new(Resolution::ApplyRemote);

        processor.process(&mutation_event, error, &conflict_handler).await.unwrap();

        match bus_rx.try_recv().unwrap() {
            AppEvent::ConditionalSaveFailed(e) => assert_eq!(e.model_id, "id-1"),
            other => panic!("expected ConditionalSaveFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unclassified_error_always_completes_via_error_handler() {
        let store: Arc<dyn StorageAdapter> = Arc::new(InMemoryStore::new());
        let wire: Arc<dyn WireClient> = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let error_handler = Arc::new(RecordingErrorHandler::new());
        let processor =
            MutationErrorProcessor::new(store, wire, bus, Arc::clone(&error_handler) as Arc<dyn MutationErrorHandler>);

        let mutation_event = local_update_event("id-1", "{}");
        let error = GraphQlResponseError::single(GraphQlError {
            error_type: "SomeUnknownError".to_string(),
            message: "???".to_string(),
            remote: None,
        });
        let conflict_handler = StubConflictHandler::new(Resolution::ApplyRemote);

        let result = processor.process(&mutation_event, error, &conflict_handler).await;
        assert!(result.is_ok());
        assert_eq!(error_handler.calls.lock().await.len(), 1);
    }
}
