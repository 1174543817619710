// engine.rs - Remote Sync Engine (C8) and its builder (C9), spec.md §4.6
//
// The top-level state machine. A single driver task owns `EngineState` and
// drives the named-transition sequence in spec.md §4.6; external observers
// only ever see it through `subscribe()`'s broadcast receiver — the driver
// does not consume its own publisher (spec.md §9's note on the source's
// self-consuming publisher anti-pattern).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, oneshot, Mutex};

use crate::bus::AppBus;
use crate::conflict::{AlwaysApplyRemote, ConflictHandler};
use crate::config::EngineConfig;
use crate::error_processor::{LoggingErrorHandler, MutationErrorHandler, MutationErrorProcessor};
use crate::initial_sync::InitialSyncOrchestrator;
use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use crate::model::{EngineEvent, EngineState, MutationEvent};
use crate::mutation_queue::OutgoingMutationQueue;
use crate::reconciliation::{AggregateEvent, IncomingEventQueue};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::store::StorageAdapter;
use crate::wire::WireClient;
use crate::{Error, Result};

const ENGINE_EVENT_BUS_CAPACITY: usize = 256;

/// Assembles C1–C8 from host-supplied collaborators and config, the way
/// `AppState::new` assembles its own dependencies from constructor
/// arguments rather than ambient globals (spec.md §9's note on global
/// registries).
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn StorageAdapter>>,
    wire_client: Option<Arc<dyn WireClient>>,
    conflict_handler: Arc<dyn ConflictHandler>,
    error_handler: Arc<dyn MutationErrorHandler>,
    retry_policy: Arc<dyn RetryPolicy>,
    bus: AppBus,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            wire_client: None,
            conflict_handler: Arc::new(AlwaysApplyRemote),
            error_handler: Arc::new(LoggingErrorHandler),
            retry_policy: Arc::new(ExponentialBackoff::default()),
            bus: AppBus::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn StorageAdapter>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn wire_client(mut self, wire_client: Arc<dyn WireClient>) -> Self {
        self.wire_client = Some(wire_client);
        self
    }

    pub fn conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = handler;
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn MutationErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn bus(mut self, bus: AppBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn build(self) -> Result<RemoteSyncEngine> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| Error::Config("EngineBuilder requires a store adapter".into()))?;
        let wire_client = self
            .wire_client
            .ok_or_else(|| Error::Config("EngineBuilder requires a wire client".into()))?;

        let (events_tx, _) = broadcast::channel(ENGINE_EVENT_BUS_CAPACITY);

        Ok(RemoteSyncEngine {
            config: self.config,
            store,
            wire_client,
            bus: self.bus,
            metrics: Arc::new(EngineMetrics::default()),
            retry_policy: self.retry_policy,
            conflict_handler: self.conflict_handler,
            error_handler: self.error_handler,
            state: Arc::new(StdMutex::new(EngineState::NotStarted)),
            events_tx,
            running: Arc::new(AtomicBool::new(false)),
            active_mutation_queue: Arc::new(Mutex::new(None)),
            driver: Mutex::new(None),
        })
    }
}

struct DriverHandle {
    stop_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

pub struct RemoteSyncEngine {
    config: EngineConfig,
    store: Arc<dyn StorageAdapter>,
    wire_client: Arc<dyn WireClient>,
    bus: AppBus,
    metrics: Arc<EngineMetrics>,
    retry_policy: Arc<dyn RetryPolicy>,
    conflict_handler: Arc<dyn ConflictHandler>,
    error_handler: Arc<dyn MutationErrorHandler>,
    state: Arc<StdMutex<EngineState>>,
    events_tx: broadcast::Sender<EngineEvent>,
    running: Arc<AtomicBool>,
    active_mutation_queue: Arc<Mutex<Option<Arc<OutgoingMutationQueue>>>>,
    driver: Mutex<Option<DriverHandle>>,
}

impl RemoteSyncEngine {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    pub fn bus(&self) -> AppBus {
        self.bus.clone()
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().expect("engine state mutex poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues one local mutation for upload. Returns `Err(Invariant)` if the
    /// engine is not currently in a state that owns a mutation queue (not
    /// started, or mid-restart between cleanup and the next attempt).
    pub async fn enqueue(&self, event: MutationEvent) -> Result<()> {
        let guard = self.active_mutation_queue.lock().await;
        match guard.as_ref() {
            Some(queue) => queue.enqueue(&event).await,
            None => Err(Error::Invariant(
                "no active mutation queue; engine is not running".into(),
            )),
        }
    }

    /// Spawns the driver task if one is not already running. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        self.running.store(true, Ordering::SeqCst);
        let engine = self.clone();
        let join = tokio::spawn(async move {
            engine.run(stop_rx).await;
        });

        *driver = Some(DriverHandle { stop_tx, join });
        Ok(())
    }

    /// Signals the driver to move through `CleaningUpForTermination` to
    /// `Terminated`, and waits for it to finish — bounded by
    /// `EngineConfig::shutdown_grace`. Past the grace period the driver task
    /// is abandoned (it still runs to completion in the background; this
    /// call just stops waiting).
    pub async fn stop(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        let Some(handle) = driver.take() else {
            return Ok(());
        };

        self.running.store(false, Ordering::SeqCst);
        let _ = handle.stop_tx.send(());

        match tokio::time::timeout(self.config.shutdown_grace, handle.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_err)) => Err(Error::Invariant(format!("engine driver task panicked: {join_err}"))),
            Err(_) => Err(Error::Cancelled),
        }
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().expect("engine state mutex poisoned") = state;
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn run(self: Arc<Self>, mut stop_rx: oneshot::Receiver<()>) {
        let mut attempt: u32 = 0;

        'outer: loop {
            self.set_state(EngineState::StorageReady);
            self.emit(EngineEvent::StorageReady);

            let (incoming_queue, mut aggregate_rx) = IncomingEventQueue::new(
                &self.config.model_types,
                self.store.clone(),
                self.wire_client.clone(),
                self.bus.clone(),
                self.metrics.clone(),
            );
            self.set_state(EngineState::SubscriptionsPaused);
            self.emit(EngineEvent::SubscriptionsPaused);

            let error_processor = Arc::new(MutationErrorProcessor::new(
                self.store.clone(),
                self.wire_client.clone(),
                self.bus.clone(),
                self.error_handler.clone(),
            ));

            self.set_state(EngineState::MutationsPaused);
            self.emit(EngineEvent::MutationsPaused);

            let (mutation_queue, mut fatal_rx) = match OutgoingMutationQueue::connect(
                &self.config.mutation_queue_db_path,
                self.wire_client.clone(),
                self.conflict_handler.clone(),
                error_processor,
                self.metrics.clone(),
            )
            .await
            {
                Ok(v) => v,
                Err(err) => {
                    if self.handle_terminal(err, &mut attempt).await {
                        continue 'outer;
                    }
                    return;
                }
            };
            let mutation_queue = Arc::new(mutation_queue);
            *self.active_mutation_queue.lock().await = Some(mutation_queue.clone());

            if let Err(err) = mutation_queue.clear_state_mutations().await {
                if self.handle_terminal(err, &mut attempt).await {
                    continue 'outer;
                }
                return;
            }
            self.set_state(EngineState::ClearedMutationState);
            self.emit(EngineEvent::ClearedStateOutgoingMutations);

            incoming_queue.start();

            // Drain until the aggregate stream reports Initialized, forwarding
            // any mutation events that happen to arrive first (one model can
            // start producing before every model has connected).
            let mut terminal: Option<Error> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        incoming_queue.cancel().await;
                        mutation_queue.pause();
                        self.finish_stop().await;
                        return;
                    }
                    next = aggregate_rx.recv() => match next {
                        Some(Ok(AggregateEvent::Initialized)) => break,
                        Some(Ok(AggregateEvent::MutationEvent(ev))) => self.emit(EngineEvent::MutationEvent(ev)),
                        Some(Err(err)) => { terminal = Some(err); break; }
                        None => { terminal = Some(Error::Invariant("aggregate stream closed before Initialized".into())); break; }
                    },
                }
            }
            if let Some(err) = terminal {
                incoming_queue.cancel().await;
                mutation_queue.pause();
                if self.handle_terminal(err, &mut attempt).await {
                    continue 'outer;
                }
                return;
            }
            self.set_state(EngineState::SubscriptionsInitialized);
            self.emit(EngineEvent::SubscriptionsInitialized);

            let orchestrator = InitialSyncOrchestrator::new(
                self.store.clone(),
                self.wire_client.clone(),
                self.bus.clone(),
                self.metrics.clone(),
                self.config.initial_sync_page_size,
            );
            if let Err(err) = orchestrator.run(&self.config.model_types).await {
                incoming_queue.cancel().await;
                mutation_queue.pause();
                if self.handle_terminal(err, &mut attempt).await {
                    continue 'outer;
                }
                return;
            }
            self.set_state(EngineState::InitialSyncDone);
            self.emit(EngineEvent::PerformedInitialSync);

            self.set_state(EngineState::SubscriptionsActivated);
            self.emit(EngineEvent::SubscriptionsActivated);

            mutation_queue.start();
            self.set_state(EngineState::MutationQueueStarted);
            self.emit(EngineEvent::MutationQueueStarted);

            self.set_state(EngineState::Syncing);
            self.emit(EngineEvent::SyncStarted);

            let mut terminal: Option<Error> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        incoming_queue.cancel().await;
                        mutation_queue.pause();
                        self.finish_stop().await;
                        return;
                    }
                    next = aggregate_rx.recv() => match next {
                        Some(Ok(AggregateEvent::MutationEvent(ev))) => self.emit(EngineEvent::MutationEvent(ev)),
                        Some(Ok(AggregateEvent::Initialized)) => {}
                        Some(Err(err)) => { terminal = Some(err); break; }
                        None => { terminal = Some(Error::Invariant("aggregate stream closed".into())); break; }
                    },
                    fatal = fatal_rx.recv() => match fatal {
                        Some(err) => { terminal = Some(err); break; }
                        None => {}
                    },
                }
            }

            incoming_queue.cancel().await;
            mutation_queue.pause();
            *self.active_mutation_queue.lock().await = None;

            let err = terminal.unwrap_or(Error::Invariant("engine loop exited without a terminal error".into()));
            if self.handle_terminal(err, &mut attempt).await {
                continue 'outer;
            }
            return;
        }
    }

    /// Runs `CleaningUp ⇒ CleanedUp`, consults the retry policy, and either
    /// schedules a restart (returns `true`) or terminates (returns `false`).
    async fn handle_terminal(&self, err: Error, attempt: &mut u32) -> bool {
        self.set_state(EngineState::CleaningUp);
        self.emit(EngineEvent::CleaningUp);
        *self.active_mutation_queue.lock().await = None;

        self.set_state(EngineState::CleanedUp);
        self.emit(EngineEvent::CleanedUp);
        self.metrics.record_error_now(chrono::Utc::now().timestamp());

        let advice = self.retry_policy.advise(&err, *attempt);
        if advice.retry {
            *attempt += 1;
            self.metrics.record_restart();
            tokio::time::sleep(advice.delay).await;
            true
        } else {
            self.set_state(EngineState::Terminated);
            self.emit(EngineEvent::Failed(err));
            self.emit(EngineEvent::Terminated);
            false
        }
    }

    async fn finish_stop(&self) {
        *self.active_mutation_queue.lock().await = None;
        self.set_state(EngineState::CleaningUpForTermination);
        self.emit(EngineEvent::CleaningUp);
        self.set_state(EngineState::Terminated);
        self.emit(EngineEvent::CleanedUp);
        self.emit(EngineEvent::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::model::ConnectionState;
    use crate::retry::Advice;
    use crate::testing::{FakeWireClient, InMemoryStore};
    use crate::wire::{MutateError, MutationRequest, Subscription, SyncPage, SyncPageRequest};

    fn temp_db_path(label: &str) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, AtomicOrdering::SeqCst);
        std::env::temp_dir()
            .join(format!("reconcile_engine_{label}_{}_{}.db", std::process::id(), n))
            .to_string_lossy()
            .into_owned()
    }

    /// Maps an `EngineEvent` to a stable tag for sequence assertions,
    /// ignoring the payload carried by `MutationEvent`/`Failed`.
    fn tag(event: &EngineEvent) -> &'static str {
        match event {
            EngineEvent::StorageReady => "StorageReady",
            EngineEvent::SubscriptionsPaused => "SubscriptionsPaused",
            EngineEvent::MutationsPaused => "MutationsPaused",
            EngineEvent::ClearedStateOutgoingMutations => "ClearedStateOutgoingMutations",
            EngineEvent::SubscriptionsInitialized => "SubscriptionsInitialized",
            EngineEvent::PerformedInitialSync => "PerformedInitialSync",
            EngineEvent::SubscriptionsActivated => "SubscriptionsActivated",
            EngineEvent::MutationQueueStarted => "MutationQueueStarted",
            EngineEvent::SyncStarted => "SyncStarted",
            EngineEvent::CleaningUp => "CleaningUp",
            EngineEvent::CleanedUp => "CleanedUp",
            EngineEvent::Terminated => "Terminated",
            EngineEvent::MutationEvent(_) => "MutationEvent",
            EngineEvent::Failed(_) => "Failed",
        }
    }

    /// Repeatedly pushes a `Connected` transition for `model_type` until the
    /// subscription has actually been registered with the fake wire client
    /// (it races the driver task's own startup), then stops.
    fn connect_eventually(wire: Arc<FakeWireClient>, model_type: &'static str) {
        tokio::spawn(async move {
            for _ in 0..100 {
                wire.push_connection(model_type, ConnectionState::Connected).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
    }

    async fn next_tags(
        rx: &mut broadcast::Receiver<EngineEvent>,
        until: &str,
        timeout: Duration,
    ) -> Vec<&'static str> {
        let mut tags = Vec::new();
        loop {
            let event = tokio::time::timeout(timeout, rx.recv())
                .await
                .expect("engine event expected before timeout")
                .expect("engine event channel open");
            let t = tag(&event);
            tags.push(t);
            if t == until {
                return tags;
            }
        }
    }

    // S4 - engine happy path.
    #[tokio::test]
    async fn happy_path_emits_exact_event_sequence() {
        let wire = Arc::new(FakeWireClient::new());
        let store = Arc::new(InMemoryStore::new());
        let config = EngineConfig::new(vec!["widget".to_string()], temp_db_path("s4"));
        let engine = Arc::new(
            EngineBuilder::new(config)
                .store(store)
                .wire_client(wire.clone())
                .build()
                .unwrap(),
        );

        let mut rx = engine.subscribe();
        connect_eventually(wire, "widget");
        engine.start().await.unwrap();

        let tags = next_tags(&mut rx, "SyncStarted", Duration::from_secs(5)).await;
        assert_eq!(
            tags,
            vec![
                "StorageReady",
                "SubscriptionsPaused",
                "MutationsPaused",
                "ClearedStateOutgoingMutations",
                "SubscriptionsInitialized",
                "PerformedInitialSync",
                "SubscriptionsActivated",
                "MutationQueueStarted",
                "SyncStarted",
            ]
        );

        engine.stop().await.unwrap();
    }

    /// Wire client that always fails the initial-sync page query; subscribe
    /// and mutate delegate to a wrapped `FakeWireClient`.
    struct FailingSyncWireClient {
        inner: Arc<FakeWireClient>,
    }

    #[async_trait]
    impl WireClient for FailingSyncWireClient {
        fn subscribe(&self, model_type: &str) -> Subscription {
            self.inner.subscribe(model_type)
        }

        async fn mutate(
            &self,
            request: MutationRequest,
        ) -> std::result::Result<crate::model::MutationSync, MutateError> {
            self.inner.mutate(request).await
        }

        async fn query_sync_page(&self, _request: SyncPageRequest) -> Result<SyncPage> {
            Err(Error::TransportRetryable("sync page fetch failed".into()))
        }
    }

    struct NeverRetry;

    impl RetryPolicy for NeverRetry {
        fn advise(&self, _error: &Error, _attempt: u32) -> Advice {
            Advice::give_up()
        }
    }

    // S5 - initial-sync failure, no retry.
    #[tokio::test]
    async fn initial_sync_failure_with_no_retry_terminates_without_performed_sync() {
        let inner_wire = Arc::new(FakeWireClient::new());
        let wire = Arc::new(FailingSyncWireClient {
            inner: inner_wire.clone(),
        });
        let store = Arc::new(InMemoryStore::new());
        let config = EngineConfig::new(vec!["widget".to_string()], temp_db_path("s5"));
        let engine = Arc::new(
            EngineBuilder::new(config)
                .store(store)
                .wire_client(wire)
                .retry_policy(Arc::new(NeverRetry))
                .build()
                .unwrap(),
        );

        let mut rx = engine.subscribe();
        connect_eventually(inner_wire, "widget");
        engine.start().await.unwrap();

        let tags = next_tags(&mut rx, "Terminated", Duration::from_secs(5)).await;
        assert_eq!(
            tags,
            vec![
                "StorageReady",
                "SubscriptionsPaused",
                "MutationsPaused",
                "ClearedStateOutgoingMutations",
                "SubscriptionsInitialized",
                "CleaningUp",
                "CleanedUp",
                "Failed",
                "Terminated",
            ]
        );
    }
}
