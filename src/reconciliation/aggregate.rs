// reconciliation/aggregate.rs - Incoming Event Reconciliation Queue (C4, spec.md §4.2)
//
// Lifts N per-model C3 instances into one cohesive stream, gated on
// aggregate readiness. The per-model connection map is guarded by a single
// `tokio::sync::Mutex` acting as the "single serializing queue with
// maxConcurrency=1" spec.md §5 calls for: every transition observed through
// it is race-free, so two simultaneous `Connected` transitions cannot both
// observe "last one in".

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::ModelQueue;
use crate::bus::AppBus;
use crate::metrics::EngineMetrics;
use crate::model::{ConnectionState, MutationEvent};
use crate::store::StorageAdapter;
use crate::wire::WireClient;
use crate::Error;

/// Internal message from a `ModelQueue` to its owning `IncomingEventQueue`.
#[derive(Debug)]
pub(crate) enum IncomingEvent {
    Connection(String, ConnectionState),
    Reconciled(MutationEvent),
    Failed(String, Error),
}

/// C4's external output: `Initialized` exactly once, then one
/// `MutationEvent` per reconciled record.
#[derive(Debug, Clone)]
pub enum AggregateEvent {
    Initialized,
    MutationEvent(MutationEvent),
}

pub struct IncomingEventQueue {
    queues: HashMap<String, ModelQueue>,
    connection_state: Arc<Mutex<HashMap<String, ConnectionState>>>,
}

impl IncomingEventQueue {
    /// Creates and wires one C3 per registered model type, opening a
    /// subscription for each through `wire_client`. Returns the queue handle
    /// together with the receiver C8 drives itself from (`Result` so a
    /// child failure completes the stream with the error, per spec.md's
    /// "If any child transitions to Failed, C4 completes its publisher with
    /// that failure").
    pub fn new(
        model_types: &[String],
        store: Arc<dyn StorageAdapter>,
        wire_client: Arc<dyn WireClient>,
        bus: AppBus,
        metrics: Arc<EngineMetrics>,
    ) -> (Self, mpsc::Receiver<Result<AggregateEvent, Error>>) {
        let (internal_tx, internal_rx) = mpsc::channel(256);
        let connection_state = Arc::new(Mutex::new(
            model_types
                .iter()
                .map(|m| (m.clone(), ConnectionState::Disconnected))
                .collect::<HashMap<_, _>>(),
        ));

        let mut queues = HashMap::new();
        for model_type in model_types {
            let subscription = wire_client.subscribe(model_type);
            let queue = ModelQueue::new(
                model_type.clone(),
                store.clone(),
                bus.clone(),
                metrics.clone(),
                subscription,
                internal_tx.clone(),
            );
            queues.insert(model_type.clone(), queue);
        }

        let (out_tx, out_rx) = mpsc::channel(256);
        spawn_aggregator(internal_rx, connection_state.clone(), out_tx);

        (
            Self {
                queues,
                connection_state,
            },
            out_rx,
        )
    }

    /// Invokes `start()` on every child queue.
    pub fn start(&self) {
        for queue in self.queues.values() {
            queue.start();
        }
    }

    /// Cancels every child queue.
    pub async fn cancel(&self) {
        for queue in self.queues.values() {
            queue.cancel().await;
        }
    }

    pub async fn connection_state(&self, model_type: &str) -> Option<ConnectionState> {
        self.connection_state.lock().await.get(model_type).copied()
    }
}

fn spawn_aggregator(
    mut internal_rx: mpsc::Receiver<IncomingEvent>,
    connection_state: Arc<Mutex<HashMap<String, ConnectionState>>>,
    out_tx: mpsc::Sender<Result<AggregateEvent, Error>>,
) {
    tokio::spawn(async move {
        let mut initialized = false;

        while let Some(event) = internal_rx.recv().await {
            match event {
                IncomingEvent::Reconciled(mutation_event) => {
                    if out_tx
                        .send(Ok(AggregateEvent::MutationEvent(mutation_event)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                IncomingEvent::Failed(model_type, error) => {
                    let mut state = connection_state.lock().await;
                    state.insert(model_type, ConnectionState::Failed);
                    drop(state);
                    let _ = out_tx.send(Err(error)).await;
                    return;
                }
                IncomingEvent::Connection(model_type, new_state) => {
                    // Single-writer serialization: the lock guards read
                    // (all-connected check) and write together, so two
                    // concurrent last-one-in transitions cannot both see
                    // "all connected".
                    let mut state = connection_state.lock().await;
                    state.insert(model_type, new_state);

                    if new_state == ConnectionState::Failed {
                        drop(state);
                        let _ = out_tx
                            .send(Err(Error::TransportFatal(
                                "subscription connection failed".into(),
                            )))
                            .await;
                        return;
                    }

                    if !initialized
                        && !state.is_empty()
                        && state.values().all(|s| *s == ConnectionState::Connected)
                    {
                        initialized = true;
                        drop(state);
                        if out_tx.send(Ok(AggregateEvent::Initialized)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
}
