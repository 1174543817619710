// reconciliation/model_queue.rs - Model Reconciliation Queue (C3, spec.md §4.1)
//
// For a single model type, applies incoming `MutationSync` payloads to the
// local store in arrival order, with at-most-one application in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use super::{reconcile_one, IncomingEvent};
use crate::bus::AppBus;
use crate::metrics::EngineMetrics;
use crate::model::ConnectionState;
use crate::store::StorageAdapter;
use crate::wire::{Subscription, SubscriptionEvent};

/// Per-model FIFO buffer of inbound subscription payloads, draining
/// serially into the store.
pub struct ModelQueue {
    model_type: String,
    cancelled: Arc<AtomicBool>,
    started: Arc<Notify>,
    start_flag: Arc<AtomicBool>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ModelQueue {
    /// Starts subscribed but not draining: the ingest task begins buffering
    /// immediately, but nothing is applied to the store until `start()`.
    pub fn new(
        model_type: impl Into<String>,
        store: Arc<dyn StorageAdapter>,
        bus: AppBus,
        metrics: Arc<EngineMetrics>,
        subscription: Subscription,
        out_tx: mpsc::Sender<IncomingEvent>,
    ) -> Self {
        let model_type = model_type.into();
        let (events, cancel_tx) = subscription.into_parts();

        let cancelled = Arc::new(AtomicBool::new(false));
        let started = Arc::new(Notify::new());
        let start_flag = Arc::new(AtomicBool::new(false));
        let pending: Arc<Mutex<VecDeque<crate::model::MutationSync>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let drain_wake = Arc::new(Notify::new());

        spawn_ingest(
            model_type.clone(),
            events,
            cancelled.clone(),
            pending.clone(),
            drain_wake.clone(),
            out_tx.clone(),
        );
        spawn_drain(
            model_type.clone(),
            store,
            bus,
            metrics,
            cancelled.clone(),
            started.clone(),
            start_flag.clone(),
            pending,
            drain_wake,
            out_tx,
        );

        Self {
            model_type,
            cancelled,
            started,
            start_flag,
            cancel_tx: Mutex::new(Some(cancel_tx)),
        }
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    /// Begins draining; buffered events are processed FIFO before newly
    /// arrived ones (they share the same queue, so this falls out of the
    /// buffer's ordering for free).
    pub fn start(&self) {
        if !self.start_flag.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
        }
    }

    /// Drops the subscription and abandons buffered work. Idempotent.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(tx) = self.cancel_tx.lock().await.take() {
            let _ = tx.send(());
        }
        self.started.notify_one();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_ingest(
    model_type: String,
    mut events: mpsc::Receiver<SubscriptionEvent>,
    cancelled: Arc<AtomicBool>,
    pending: Arc<Mutex<VecDeque<crate::model::MutationSync>>>,
    drain_wake: Arc<Notify>,
    out_tx: mpsc::Sender<IncomingEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            match event {
                SubscriptionEvent::Connection(state) => {
                    let _ = out_tx
                        .send(IncomingEvent::Connection(model_type.clone(), state))
                        .await;
                }
                SubscriptionEvent::Data(payload) => {
                    pending.lock().await.push_back(payload);
                    drain_wake.notify_one();
                }
                SubscriptionEvent::Terminated(error) => {
                    if !cancelled.load(Ordering::SeqCst) {
                        if let Some(error) = error {
                            let _ = out_tx
                                .send(IncomingEvent::Failed(model_type.clone(), error))
                                .await;
                        } else {
                            let _ = out_tx
                                .send(IncomingEvent::Connection(
                                    model_type.clone(),
                                    ConnectionState::Disconnected,
                                ))
                                .await;
                        }
                    }
                    return;
                }
            }
        }
        // Channel closed with no explicit `Terminated` — treat the same as
        // a clean stream end unless we were already cancelled.
        if !cancelled.load(Ordering::SeqCst) {
            tracing::debug!(model_type = %model_type, "subscription stream ended without Terminated");
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn spawn_drain(
    model_type: String,
    store: Arc<dyn StorageAdapter>,
    bus: AppBus,
    metrics: Arc<EngineMetrics>,
    cancelled: Arc<AtomicBool>,
    started: Arc<Notify>,
    start_flag: Arc<AtomicBool>,
    pending: Arc<Mutex<VecDeque<crate::model::MutationSync>>>,
    drain_wake: Arc<Notify>,
    out_tx: mpsc::Sender<IncomingEvent>,
) {
    tokio::spawn(async move {
        if !start_flag.load(Ordering::SeqCst) {
            started.notified().await;
        }
        if cancelled.load(Ordering::SeqCst) {
            return;
        }

        loop {
            let next = pending.lock().await.pop_front();
            let Some(payload) = next else {
                drain_wake.notified().await;
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            };

            match reconcile_one(&store, &bus, &model_type, payload).await {
                Ok(Some(event)) => {
                    metrics.record_reconciled();
                    if out_tx
                        .send(IncomingEvent::Reconciled(event))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => {
                    metrics.record_dropped_stale();
                }
                Err(err) => {
                    tracing::warn!(model_type = %model_type, error = %err, "reconciliation failed for event, continuing");
                }
            }

            if cancelled.load(Ordering::SeqCst) {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{MutationSync, Record, SyncMetadata};
    use crate::testing::{FakeWireClient, InMemoryStore};
    use crate::wire::WireClient as _;

    fn payload(id: &str) -> MutationSync {
        MutationSync {
            record: Record {
                id: id.to_string(),
                model_type: "widget".to_string(),
                serialized_payload: "{}".to_string(),
            },
            sync_metadata: SyncMetadata {
                version: 1,
                last_changed_at: 0,
                deleted: false,
            },
        }
    }

    // S1 - buffer before start.
    #[tokio::test]
    async fn buffers_events_until_start_then_drains_in_order() {
        let store = Arc::new(InMemoryStore::new());
        let wire = Arc::new(FakeWireClient::new());
        let bus = AppBus::new();
        let metrics = Arc::new(EngineMetrics::default());
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let subscription = wire.subscribe("widget");
        let queue = ModelQueue::new(
            "widget",
            store.clone() as Arc<dyn StorageAdapter>,
            bus,
            metrics,
            subscription,
            out_tx,
        );

        wire.push_data("widget", payload("id-1")).await;
        wire.push_data("widget", payload("id-2")).await;
        wire.push_data("widget", payload("id-3")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.query_records("widget").await.unwrap().is_empty());

        queue.start();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
                .await
                .expect("event expected")
                .expect("channel open")
            {
                IncomingEvent::Reconciled(event) => seen.push(event.model_id),
                other => panic!("expected Reconciled, got a different event: {other:?}"),
            }
        }

        assert_eq!(seen, vec!["id-1", "id-2", "id-3"]);
    }
}
