// initial_sync.rs - Initial Sync Orchestrator (C6, spec.md §4.6 "InitialSyncDone")
//
// Runs once per model type at engine startup, before subscriptions start
// draining: pages through the backend's full dataset and reconciles each
// page through the same primitive a live subscription event would use, so
// a record that arrives both in a sync page and a concurrent subscription
// event is handled by the same stale-drop rule either way.

use std::sync::Arc;

use crate::bus::AppBus;
use crate::metrics::EngineMetrics;
use crate::reconciliation::reconcile_one;
use crate::store::StorageAdapter;
use crate::wire::{SyncPageRequest, WireClient};
use crate::Result;

pub struct InitialSyncOrchestrator {
    store: Arc<dyn StorageAdapter>,
    wire_client: Arc<dyn WireClient>,
    bus: AppBus,
    metrics: Arc<EngineMetrics>,
    page_size: u32,
}

impl InitialSyncOrchestrator {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        wire_client: Arc<dyn WireClient>,
        bus: AppBus,
        metrics: Arc<EngineMetrics>,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            wire_client,
            bus,
            metrics,
            page_size,
        }
    }

    /// Pages through every registered model type in order, fully draining
    /// one model before starting the next. A transport error aborts the
    /// whole run; a model that's merely empty just ends its loop on the
    /// first page with no `next_token`.
    pub async fn run(&self, model_types: &[String]) -> Result<()> {
        for model_type in model_types {
            self.sync_model(model_type).await?;
        }
        Ok(())
    }

    async fn sync_model(&self, model_type: &str) -> Result<()> {
        let mut page_token = None;
        loop {
            let request = SyncPageRequest {
                model_type: model_type.to_string(),
                page_token: page_token.clone(),
                page_size: self.page_size,
            };
            let page = self.wire_client.query_sync_page(request).await?;

            for item in page.items {
                match reconcile_one(&self.store, &self.bus, model_type, item).await {
                    Ok(Some(_)) => self.metrics.record_reconciled(),
                    Ok(None) => self.metrics.record_dropped_stale(),
                    Err(err) => {
                        tracing::warn!(model_type = %model_type, error = %err, "initial sync reconciliation failed for item, continuing");
                    }
                }
            }

            page_token = page.next_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(())
    }
}
