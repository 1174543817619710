// mutation_queue/mod.rs - Outgoing Mutation Queue (C5, spec.md §4.3)
//
// A persisted, single-writer FIFO: one row per pending local mutation, at
// most one row `in_process` at a time. The dispatch loop is the only writer,
// so claiming the head via SELECT-then-UPDATE needs no transaction — there
// is never a second task racing it for the same row.

mod migrations;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, Notify};

use crate::conflict::ConflictHandler;
use crate::error_processor::MutationErrorProcessor;
use crate::metrics::EngineMetrics;
use crate::model::{MutationEvent, MutationType};
use crate::wire::{MutateError, MutationRequest, WireClient};
use crate::{Error, Result};

pub struct OutgoingMutationQueue {
    pool: SqlitePool,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    metrics: Arc<EngineMetrics>,
}

impl OutgoingMutationQueue {
    /// Opens (creating if needed) the queue's own sqlite database, runs its
    /// migrations, and spawns the long-lived dispatch task. The task is
    /// spawned once for the life of the queue; `pause`/`start` gate it
    /// through `running` rather than killing and respawning it, so an engine
    /// restart that re-pauses and re-starts the queue doesn't drop a
    /// mutation mid-flight.
    ///
    /// Returns the queue handle and a receiver C8 drains for transport-level
    /// failures, which never reach the conflict/error-classification path.
    pub async fn connect(
        db_path: &str,
        wire_client: Arc<dyn WireClient>,
        conflict_handler: Arc<dyn ConflictHandler>,
        error_processor: Arc<MutationErrorProcessor>,
        metrics: Arc<EngineMetrics>,
    ) -> Result<(Self, mpsc::Receiver<Error>)> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite://{db_path}?mode=rwc"))
            .await?;
        migrations::run(&pool).await?;

        let running = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let (fatal_tx, fatal_rx) = mpsc::channel(8);

        spawn_dispatch(
            pool.clone(),
            running.clone(),
            wake.clone(),
            metrics.clone(),
            wire_client,
            conflict_handler,
            error_processor,
            fatal_tx,
        );

        Ok((
            Self {
                pool,
                running,
                wake,
                metrics,
            },
            fatal_rx,
        ))
    }

    /// Enqueues one local mutation. Returns once the row is durably written;
    /// the dispatch loop picks it up on its own schedule.
    pub async fn enqueue(&self, event: &MutationEvent) -> Result<()> {
        let mutation_type = match event.mutation_type {
            MutationType::Create => "create",
            MutationType::Update => "update",
            MutationType::Delete => "delete",
        };
        sqlx::query(
            r#"
            INSERT INTO outgoing_mutations
                (id, model_id, model_name, mutation_type, payload_json, created_at, in_process, version, attempt_count)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, 0)
            "#,
        )
        .bind(&event.id)
        .bind(&event.model_id)
        .bind(&event.model_name)
        .bind(mutation_type)
        .bind(&event.payload_json)
        .bind(event.created_at)
        .bind(event.version.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        self.metrics.record_enqueued();
        self.wake.notify_one();
        Ok(())
    }

    /// Begins (or resumes) dispatching. Idempotent.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Halts dispatch after the current in-flight mutation (if any)
    /// completes; does not cancel a call to `WireClient::mutate` already in
    /// progress.
    pub fn pause(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Clears `in_process` on every row, for startup crash recovery: a
    /// previous run may have claimed a row and never heard back from the
    /// wire client before the process exited.
    pub async fn clear_state_mutations(&self) -> Result<()> {
        sqlx::query("UPDATE outgoing_mutations SET in_process = 0 WHERE in_process = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn dequeue_head(pool: &SqlitePool) -> Result<Option<MutationEvent>> {
    let row = sqlx::query(
        "SELECT id, model_id, model_name, mutation_type, payload_json, created_at, version, attempt_count \
         FROM outgoing_mutations WHERE in_process = 0 ORDER BY created_at ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let id: String = row.try_get("id")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let next_attempt = attempt_count + 1;

    sqlx::query("UPDATE outgoing_mutations SET in_process = 1, attempt_count = ? WHERE id = ?")
        .bind(next_attempt)
        .bind(&id)
        .execute(pool)
        .await?;

    let mutation_type = match row.try_get::<String, _>("mutation_type")?.as_str() {
        "create" => MutationType::Create,
        "update" => MutationType::Update,
        "delete" => MutationType::Delete,
        other => return Err(Error::Invariant(format!("unknown mutation_type {other} in queue"))),
    };

    Ok(Some(MutationEvent {
        id,
        model_id: row.try_get("model_id")?,
        model_name: row.try_get("model_name")?,
        mutation_type,
        payload_json: row.try_get("payload_json")?,
        created_at: row.try_get("created_at")?,
        in_process: true,
        version: row.try_get::<Option<i64>, _>("version")?.map(|v| v as u64),
        attempt_count: next_attempt as u32,
    }))
}

async fn mark_processed(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM outgoing_mutations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_dispatch(
    pool: SqlitePool,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    metrics: Arc<EngineMetrics>,
    wire_client: Arc<dyn WireClient>,
    conflict_handler: Arc<dyn ConflictHandler>,
    error_processor: Arc<MutationErrorProcessor>,
    fatal_tx: mpsc::Sender<Error>,
) {
    tokio::spawn(async move {
        loop {
            if !running.load(Ordering::SeqCst) {
                wake.notified().await;
                continue;
            }

            let next = match dequeue_head(&pool).await {
                Ok(next) => next,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read outgoing mutation queue, retrying shortly");
                    wake.notified().await;
                    continue;
                }
            };

            let Some(event) = next else {
                wake.notified().await;
                continue;
            };

            let request = MutationRequest {
                mutation_event: event.clone(),
                expected_version: event.version,
            };

            match wire_client.mutate(request).await {
                Ok(_) => {
                    metrics.record_dispatched();
                    if let Err(err) = mark_processed(&pool, &event.id).await {
                        tracing::error!(error = %err, mutation_id = %event.id, "failed to remove dispatched mutation from queue");
                    }
                }
                Err(MutateError::Response(response)) => {
                    metrics.record_mutation_failed();
                    if let Err(err) = error_processor
                        .process(&event, response, conflict_handler.as_ref())
                        .await
                    {
                        tracing::warn!(error = %err, mutation_id = %event.id, "mutation error processing failed");
                    }
                    // Classified and handled (or deliberately dropped); the
                    // original attempt is done either way.
                    if let Err(err) = mark_processed(&pool, &event.id).await {
                        tracing::error!(error = %err, mutation_id = %event.id, "failed to remove processed mutation from queue");
                    }
                }
                Err(MutateError::Transport(error)) => {
                    metrics.record_mutation_failed();
                    // Leave the row `in_process`; a restart's
                    // `clear_state_mutations` will make it eligible again.
                    // Transport failures bypass C7 entirely (spec.md §7).
                    if fatal_tx.send(error).await.is_err() {
                        return;
                    }
                    running.store(false, Ordering::SeqCst);
                }
            }
        }
    });
}
