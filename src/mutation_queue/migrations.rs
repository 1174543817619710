// mutation_queue/migrations.rs - Schema for the core-owned outgoing mutation queue
//
// Same numbered, idempotent-migration shape as a typical sqlx-backed app
// schema: a `_migrations` ledger table, each step guarded by its id so
// re-running on an already-migrated database is a no-op.

use sqlx::SqlitePool;

use crate::Result;

pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    run_if_needed(pool, 1, "create_outgoing_mutations_table").await?;

    Ok(())
}

async fn run_if_needed(pool: &SqlitePool, id: i64, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("running mutation queue migration {}: {}", id, name);
        match id {
            1 => create_outgoing_mutations_table(pool).await?,
            _ => unreachable!("unknown migration id {id}"),
        }
        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;
    }

    Ok(())
}

async fn create_outgoing_mutations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outgoing_mutations (
            id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            mutation_type TEXT NOT NULL CHECK(mutation_type IN ('create', 'update', 'delete')),
            payload_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            in_process INTEGER NOT NULL DEFAULT 0,
            version INTEGER,
            attempt_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outgoing_mutations_created_at ON outgoing_mutations(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
