// config.rs - Engine configuration
//
// Typed, validated construction inputs rather than ambient globals — the
// same shape as `AppState::new` assembling its dependencies from
// constructor arguments. `EngineConfig` carries only the knobs this core
// actually reads; model registration and collaborator wiring go through
// `EngineBuilder` (engine.rs, C9) instead of living here.

use std::time::Duration;

use crate::Error;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model type names the engine reconciles. Order is not significant —
    /// spec.md §5 guarantees no cross-model ordering — but duplicates are a
    /// configuration error.
    pub model_types: Vec<String>,
    /// Page size C6 requests per `query_sync_page` call during initial sync.
    pub initial_sync_page_size: u32,
    /// How long `stop()` waits for the in-flight mutation and subscriptions
    /// to settle before cancelling them outright. Not in spec.md's lifecycle
    /// description, which only says `stop()` "returns only after cleanup
    /// completes" — this bounds how long that can take.
    pub shutdown_grace: Duration,
    /// Path to the SQLite database backing the core-owned outgoing mutation
    /// queue (spec.md §6, "Persisted state layout").
    pub mutation_queue_db_path: String,
}

impl EngineConfig {
    pub fn new(model_types: Vec<String>, mutation_queue_db_path: impl Into<String>) -> Self {
        Self {
            model_types,
            initial_sync_page_size: 100,
            shutdown_grace: Duration::from_secs(10),
            mutation_queue_db_path: mutation_queue_db_path.into(),
        }
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.initial_sync_page_size = size;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.model_types.is_empty() {
            return Err(Error::Config("at least one model type must be registered".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for model_type in &self.model_types {
            if !seen.insert(model_type.as_str()) {
                return Err(Error::Config(format!("duplicate model type: {model_type}")));
            }
        }
        if self.initial_sync_page_size == 0 {
            return Err(Error::Config("initial_sync_page_size must be nonzero".into()));
        }
        Ok(())
    }
}
