// bus.rs - Application bus (spec.md §6, "Application bus (produced)")
//
// The host's own event bus (Amplify's `Hub` in the system this engine is
// modeled on) is a global registry in the source; spec.md §9 treats global
// registries as a design smell and asks for an explicit, constructor-passed
// service instead. Here that's a cheap `broadcast` sender the engine is
// handed at construction time and clones freely — any number of observers
// can subscribe independently of engine lifecycle.

use tokio::sync::broadcast;

use crate::model::AppEvent;

/// Capacity of the bus's internal ring buffer. A slow observer that falls
/// behind by more than this many events starts missing ones (`RecvError::Lagged`)
/// rather than back-pressuring the engine — the bus is best-effort, not a
/// queue of record.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Thin, cloneable wrapper around a `broadcast::Sender<AppEvent>`.
#[derive(Clone)]
pub struct AppBus {
    sender: broadcast::Sender<AppEvent>,
}

impl AppBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new observer. Events published before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Errors only when there are zero subscribers, which
    /// is a normal and harmless state for this bus — nothing depends on
    /// anyone listening.
    pub fn publish(&self, event: AppEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for AppBus {
    fn default() -> Self {
        Self::new()
    }
}
