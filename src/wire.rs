// wire.rs - Wire client contract (spec.md §6, "Wire client (consumed)")
//
// The source listener callbacks (`(event) -> void`) are re-expressed here as
// a typed channel: the producer is the subscribe operation, the consumer is
// a single driver task per subscription (design note in spec.md §9). This
// makes cancellation and back-pressure explicit instead of implicit in a
// callback's lifetime.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::{ConnectionState, MutationSync};
use crate::{Error, Result};

/// One event on a subscription stream: a connection-state transition, a
/// reconciled remote payload, or the stream's terminal completion. A wire
/// client sends `Terminated` (with `Some(error)` for a real failure, `None`
/// for a cooperative close) as its last message before the channel closes;
/// the driver task treats a channel close with no prior `Terminated` the
/// same as `Terminated(None)`.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Connection(ConnectionState),
    Data(MutationSync),
    Terminated(Option<Error>),
}

/// A long-lived subscription handle. Dropping it without calling `cancel`
/// still tears down the underlying stream (the receiver going away is
/// itself a cancellation signal to a well-behaved wire client), but `cancel`
/// lets the driver observe an explicit `Cancelled` outcome instead of a
/// channel-closed race.
pub struct Subscription {
    pub events: mpsc::Receiver<SubscriptionEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<SubscriptionEvent>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Cancellation is idempotent: cancelling an already-cancelled
    /// subscription is a no-op rather than a panic.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Split into the receiver half and a standalone cancel handle, for
    /// callers that hand the receiver to one task and keep the cancel
    /// handle for themselves (C3's ingest task does exactly this).
    pub fn into_parts(mut self) -> (mpsc::Receiver<SubscriptionEvent>, oneshot::Sender<()>) {
        let cancel_tx = self.cancel_tx.take().expect("subscription cancelled twice");
        (self.events, cancel_tx)
    }
}

/// A single GraphQL-style error tag attached to a mutation response. The
/// wire-client layer surfaces these as opaque strings (spec.md §9's design
/// note on conditional-save classification); C7 matches on the well-known
/// tags and otherwise treats the error as unclassified.
#[derive(Debug, Clone)]
pub struct GraphQlError {
    pub error_type: String,
    pub message: String,
    /// The server's authoritative state at the time of the error, attached
    /// only for `ConflictUnhandled`.
    pub remote: Option<MutationSync>,
}

pub const ERROR_TYPE_CONDITIONAL_CHECK: &str = "ConditionalCheck";
pub const ERROR_TYPE_CONFLICT_UNHANDLED: &str = "ConflictUnhandled";

/// A mutation response error. Classification in C7 first asks whether this
/// is a *single*-error response — multi-error responses are, per spec.md
/// §4.4 rule 1, not actionable here.
#[derive(Debug, Clone, Default)]
pub struct GraphQlResponseError {
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResponseError {
    pub fn single(error: GraphQlError) -> Self {
        Self {
            errors: vec![error],
        }
    }

    pub fn single_error(&self) -> Option<&GraphQlError> {
        match self.errors.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

/// A request to upload one local mutation, with the version the server
/// should check the record against (the original version for a first
/// attempt, or the remote's version when C7 resolves a conflict by retrying).
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub mutation_event: crate::model::MutationEvent,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SyncPageRequest {
    pub model_type: String,
    pub page_token: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
pub struct SyncPage {
    pub items: Vec<MutationSync>,
    pub next_token: Option<String>,
}

/// The two ways a `mutate` call can fail: a GraphQL-level application error
/// (routed to C7 for classification) or a transport-level failure (routed
/// straight to C8 as a terminal/retryable error, per spec.md §7's error
/// table — transport errors never go through C7).
#[derive(Debug, Clone)]
pub enum MutateError {
    Response(GraphQlResponseError),
    Transport(Error),
}

/// Wire client consumed by C3/C4 (subscribe), C5/C7 (mutate), and C6 (query).
#[async_trait]
pub trait WireClient: Send + Sync {
    /// Open a long-lived subscription for one model type.
    fn subscribe(&self, model_type: &str) -> Subscription;

    /// Upload one local mutation. `Ok` means the server accepted it; `Err`
    /// distinguishes a classifiable application error from a transport
    /// failure.
    async fn mutate(&self, request: MutationRequest) -> std::result::Result<MutationSync, MutateError>;

    /// Fetch one page of the initial-sync query for a model type.
    async fn query_sync_page(&self, request: SyncPageRequest) -> Result<SyncPage>;
}
