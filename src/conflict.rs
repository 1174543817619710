// conflict.rs - Conflict Handler Interface (C2, spec.md §4.4)
//
// User-supplied callback resolving a divergence between the local mutation
// and the remote authoritative state. Called at most once per C7 invocation;
// a missing resolution stalls the mutation indefinitely, deliberately,
// because only the user can decide (spec.md §4.4).

use async_trait::async_trait;

use crate::model::Record;

/// The three outcomes a conflict handler can choose between for an
/// update-vs-update conflict.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Discard the local mutation; reconcile the store to the remote state.
    ApplyRemote,
    /// Re-send the original local mutation, now stamped with the remote's
    /// version as the expected version.
    RetryLocal,
    /// Re-send a user-supplied replacement payload instead of the original
    /// local mutation, also stamped with the remote's version.
    RetryWith(Record),
}

/// Implemented by the host application. `resolve` is invoked from whatever
/// thread C7 is running on; implementations must not block on anything that
/// depends on engine progress, since the mutation queue's dispatch loop
/// waits for this call to return before moving on to the next mutation.
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, local: Record, remote: Record) -> Resolution;
}

/// A conflict handler that always keeps the remote's state. Useful as a
/// default for hosts that have not yet implemented real merge logic, and in
/// tests that only care about the `ApplyRemote` path.
pub struct AlwaysApplyRemote;

#[async_trait]
impl ConflictHandler for AlwaysApplyRemote {
    async fn resolve(&self, _local: Record, _remote: Record) -> Resolution {
        Resolution::ApplyRemote
    }
}
