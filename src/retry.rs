// retry.rs - Retry Policy (C1, spec.md §4 table row C1)
//
// Given an error and an attempt count, return an Advice{retry, delay}. C8
// consults this only at the whole-engine granularity (spec.md §4.6): there
// is no partial restart, so one Advice decides whether the entire run
// restarts from `StorageReady` or terminates.

use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Whether to retry, and after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advice {
    pub retry: bool,
    pub delay: Duration,
}

impl Advice {
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            retry: true,
            delay,
        }
    }

    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// User- or host-supplied retry policy. The default implementation
/// (`ExponentialBackoff`) is a concrete, swappable instance supplementing
/// spec.md, which specifies only the contract.
pub trait RetryPolicy: Send + Sync {
    fn advise(&self, error: &Error, attempt: u32) -> Advice;
}

/// Exponential backoff with full jitter and a hard attempt ceiling, in the
/// same enumerate-and-cap shape as the teacher's own sync queue (pending
/// operations stop retrying once `retry_count >= 5`).
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn advise(&self, error: &Error, attempt: u32) -> Advice {
        if matches!(error, Error::TransportFatal(_) | Error::Invariant(_)) {
            return Advice::give_up();
        }
        if error.is_cancelled() {
            return Advice::give_up();
        }
        if attempt >= self.max_attempts {
            return Advice::give_up();
        }

        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max);
        let jittered = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
        Advice::retry_after(Duration::from_millis(jittered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_on_fatal_transport_error() {
        let policy = ExponentialBackoff::default();
        let advice = policy.advise(&Error::TransportFatal("boom".into()), 0);
        assert!(!advice.retry);
    }

    #[test]
    fn gives_up_past_max_attempts() {
        let policy = ExponentialBackoff::default();
        let advice = policy.advise(&Error::TransportRetryable("timeout".into()), 8);
        assert!(!advice.retry);
    }

    #[test]
    fn retries_within_budget() {
        let policy = ExponentialBackoff::default();
        let advice = policy.advise(&Error::TransportRetryable("timeout".into()), 0);
        assert!(advice.retry);
        assert!(advice.delay <= policy.max);
    }

    #[test]
    fn never_retries_cancellation() {
        let policy = ExponentialBackoff::default();
        let advice = policy.advise(&Error::Cancelled, 0);
        assert!(!advice.retry);
    }
}
