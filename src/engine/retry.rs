//! Retry backoff computation

use std::time::Duration;

use crate::workflow::RetryPolicy;

/// Base delay for the exponential policy
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Upper bound so a deep retry budget cannot stall the run
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before a failed task re-enters the ready queue.
///
/// `retry_count` is the attempt being scheduled (1 for the first retry).
pub fn backoff(policy: RetryPolicy, retry_count: u32) -> Duration {
    match policy {
        RetryPolicy::Immediate => Duration::ZERO,
        RetryPolicy::Exponential => {
            let factor = 2u32.saturating_pow(retry_count.saturating_sub(1));
            BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
        }
    }
}
