//! Queue-time statistics used to rebalance load between nodes.
//!
//! Pure functions; the dispatcher owns the samples and decides when to
//! call them.

/// Samples needed before an average queue time is meaningful.
pub const MIN_SAMPLES_FOR_AVERAGE: usize = 2;

/// Average of the recorded queue-time samples in milliseconds.
///
/// Returns `None` until at least [`MIN_SAMPLES_FOR_AVERAGE`] samples
/// exist; a single scan says nothing about a node's queue.
pub fn average_queue_time(samples: &[u64]) -> Option<u64> {
    if samples.len() < MIN_SAMPLES_FOR_AVERAGE {
        return None;
    }
    let total: u128 = samples.iter().map(|&s| u128::from(s)).sum();
    Some((total / samples.len() as u128) as u64)
}

/// Advisory rebalance rule: move only when the active node is slower
/// than the candidate was last time it was measured.
pub fn should_switch(active_average_ms: u64, candidate_average_ms: u64) -> bool {
    active_average_ms > candidate_average_ms
}
