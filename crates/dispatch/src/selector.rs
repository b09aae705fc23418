//! Active-node selection and rebalancing.
//!
//! Three triggers change the active node:
//!
//! - **startup** picks a node uniformly at random;
//! - **forced** rebalance always rotates to another random node (after a
//!   node error, or once the dwell time reaches the maximum);
//! - **advisory** rebalance, once the dwell time reaches the minimum,
//!   rotates only if the active node's average queue time is worse than
//!   the candidate's last recorded one.
//!
//! All methods are synchronous and operate on a locked [`SessionState`];
//! randomness and the current time are passed in so decisions can be
//! tested deterministically.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use rand::Rng;

use scanfleet_core::load::should_switch;

use crate::session::SessionState;

/// Why a forced rebalance happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceReason {
    /// A submit or poll against the node failed.
    NodeError,
    /// The node has no active engine even after a refresh.
    CapabilityLost,
    /// The node has been active for the maximum dwell time.
    MaxDwell,
}

impl RebalanceReason {
    /// Failures must not leave a stale "good" average behind.
    pub fn resets_average(self) -> bool {
        matches!(self, Self::NodeError | Self::CapabilityLost)
    }
}

/// Result of a rebalance attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// The active node changed.
    Rotated { from: String, to: String },
    /// The active node stayed; its statistics and dwell clock were reset.
    Kept { node: String },
    /// Only one node is configured; nothing was changed.
    SingleNode { node: String },
    /// The node being rotated away from is no longer active; a concurrent
    /// caller already handled it.
    Stale { active: Option<String> },
}

/// Dwell-time policy for the active node.
#[derive(Debug, Clone, Copy)]
pub struct NodeSelector {
    min_node_time: Duration,
    max_node_time: Duration,
}

impl NodeSelector {
    pub fn new(min_node_time: Duration, max_node_time: Duration) -> Self {
        Self {
            min_node_time,
            max_node_time,
        }
    }

    /// Pick a random node among those not in `exclude` and make it active.
    ///
    /// When every node is excluded the whole set is eligible again.
    pub fn pick_initial<R: Rng + ?Sized>(
        &self,
        state: &mut SessionState,
        exclude: &BTreeSet<String>,
        now: Instant,
        rng: &mut R,
    ) -> Option<String> {
        let all: Vec<&str> = state.registry.addresses().collect();
        let eligible: Vec<&str> = all
            .iter()
            .copied()
            .filter(|a| !exclude.contains(*a))
            .collect();
        let pool = if eligible.is_empty() { &all } else { &eligible };

        let chosen = pool.choose(rng)?.to_string();
        state.activate(&chosen, now);
        Some(chosen)
    }

    /// Rotate away from `from` to a random other node.
    ///
    /// Nodes in `avoid` are skipped while any other candidate remains.
    /// The outgoing node's average is recorded from its samples, or reset
    /// to zero when `reason` is a failure; its samples are then cleared.
    pub fn force_rebalance<R: Rng + ?Sized>(
        &self,
        state: &mut SessionState,
        from: &str,
        reason: RebalanceReason,
        avoid: &BTreeSet<String>,
        now: Instant,
        rng: &mut R,
    ) -> RebalanceOutcome {
        if state.active() != Some(from) {
            return RebalanceOutcome::Stale {
                active: state.active().map(str::to_string),
            };
        }
        if state.registry.len() == 1 {
            return RebalanceOutcome::SingleNode {
                node: from.to_string(),
            };
        }

        let others: Vec<&str> = state.registry.addresses().filter(|a| *a != from).collect();
        let preferred: Vec<&str> = others
            .iter()
            .copied()
            .filter(|a| !avoid.contains(*a))
            .collect();
        let pool = if preferred.is_empty() { &others } else { &preferred };
        let Some(to) = pool.choose(rng).map(|a| a.to_string()) else {
            return RebalanceOutcome::SingleNode {
                node: from.to_string(),
            };
        };

        self.retire(state, from, reason.resets_average());
        state.activate(&to, now);

        RebalanceOutcome::Rotated {
            from: from.to_string(),
            to,
        }
    }

    /// Move to a random candidate only if the active node is slower.
    ///
    /// The active node's statistics and the dwell clock are reset whether
    /// or not the switch happens. Without an average (one file or less
    /// since the last reset) nothing changes.
    pub fn advisory_rebalance<R: Rng + ?Sized>(
        &self,
        state: &mut SessionState,
        now: Instant,
        rng: &mut R,
    ) -> Option<RebalanceOutcome> {
        let active = state.active()?.to_string();
        let average = state.registry.get(&active)?.current_average()?;

        let others: Vec<&str> = state
            .registry
            .addresses()
            .filter(|a| *a != active)
            .collect();
        let candidate = others.choose(rng).map(|a| a.to_string());

        self.retire(state, &active, false);

        let switch_to = candidate.filter(|c| {
            state
                .registry
                .get(c)
                .is_some_and(|node| should_switch(average, node.average_queue_ms))
        });

        match switch_to {
            Some(to) => {
                state.activate(&to, now);
                Some(RebalanceOutcome::Rotated { from: active, to })
            }
            None => {
                state.activate(&active, now);
                Some(RebalanceOutcome::Kept { node: active })
            }
        }
    }

    /// Run the dwell-time checks once.
    ///
    /// Returns `None` when nothing was decided: no active node, not enough
    /// files processed for an average, or dwell time below the minimum.
    pub fn evaluate_dwell<R: Rng + ?Sized>(
        &self,
        state: &mut SessionState,
        now: Instant,
        rng: &mut R,
    ) -> Option<RebalanceOutcome> {
        let active = state.active()?.to_string();
        state.registry.get(&active)?.current_average()?;

        let dwell = now.saturating_duration_since(state.selected_at());
        if dwell >= self.max_node_time {
            if state.registry.len() == 1 {
                self.retire(state, &active, false);
                state.activate(&active, now);
                return Some(RebalanceOutcome::Kept { node: active });
            }
            return Some(self.force_rebalance(
                state,
                &active,
                RebalanceReason::MaxDwell,
                &BTreeSet::new(),
                now,
                rng,
            ));
        }
        if dwell >= self.min_node_time {
            return self.advisory_rebalance(state, now, rng);
        }
        None
    }

    /// Record (or zero) the node's average and clear its samples.
    fn retire(&self, state: &mut SessionState, address: &str, reset_average: bool) {
        if let Some(node) = state.registry.get_mut(address) {
            if reset_average {
                node.average_queue_ms = 0;
            } else if let Some(average) = node.current_average() {
                node.average_queue_ms = average;
            }
        }
        state.registry.reset_load_stats(address);
    }
}
