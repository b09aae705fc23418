//! Dispatcher session: node registry, active-node pointer and dwell clock
//! behind a single lock.
//!
//! Network calls (capability fetches) happen outside the lock; only the
//! resulting state changes are applied under it. The lock is never held
//! across an `.await` other than its own acquisition.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;

use scanfleet_core::types::Timestamp;
use scanfleet_node::api::{build_http_client, NodeApi};
use scanfleet_node::capability::{CapabilityFetcher, CapabilitySnapshot};

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::registry::{NodeRegistry, NodeState, NodeView};
use crate::selector::{NodeSelector, RebalanceOutcome, RebalanceReason};

/// Mutable dispatcher state. Only reachable through [`Session`]'s lock.
#[derive(Debug)]
pub struct SessionState {
    pub registry: NodeRegistry,
    active: Option<String>,
    selected_at: Instant,
}

impl SessionState {
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            registry,
            active: None,
            selected_at: Instant::now(),
        }
    }

    /// Address of the active node; `None` only before the first selection.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// When the active node was selected (or its dwell clock last reset).
    pub fn selected_at(&self) -> Instant {
        self.selected_at
    }

    /// Make `address` the active node and restart the dwell clock.
    ///
    /// A node that becomes active starts a new stint with no samples.
    pub fn activate(&mut self, address: &str, now: Instant) {
        if self.active() != Some(address) {
            self.registry.reset_load_stats(address);
        }
        self.active = Some(address.to_string());
        self.selected_at = now;
    }

    /// Record a completed scan if `address` is still the active node.
    ///
    /// Scans that finish after their node was rotated away are dropped so
    /// they cannot leak into the node's next stint. Returns whether the
    /// sample was kept.
    pub fn record_completion(&mut self, address: &str, queue_time_ms: u64) -> bool {
        if self.active() != Some(address) {
            return false;
        }
        self.registry.record_completion(address, queue_time_ms);
        true
    }
}

/// Shared node state plus the per-node HTTP clients.
#[derive(Debug)]
pub struct Session {
    state: Mutex<SessionState>,
    selector: NodeSelector,
    fetcher: CapabilityFetcher,
    apis: BTreeMap<String, NodeApi>,
    single_node_pause: Duration,
    selection_attempts: usize,
}

impl Session {
    /// Build the registry, fetch every node's capabilities and pick the
    /// first active node.
    ///
    /// Fails with [`DispatchError::NoUsableNode`] when no node reports an
    /// active engine.
    pub async fn start(config: &DispatchConfig) -> Result<Self, DispatchError> {
        config.validate()?;

        let client = build_http_client(config.request_timeout, config.api_key.as_deref())
            .map_err(|e| DispatchError::StartupConfiguration(e.to_string()))?;
        let registry = NodeRegistry::initialize(&config.node_urls)?;
        let apis = config
            .node_urls
            .iter()
            .map(|url| (url.clone(), NodeApi::with_client(client.clone(), url)))
            .collect();

        let session = Self {
            state: Mutex::new(SessionState::new(registry)),
            selector: NodeSelector::new(config.min_node_time, config.max_node_time),
            fetcher: CapabilityFetcher::new(config.protocol),
            apis,
            single_node_pause: config.single_node_pause,
            selection_attempts: config.selection_attempts(),
        };

        tracing::info!(
            nodes = config.node_urls.len(),
            protocol = %config.protocol,
            "Fetching scan node capabilities",
        );

        join_all(config.node_urls.iter().map(|address| {
            session.startup_fetch(
                address,
                config.startup_fetch_retries,
                config.startup_retry_delay,
            )
        }))
        .await;

        let total = session.state.lock().await.registry.total_active_engines();
        if total == 0 {
            tracing::error!("No scan node reported an active engine");
            return Err(DispatchError::NoUsableNode);
        }

        session.select_initial().await?;
        Ok(session)
    }

    /// HTTP client for a configured node.
    pub fn api(&self, address: &str) -> Result<&NodeApi, DispatchError> {
        self.apis.get(address).ok_or_else(|| {
            DispatchError::StartupConfiguration(format!("unknown scan node {address}"))
        })
    }

    /// Fetch a node's capabilities and apply them on success.
    ///
    /// Returns the node's active-engine count. On failure the existing
    /// snapshot is left untouched and the error is returned as-is.
    pub async fn refresh(&self, address: &str) -> Result<usize, DispatchError> {
        let api = self.api(address)?;
        let snapshot = self
            .fetcher
            .fetch(api)
            .await
            .map_err(|e| DispatchError::from_node(address, e))?;

        let active_engines = snapshot.active_engines;
        self.state
            .lock()
            .await
            .registry
            .apply_refresh(address, snapshot);
        Ok(active_engines)
    }

    /// Pick a random node with at least one active engine and make it
    /// active, refreshing nodes that look empty.
    pub async fn select_initial(&self) -> Result<String, DispatchError> {
        let mut tried = BTreeSet::new();

        for attempt in 1..=self.selection_attempts {
            let (node, engines) = {
                let mut state = self.state.lock().await;
                let Some(node) = self.selector.pick_initial(
                    &mut state,
                    &tried,
                    Instant::now(),
                    &mut rand::rng(),
                ) else {
                    break;
                };
                let engines = state.registry.get(&node).map_or(0, NodeState::active_engines);
                (node, engines)
            };

            if engines > 0 {
                tracing::info!(node = %node, engines, "Selected active scan node");
                return Ok(node);
            }

            match self.refresh(&node).await {
                Ok(engines) if engines > 0 => {
                    tracing::info!(node = %node, engines, "Selected active scan node after refresh");
                    return Ok(node);
                }
                Ok(_) => {
                    tracing::warn!(node = %node, attempt, "Scan node has no active engine");
                }
                Err(e) => {
                    tracing::warn!(node = %node, attempt, error = %e, "Scan node capability refresh failed");
                }
            }
            tried.insert(node);
        }

        tracing::error!(attempts = self.selection_attempts, "No scan node with an active engine");
        Err(DispatchError::NodeCapabilityExhausted {
            attempts: self.selection_attempts,
        })
    }

    /// Return the active node, making sure it has an active engine.
    ///
    /// An empty node is refreshed once; if it is still empty the session
    /// rotates away from it. Gives up after every node has had its turn.
    pub async fn ensure_capable(&self) -> Result<String, DispatchError> {
        let mut visited = BTreeSet::new();

        for _ in 0..self.selection_attempts {
            let (node, engines) = self.active_with_engines().await?;
            if engines > 0 {
                return Ok(node);
            }

            match self.refresh(&node).await {
                Ok(engines) if engines > 0 => return Ok(node),
                Ok(_) => tracing::warn!(node = %node, "Active scan node has no active engine"),
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "Active scan node capability refresh failed")
                }
            }

            visited.insert(node.clone());
            self.rotate(&node, RebalanceReason::CapabilityLost, &visited)
                .await;
        }

        tracing::error!(attempts = self.selection_attempts, "Every scan node is without engines");
        Err(DispatchError::NodeCapabilityExhausted {
            attempts: self.selection_attempts,
        })
    }

    /// Forced rebalance away from `from`.
    ///
    /// With a single configured node nothing rotates; the call pauses
    /// instead so the caller's retry does not hammer the node.
    pub async fn force_rebalance(&self, from: &str, reason: RebalanceReason) -> RebalanceOutcome {
        self.rotate(from, reason, &BTreeSet::new()).await
    }

    /// Run the per-cycle dwell-time checks.
    pub async fn evaluate_dwell(&self) -> Option<RebalanceOutcome> {
        let outcome = {
            let mut state = self.state.lock().await;
            self.selector
                .evaluate_dwell(&mut state, Instant::now(), &mut rand::rng())
        };

        match &outcome {
            Some(RebalanceOutcome::Rotated { from, to }) => {
                tracing::info!(from = %from, to = %to, "Rebalanced scan nodes on dwell time");
            }
            Some(RebalanceOutcome::Kept { node }) => {
                tracing::debug!(node = %node, "Kept active scan node after dwell check");
            }
            _ => {}
        }
        outcome
    }

    /// Record a successful scan's queue time against the node that served it.
    pub async fn record_completion(&self, address: &str, queue_time_ms: u64) {
        let kept = self
            .state
            .lock()
            .await
            .record_completion(address, queue_time_ms);
        if !kept {
            tracing::debug!(node = %address, queue_time_ms, "Dropped sample from a rotated-away node");
        }
    }

    /// Copy of a node's capability snapshot.
    pub async fn capabilities(&self, address: &str) -> CapabilitySnapshot {
        self.state
            .lock()
            .await
            .registry
            .get(address)
            .map(|n| n.capabilities.clone())
            .unwrap_or_default()
    }

    pub async fn active_node(&self) -> Option<String> {
        self.state.lock().await.active().map(str::to_string)
    }

    pub async fn nodes(&self) -> Vec<NodeView> {
        self.state
            .lock()
            .await
            .registry
            .iter()
            .map(NodeState::view)
            .collect()
    }

    /// Oldest and newest AV definition time on the active node.
    pub async fn definition_range(&self) -> Option<(Timestamp, Timestamp)> {
        let state = self.state.lock().await;
        let node = state.registry.get(state.active()?)?;
        Some((
            node.capabilities.oldest_definition?,
            node.capabilities.newest_definition?,
        ))
    }

    pub async fn fingerprint(&self) -> String {
        self.state.lock().await.registry.fingerprint()
    }

    // ---- private helpers ----

    async fn startup_fetch(&self, address: &str, retries: u32, delay: Duration) {
        for attempt in 0..=retries {
            match self.refresh(address).await {
                Ok(engines) => {
                    tracing::info!(node = %address, engines, "Scan node capabilities loaded");
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        node = %address,
                        attempt = attempt + 1,
                        error = %e,
                        "Scan node capability fetch failed",
                    );
                }
            }
            if attempt < retries {
                tokio::time::sleep(delay).await;
            }
        }
        tracing::error!(node = %address, "Giving up on scan node capabilities for now");
    }

    async fn active_with_engines(&self) -> Result<(String, usize), DispatchError> {
        {
            let state = self.state.lock().await;
            if let Some(node) = state.active() {
                let engines = state.registry.get(node).map_or(0, NodeState::active_engines);
                return Ok((node.to_string(), engines));
            }
        }

        let node = self.select_initial().await?;
        let state = self.state.lock().await;
        let engines = state.registry.get(&node).map_or(0, NodeState::active_engines);
        Ok((node, engines))
    }

    async fn rotate(
        &self,
        from: &str,
        reason: RebalanceReason,
        avoid: &BTreeSet<String>,
    ) -> RebalanceOutcome {
        let outcome = {
            let mut state = self.state.lock().await;
            self.selector.force_rebalance(
                &mut state,
                from,
                reason,
                avoid,
                Instant::now(),
                &mut rand::rng(),
            )
        };

        match &outcome {
            RebalanceOutcome::Rotated { from, to } => {
                tracing::info!(from = %from, to = %to, ?reason, "Rotated active scan node");
            }
            RebalanceOutcome::SingleNode { node } => {
                tracing::warn!(
                    node = %node,
                    ?reason,
                    pause_ms = self.single_node_pause.as_millis() as u64,
                    "Only one scan node configured, pausing instead of rotating",
                );
                tokio::time::sleep(self.single_node_pause).await;
            }
            RebalanceOutcome::Stale { active } => {
                tracing::debug!(from = %from, ?active, "Scan node already rotated by another scan");
            }
            RebalanceOutcome::Kept { .. } => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "http://node-a";
    const B: &str = "http://node-b";

    fn state(active: &str) -> SessionState {
        let registry = NodeRegistry::initialize(&[A.to_string(), B.to_string()]).unwrap();
        let mut state = SessionState::new(registry);
        state.activate(active, Instant::now());
        state
    }

    #[test]
    fn completion_on_active_node_is_recorded() {
        let mut st = state(A);
        assert!(st.record_completion(A, 120));

        let a = st.registry.get(A).unwrap();
        assert_eq!(a.queue_samples, [120]);
        assert_eq!(a.files_processed, 1);
    }

    #[test]
    fn completion_after_rotation_is_dropped() {
        let mut st = state(A);
        st.activate(B, Instant::now());

        assert!(!st.record_completion(A, 120));

        let a = st.registry.get(A).unwrap();
        assert!(a.queue_samples.is_empty());
        assert_eq!(a.files_processed, 0);
    }

    #[test]
    fn reactivated_node_starts_without_samples() {
        let mut st = state(B);
        // Left behind by a scan that finished after A lost the active slot.
        st.registry.record_completion(A, 120);
        st.registry.get_mut(A).unwrap().average_queue_ms = 300;

        st.activate(A, Instant::now());

        let a = st.registry.get(A).unwrap();
        assert!(a.queue_samples.is_empty());
        assert_eq!(a.files_processed, 0);
        assert_eq!(a.average_queue_ms, 300);
    }

    #[test]
    fn reactivating_the_same_node_keeps_its_samples() {
        let mut st = state(A);
        st.record_completion(A, 120);

        st.activate(A, Instant::now());

        assert_eq!(st.registry.get(A).unwrap().files_processed, 1);
    }
}
