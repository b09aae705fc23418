//! Submit-then-poll scan dispatch with failover.
//!
//! [`ScanDispatcher::scan`] is the only call a host needs: it guards the
//! active node's capabilities, submits the artifact, polls until the node
//! reports 100% progress, and turns the report into a verdict. Node-level
//! failures rotate the active node before the error is returned, and
//! transport failures are retried exactly once.

use std::time::{Duration, Instant};

use scanfleet_core::types::Timestamp;
use scanfleet_core::verdict::Verdict;
use scanfleet_node::api::{JobStatus, NodeApi};
use scanfleet_node::messages::JobReport;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::registry::NodeView;
use crate::selector::RebalanceReason;
use crate::session::Session;
use crate::verdict::build_verdict;

/// Dispatches artifacts to the active scan node.
///
/// Created once at startup via [`ScanDispatcher::start`]; safe to share
/// behind an `Arc` across concurrent scans.
#[derive(Debug)]
pub struct ScanDispatcher {
    session: Session,
    poll_interval: Duration,
    scan_deadline: Duration,
}

impl ScanDispatcher {
    /// Load every node's capabilities and select the first active node.
    pub async fn start(config: DispatchConfig) -> Result<Self, DispatchError> {
        let session = Session::start(&config).await?;
        Ok(Self {
            session,
            poll_interval: config.poll_interval,
            scan_deadline: config.scan_deadline,
        })
    }

    /// Scan one artifact and return its verdict.
    ///
    /// A retryable failure ([`DispatchError::NodeUnreachable`] or
    /// [`DispatchError::NodeTimeout`]) is retried once, normally against
    /// the node the failure rotated to. A second failure is returned.
    pub async fn scan(&self, artifact: &[u8]) -> Result<Verdict, DispatchError> {
        match self.scan_once(artifact).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "Scan failed, retrying once");
                self.scan_once(artifact).await
            }
            other => other,
        }
    }

    /// Oldest and newest AV definition time on the active node.
    pub async fn current_definition_range(&self) -> Option<(Timestamp, Timestamp)> {
        self.session.definition_range().await
    }

    /// Hash over every node's engine names, versions and definition times.
    ///
    /// Changes whenever any node's engine set changes, which tells hosts
    /// that earlier results may be worth re-scanning.
    pub async fn capability_fingerprint(&self) -> String {
        self.session.fingerprint().await
    }

    pub async fn active_node(&self) -> Option<String> {
        self.session.active_node().await
    }

    pub async fn nodes(&self) -> Vec<NodeView> {
        self.session.nodes().await
    }

    // ---- private helpers ----

    async fn scan_once(&self, artifact: &[u8]) -> Result<Verdict, DispatchError> {
        self.session.evaluate_dwell().await;

        let node = self.session.ensure_capable().await?;
        let api = self.session.api(&node)?;

        let submitted_at = Instant::now();
        let data_id = match api.submit(artifact.to_vec()).await {
            Ok(response) => response.data_id,
            Err(e) => return Err(self.fail_node(&node, DispatchError::from_node(&node, e)).await),
        };
        tracing::debug!(node = %node, data_id = %data_id, "Artifact submitted");

        let report = self.poll_until_complete(&node, api, &data_id).await?;

        let queue_time_ms = report
            .process_info
            .queue_time
            .unwrap_or_else(|| submitted_at.elapsed().as_millis() as u64);
        let capabilities = self.session.capabilities(&node).await;
        let verdict = build_verdict(&node, &data_id, report, &capabilities, queue_time_ms);

        self.session.record_completion(&node, queue_time_ms).await;
        tracing::info!(
            node = %node,
            data_id = %data_id,
            queue_time_ms,
            engines = verdict.engines.len(),
            infected = verdict.is_infected(),
            "Scan completed",
        );

        Ok(verdict)
    }

    async fn poll_until_complete(
        &self,
        node: &str,
        api: &NodeApi,
        data_id: &str,
    ) -> Result<JobReport, DispatchError> {
        let started = Instant::now();

        loop {
            if started.elapsed() > self.scan_deadline {
                let err = DispatchError::NodeTimeout {
                    node: node.to_string(),
                    reason: format!(
                        "job {data_id} not finished after {}s",
                        self.scan_deadline.as_secs()
                    ),
                };
                return Err(self.fail_node(node, err).await);
            }

            match api.job_status(data_id).await {
                Ok(JobStatus::Complete(report)) => return Ok(*report),
                Ok(JobStatus::Pending { progress }) => {
                    tracing::debug!(node = %node, data_id = %data_id, progress, "Scan in progress");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(JobStatus::MissingProgress) => {
                    let err = DispatchError::NodeUnreachable {
                        node: node.to_string(),
                        reason: "status response lacks scan_results.progress_percentage".into(),
                    };
                    return Err(self.fail_node(node, err).await);
                }
                Ok(JobStatus::Rejected { status, payload }) => {
                    tracing::warn!(node = %node, data_id = %data_id, status, "Scan status request rejected");
                    return Err(DispatchError::MalformedResponse {
                        node: node.to_string(),
                        detail: format!("HTTP {status}: {payload}"),
                    });
                }
                Err(e) => {
                    return Err(self.fail_node(node, DispatchError::from_node(node, e)).await);
                }
            }
        }
    }

    /// Rotate away from a failing node and hand back the error.
    async fn fail_node(&self, node: &str, err: DispatchError) -> DispatchError {
        tracing::warn!(node = %node, error = %err, "Scan node failed");
        self.session
            .force_rebalance(node, RebalanceReason::NodeError)
            .await;
        err
    }
}
