//! Normalized scan outcome for one artifact.
//!
//! A [`Verdict`] is built once per completed job and never mutated
//! afterwards. Hosts translate it into their own reporting format.

use serde::{Deserialize, Serialize};

use crate::engine::EngineInfo;

/// Prefix some engines put in front of a heuristic detection name.
const VARIANT_PREFIX: &str = "a variant of ";

/// Outcome reported by one engine for one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOutcome {
    Clean,
    Suspicious,
    Infected,
    ScanFailed,
    NoResult,
}

impl EngineOutcome {
    /// Map a node's `scan_result_i` code.
    ///
    /// | Code     | Outcome      |
    /// |----------|--------------|
    /// | `0`      | clean        |
    /// | `1`      | infected     |
    /// | `2`      | suspicious   |
    /// | `3`, `10`| scan failed  |
    /// | other    | no result    |
    pub fn from_result_code(code: i64) -> Self {
        match code {
            0 => Self::Clean,
            1 => Self::Infected,
            2 => Self::Suspicious,
            3 | 10 => Self::ScanFailed,
            _ => Self::NoResult,
        }
    }

    /// Infected and suspicious outcomes carry a threat label.
    pub fn is_detection(self) -> bool {
        matches!(self, Self::Infected | Self::Suspicious)
    }
}

/// One engine's record within a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVerdict {
    /// Engine name as reported by the node.
    pub engine: String,
    pub outcome: EngineOutcome,
    /// Threat label for detections, with the variant prefix removed.
    pub threat: Option<String>,
    pub scan_time_ms: u64,
    /// Engine version and definition time on the serving node, when known.
    pub definition: Option<EngineInfo>,
}

impl EngineVerdict {
    /// Build a record from the raw per-engine fields of a job report.
    ///
    /// The threat label is kept only for detections and only when the
    /// engine actually named something.
    pub fn new(
        engine: impl Into<String>,
        result_code: i64,
        threat_found: Option<&str>,
        scan_time_ms: u64,
        definition: Option<EngineInfo>,
    ) -> Self {
        let outcome = EngineOutcome::from_result_code(result_code);
        let threat = threat_found
            .filter(|_| outcome.is_detection())
            .map(strip_variant_prefix)
            .filter(|t| !t.is_empty());

        Self {
            engine: engine.into(),
            outcome,
            threat,
            scan_time_ms,
            definition,
        }
    }
}

/// Post-processing actions the node ran after scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessing {
    pub actions_ran: String,
    pub actions_failed: String,
}

/// The normalized outcome of one completed scan job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Address of the node that served the job.
    pub node: String,
    /// Job identifier issued by the node.
    pub data_id: String,
    /// Per-engine records, sorted by engine name.
    pub engines: Vec<EngineVerdict>,
    pub file_size: u64,
    pub queue_time_ms: u64,
    pub processing_time_ms: u64,
    pub post_processing: PostProcessing,
}

impl Verdict {
    /// Whether any engine reported the artifact as infected.
    pub fn is_infected(&self) -> bool {
        self.engines
            .iter()
            .any(|e| e.outcome == EngineOutcome::Infected)
    }

    /// Engines that reported an infection or a suspicion.
    pub fn hits(&self) -> impl Iterator<Item = &EngineVerdict> {
        self.engines.iter().filter(|e| e.outcome.is_detection())
    }

    /// Engines that failed to scan the artifact.
    pub fn failures(&self) -> impl Iterator<Item = &EngineVerdict> {
        self.engines
            .iter()
            .filter(|e| e.outcome == EngineOutcome::ScanFailed)
    }
}

/// Remove the "a variant of " prefix engines put before heuristic names.
pub fn strip_variant_prefix(threat: &str) -> String {
    threat.replace(VARIANT_PREFIX, "").trim().to_string()
}
