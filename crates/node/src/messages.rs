//! Wire types for the scan node HTTP contract.
//!
//! Only the fields the dispatcher reads are modelled; everything else in
//! the node's JSON is ignored.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Response to `POST /file`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Opaque job token used to poll `GET /file/<data_id>`.
    pub data_id: String,
}

/// Error payload returned alongside a non-200 status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default, alias = "err", alias = "error")]
    pub message: Option<String>,
}

/// Engine descriptor from `GET /stat/engines` on protocol-4 nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineDescriptorV4 {
    pub eng_name: String,
    #[serde(default)]
    pub eng_ver: String,
    /// ISO-8601 definition time.
    #[serde(default)]
    pub def_time: Option<String>,
    #[serde(default)]
    pub engine_type: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub state: Option<String>,
}

/// Engine descriptor from `GET /stat/engines` on protocol-3 nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineDescriptorV3 {
    pub eng_name: String,
    #[serde(default)]
    pub eng_ver: String,
    /// `MM/DD/YYYY hh:mm:ss AM` definition time.
    #[serde(default)]
    pub def_time: Option<String>,
    #[serde(default)]
    pub eng_type: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub state: Option<String>,
}

/// Engines that omit the flag are taken as enabled.
fn default_active() -> bool {
    true
}

/// A finished job as returned by `GET /file/<data_id>`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobReport {
    pub scan_results: ScanResults,
    #[serde(default)]
    pub file_info: FileInfo,
    #[serde(default)]
    pub process_info: ProcessInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanResults {
    #[serde(deserialize_with = "whole_percentage")]
    pub progress_percentage: u32,
    /// Per-engine results keyed by the engine's display name.
    #[serde(default)]
    pub scan_details: BTreeMap<String, EngineScanDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineScanDetail {
    pub scan_result_i: i64,
    #[serde(default)]
    pub threat_found: Option<String>,
    #[serde(default)]
    pub scan_time: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub file_size: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessInfo {
    /// Milliseconds the job waited before an engine picked it up.
    #[serde(default)]
    pub queue_time: Option<u64>,
    #[serde(default)]
    pub processing_time: u64,
    #[serde(default)]
    pub post_processing: PostProcessingInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostProcessingInfo {
    #[serde(default)]
    pub actions_ran: String,
    #[serde(default)]
    pub actions_failed: String,
}

/// Accepts `100` as well as `100.0`; fractions are truncated.
fn whole_percentage<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(D::Error::custom(format!("invalid progress percentage {value}")));
    }
    Ok(value as u32)
}
