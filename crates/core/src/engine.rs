//! Engine naming and definition-time normalization.
//!
//! Scan nodes report engine names in inconsistent spellings ("ESET NOD32
//! AV", "Avira!", ...) and definition times in two formats depending on
//! the peer protocol version. Everything downstream keys engines by the
//! normalized name produced here and stores definition times as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{epoch, Timestamp};

/// Suffix dropped from normalized engine names.
const AV_SUFFIX: &str = "av";

/// Token dropped from protocol-3 engine names ("ClamAV ScanEngine").
pub const SCAN_ENGINE_TOKEN: &str = "scanengine";

/// Engine types counted when computing the definition time range.
const AV_ENGINE_TYPES: [&str; 2] = ["av", "bundled engine"];

/// Version and definition time of one engine on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub version: String,
    pub definition_time: Timestamp,
}

/// Canonical lookup key for an engine name.
///
/// Lower-cases the name, strips spaces and `!`, then drops a trailing
/// `av` suffix. The suffix is only dropped while something remains in
/// front of it, which keeps the function idempotent.
pub fn normalize_engine_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .filter(|c| *c != ' ' && *c != '!')
        .flat_map(char::to_lowercase)
        .collect();

    while name.len() > AV_SUFFIX.len() && name.ends_with(AV_SUFFIX) {
        name.truncate(name.len() - AV_SUFFIX.len());
    }
    name
}

/// Whether an engine type string denotes a genuine AV or bundled engine.
pub fn is_av_engine_type(engine_type: &str) -> bool {
    let engine_type = engine_type.trim();
    AV_ENGINE_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(engine_type))
}

/// Parse a protocol-4 definition time (ISO-8601, usually with a `Z`).
///
/// An empty string means the engine has never loaded definitions and maps
/// to the Unix epoch.
pub fn parse_iso_definition_time(value: &str) -> Result<Timestamp, CoreError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(epoch());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| CoreError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Parse a protocol-3 definition time (`MM/DD/YYYY hh:mm:ss AM`).
///
/// Nodes running protocol 3 report local times without a zone; they are
/// taken as UTC. A 24-hour variant without the meridiem is accepted too.
pub fn parse_legacy_definition_time(value: &str) -> Result<Timestamp, CoreError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(epoch());
    }

    NaiveDateTime::parse_from_str(value, "%m/%d/%Y %I:%M:%S %p")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%m/%d/%Y %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|e| CoreError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Render a definition time the way it is reported to hosts and hashed
/// into the capability fingerprint.
pub fn format_definition_time(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
