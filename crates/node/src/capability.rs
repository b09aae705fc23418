//! Capability snapshots: which engines a node runs and how fresh their
//! definitions are.
//!
//! The two peer protocol versions describe engines with different field
//! names and date formats. [`ProtocolVersion::parse_engines`] turns either
//! shape into the same [`EngineRecord`] list, and
//! [`CapabilitySnapshot::from_records`] folds that list into what the
//! registry stores.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use scanfleet_core::engine::{
    format_definition_time, is_av_engine_type, normalize_engine_name,
    parse_iso_definition_time, parse_legacy_definition_time, EngineInfo, SCAN_ENGINE_TOKEN,
};
use scanfleet_core::error::CoreError;
use scanfleet_core::types::{epoch, Timestamp};

use crate::api::{NodeApi, NodeApiError};
use crate::messages::{EngineDescriptorV3, EngineDescriptorV4};

/// Engine states that make an engine unusable even if it claims to be active.
const INACTIVE_STATES: [&str; 2] = ["failed", "removed"];

/// Peer protocol spoken by the configured nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    V3,
    #[default]
    V4,
}

impl FromStr for ProtocolVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "3" | "v3" => Ok(Self::V3),
            "4" | "v4" => Ok(Self::V4),
            other => Err(CoreError::Validation(format!(
                "Unknown node protocol version: {other}"
            ))),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V3 => f.write_str("3"),
            Self::V4 => f.write_str("4"),
        }
    }
}

/// One engine descriptor after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRecord {
    /// Normalized engine name.
    pub name: String,
    pub version: String,
    pub definition_time: Timestamp,
    /// Genuine AV or bundled engine (counts toward the definition range).
    pub is_av: bool,
    /// Enabled and not in a failed/removed state.
    pub active: bool,
}

impl ProtocolVersion {
    /// Parse a `GET /stat/engines` body.
    pub fn parse_engines(&self, body: &str) -> Result<Vec<EngineRecord>, NodeApiError> {
        match self {
            Self::V4 => {
                let descriptors: Vec<EngineDescriptorV4> = serde_json::from_str(body)?;
                Ok(descriptors
                    .into_iter()
                    .map(|d| EngineRecord {
                        name: normalize_engine_name(&d.eng_name),
                        definition_time: definition_time_or_epoch(
                            &d.eng_name,
                            d.def_time.as_deref(),
                            parse_iso_definition_time,
                        ),
                        is_av: is_av_engine_type(&d.engine_type),
                        active: is_active(d.active, d.state.as_deref()),
                        version: d.eng_ver,
                    })
                    .collect())
            }
            Self::V3 => {
                let descriptors: Vec<EngineDescriptorV3> = serde_json::from_str(body)?;
                Ok(descriptors
                    .into_iter()
                    .map(|d| EngineRecord {
                        name: normalize_engine_name(
                            &normalize_engine_name(&d.eng_name).replace(SCAN_ENGINE_TOKEN, ""),
                        ),
                        definition_time: definition_time_or_epoch(
                            &d.eng_name,
                            d.def_time.as_deref(),
                            parse_legacy_definition_time,
                        ),
                        is_av: is_av_engine_type(&d.eng_type),
                        active: is_active(d.active, d.state.as_deref()),
                        version: d.eng_ver,
                    })
                    .collect())
            }
        }
    }
}

fn is_active(active: bool, state: Option<&str>) -> bool {
    active
        && !state.is_some_and(|s| {
            INACTIVE_STATES
                .iter()
                .any(|bad| bad.eq_ignore_ascii_case(s.trim()))
        })
}

/// An unparseable date on one engine should not discard the whole list;
/// the engine is kept with an epoch definition time.
fn definition_time_or_epoch(
    engine: &str,
    raw: Option<&str>,
    parse: fn(&str) -> Result<Timestamp, CoreError>,
) -> Timestamp {
    let Some(raw) = raw else {
        return epoch();
    };
    parse(raw).unwrap_or_else(|e| {
        tracing::warn!(engine, error = %e, "Unparseable engine definition time");
        epoch()
    })
}

/// What a node can scan with, as of its last successful capability fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    /// Engines keyed by normalized name.
    pub engines: BTreeMap<String, EngineInfo>,
    /// Number of distinct engines that are enabled and healthy.
    pub active_engines: usize,
    /// Newest AV definition time, if any AV engine has one.
    pub newest_definition: Option<Timestamp>,
    /// Oldest non-zero AV definition time.
    pub oldest_definition: Option<Timestamp>,
}

impl CapabilitySnapshot {
    /// Fold engine records into a snapshot.
    ///
    /// Records whose names normalize identically describe the same engine:
    /// the last one wins for version/definition time, and the engine counts
    /// as active once if any of them is active.
    pub fn from_records(records: Vec<EngineRecord>) -> Self {
        let mut engines = BTreeMap::new();
        let mut active = BTreeMap::new();
        let mut newest: Option<Timestamp> = None;
        let mut oldest: Option<Timestamp> = None;

        for record in records {
            if record.is_av && record.definition_time != epoch() {
                newest = Some(newest.map_or(record.definition_time, |n| n.max(record.definition_time)));
                oldest = Some(oldest.map_or(record.definition_time, |o| o.min(record.definition_time)));
            }

            *active.entry(record.name.clone()).or_insert(false) |= record.active;
            engines.insert(
                record.name,
                EngineInfo {
                    version: record.version,
                    definition_time: record.definition_time,
                },
            );
        }

        Self {
            engines,
            active_engines: active.values().filter(|a| **a).count(),
            newest_definition: newest,
            oldest_definition: oldest,
        }
    }

    /// No engines known; the node has not been fetched successfully yet.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Look up an engine by its display name as reported in scan results.
    pub fn engine(&self, display_name: &str) -> Option<&EngineInfo> {
        self.engines.get(&normalize_engine_name(display_name))
    }

    /// Deterministic text of the engine list (name, version, definition
    /// time), used as input to the capability fingerprint.
    pub fn fingerprint_material(&self) -> String {
        self.engines
            .iter()
            .map(|(name, info)| {
                format!(
                    "{name}{}{}",
                    info.version,
                    format_definition_time(&info.definition_time)
                )
            })
            .collect()
    }
}

/// Queries nodes for their capability snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityFetcher {
    protocol: ProtocolVersion,
}

impl CapabilityFetcher {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Run a single capability query against one node.
    ///
    /// Timeouts and connection failures surface as
    /// [`NodeApiError::Timeout`] / [`NodeApiError::Unreachable`]; the
    /// caller's existing snapshot is not touched on failure.
    pub async fn fetch(&self, api: &NodeApi) -> Result<CapabilitySnapshot, NodeApiError> {
        let body = api.engines().await?;
        let records = self.protocol.parse_engines(&body)?;
        let snapshot = CapabilitySnapshot::from_records(records);

        tracing::debug!(
            node = %api.base_url(),
            engines = snapshot.engines.len(),
            active_engines = snapshot.active_engines,
            "Fetched node capabilities",
        );

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    const V4_ENGINES: &str = r#"[
        {"eng_name": "ClamAV", "eng_ver": "1.2.0", "def_time": "2024-03-10T00:00:00.000Z",
         "engine_type": "av", "active": true, "state": "production"},
        {"eng_name": "Avira AV", "eng_ver": "8.3", "def_time": "2024-03-14T06:00:00.000Z",
         "engine_type": "Bundled engine", "active": true, "state": "production"},
        {"eng_name": "Archive", "eng_ver": "5.0", "def_time": "2024-03-20T00:00:00.000Z",
         "engine_type": "archive", "active": true, "state": "production"},
        {"eng_name": "Ikarus", "eng_ver": "2.0", "def_time": "",
         "engine_type": "av", "active": true, "state": "failed"}
    ]"#;

    const V3_ENGINES: &str = r#"[
        {"eng_name": "ClamAV ScanEngine", "eng_ver": "0.99", "def_time": "03/10/2024 08:00:00 PM",
         "eng_type": "Bundled engine", "active": true},
        {"eng_name": "Ahnlab", "eng_ver": "3.0", "def_time": "03/12/2024 01:30:00 AM",
         "eng_type": "av", "active": false}
    ]"#;

    #[test]
    fn v4_engines_are_normalized() {
        let records = ProtocolVersion::V4.parse_engines(V4_ENGINES).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["clam", "avira", "archive", "ikarus"]);
        assert!(!records[3].active, "failed engine must not count as active");
    }

    #[test]
    fn v3_engines_are_normalized() {
        let records = ProtocolVersion::V3.parse_engines(V3_ENGINES).unwrap();
        assert_eq!(records[0].name, "clam");
        assert_eq!(
            records[0].definition_time,
            Utc.with_ymd_and_hms(2024, 3, 10, 20, 0, 0).unwrap()
        );
        assert!(!records[1].active);
    }

    #[test]
    fn snapshot_counts_active_engines_and_av_range() {
        let records = ProtocolVersion::V4.parse_engines(V4_ENGINES).unwrap();
        let snapshot = CapabilitySnapshot::from_records(records);

        assert_eq!(snapshot.engines.len(), 4);
        assert_eq!(snapshot.active_engines, 3);
        // Archive engine is newer but is not an AV engine; Ikarus has no date.
        assert_eq!(
            snapshot.newest_definition,
            Some(Utc.with_ymd_and_hms(2024, 3, 14, 6, 0, 0).unwrap())
        );
        assert_eq!(
            snapshot.oldest_definition,
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn duplicate_normalized_names_are_one_engine() {
        let body = r#"[
            {"eng_name": "ENGINE AV", "eng_ver": "1", "engine_type": "av", "active": true},
            {"eng_name": "Engine!AV", "eng_ver": "2", "engine_type": "av", "active": true}
        ]"#;
        let records = ProtocolVersion::V4.parse_engines(body).unwrap();
        let snapshot = CapabilitySnapshot::from_records(records);
        assert_eq!(snapshot.engines.len(), 1);
        assert_eq!(snapshot.active_engines, 1);
        assert_eq!(snapshot.engines["engine"].version, "2");
    }

    #[test]
    fn lookup_by_display_name() {
        let records = ProtocolVersion::V4.parse_engines(V4_ENGINES).unwrap();
        let snapshot = CapabilitySnapshot::from_records(records);
        assert_eq!(snapshot.engine("Avira AV").unwrap().version, "8.3");
        assert!(snapshot.engine("Unknown").is_none());
    }

    #[test]
    fn bad_definition_time_keeps_engine() {
        let body = r#"[{"eng_name": "K7", "eng_ver": "1", "def_time": "soon", "engine_type": "av"}]"#;
        let records = ProtocolVersion::V4.parse_engines(body).unwrap();
        assert_eq!(records[0].definition_time, epoch());
    }

    #[test]
    fn wrong_shape_is_decode_error() {
        let err = ProtocolVersion::V4.parse_engines(r#"{"engines": []}"#).unwrap_err();
        assert!(matches!(err, NodeApiError::Decode(_)));
    }

    #[test]
    fn protocol_version_from_str() {
        assert_eq!("3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V3);
        assert_eq!("V4".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V4);
        assert!("5".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn fingerprint_material_is_ordered() {
        let records = ProtocolVersion::V4.parse_engines(V4_ENGINES).unwrap();
        let snapshot = CapabilitySnapshot::from_records(records);
        let material = snapshot.fingerprint_material();
        assert!(material.starts_with("archive5.02024-03-20T00:00:00Z"));
    }
}
