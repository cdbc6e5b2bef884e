//! Per-phase unit result records (§3).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of a single work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Success,
    Failed,
    Error,
    Cancelled,
}

/// Whether a Phase-2/3 unit targets the original file or a sanitized variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Version {
    PreCdr,
    PostCdr,
}

/// Phase-1 (CDR) unit result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase1Result {
    pub original_blob_path: String,
    pub cdr_engine: String,
    pub sanitized_blob_path: Option<String>,
    pub status: UnitStatus,
    pub processing_millis: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub threats_found: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Phase-2 (AV) unit result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase2Result {
    pub blob_path: String,
    pub version: Version,
    pub cdr_engine: Option<String>,
    pub original_blob_path: String,
    pub av_engine: String,
    pub is_malicious: bool,
    pub threat_name: Option<String>,
    pub confidence: u8,
    pub scan_millis: u64,
    pub engine_version: String,
    pub status: UnitStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Phase-3 (EDR) unit result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase3Result {
    pub blob_path: String,
    pub version: Version,
    pub cdr_engine: Option<String>,
    pub original_blob_path: String,
    pub edr_console: String,
    pub vm_name: String,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
    pub alert_count: u32,
    pub high_severity_count: u32,
    pub alert_types: BTreeSet<String>,
    pub sample_alerts: Vec<serde_json::Value>,
    pub edr_detected: bool,
    pub status: UnitStatus,
    pub retries: u32,
    pub error: Option<String>,
}

impl Phase3Result {
    /// `AlertCount > 0`, the definition of "detected" used throughout §4.6.
    pub fn compute_detected(alert_count: u32) -> bool {
        alert_count > 0
    }
}
