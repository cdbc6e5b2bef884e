//! Job metadata (§3 "Job").

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a fresh random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Caller-supplied priority; advisory only (open question in §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Maps to the scheduler hint named in §4.7 (Low=3, Normal=5, High=7).
    pub fn scheduler_hint(self) -> u8 {
        match self {
            Priority::Low => 3,
            Priority::Normal => 5,
            Priority::High => 7,
        }
    }
}

/// A pipeline phase tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Cdr = 1,
    Av = 2,
    Edr = 3,
}

impl Phase {
    /// The phase that must run immediately before this one, if any.
    pub fn predecessor(self) -> Option<Phase> {
        match self {
            Phase::Cdr => None,
            Phase::Av => Some(Phase::Cdr),
            Phase::Edr => Some(Phase::Av),
        }
    }

    /// The storage key suffix used for the per-phase result list (§6).
    pub fn store_tag(self) -> &'static str {
        match self {
            Phase::Cdr => "phase1",
            Phase::Av => "phase2",
            Phase::Edr => "phase3",
        }
    }
}

/// Job lifecycle status (§3, invariant P4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    /// Terminal statuses are sinks; no further transition is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

/// Aggregate metrics computed when a phase's fan-out/join settles (§4.4–4.6).
pub type PhaseSummary = BTreeMap<String, serde_json::Value>;

/// A job record as persisted by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub container_name: String,
    pub file_paths: Vec<String>,
    pub enabled_phases: BTreeSet<Phase>,
    pub priority: Priority,
    pub status: Status,

    pub total_units: u64,
    pub processed: u64,
    pub failed: u64,

    pub current_phase: Option<Phase>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub phase_summaries: BTreeMap<Phase, PhaseSummary>,
    pub failure_reason: Option<String>,
}

impl Job {
    /// Create a brand-new `Pending` job record.
    pub fn new(
        id: JobId,
        container_name: String,
        file_paths: Vec<String>,
        enabled_phases: BTreeSet<Phase>,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            container_name,
            file_paths,
            enabled_phases,
            priority,
            status: Status::Pending,
            total_units: 0,
            processed: 0,
            failed: 0,
            current_phase: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            phase_summaries: BTreeMap::new(),
            failure_reason: None,
        }
    }

    /// `100 * processed / total_units`, or 0 when there is no work (§3 invariant).
    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            0.0
        } else {
            100.0 * (self.processed as f64) / (self.total_units as f64)
        }
    }
}
