use cdr_types::{Phase, PhaseSummary, Status};
use chrono::{DateTime, Utc};

/// A partial update to a [`cdr_types::Job`] (§4.1 `update_job`).
///
/// Every field is optional; only `Some` fields are applied. Updates are
/// rejected outright (see [`crate::error::StoreError::Terminal`]) once the
/// job's status is terminal, regardless of which fields the patch touches.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<Status>,
    pub current_phase: Option<Phase>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub total_units: Option<u64>,
    pub phase_summary: Option<(Phase, PhaseSummary)>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_phase(mut self, phase: Phase) -> Self {
        self.current_phase = Some(phase);
        self
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn cancelled_now(mut self) -> Self {
        self.cancelled_at = Some(Utc::now());
        self
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn total_units(mut self, total: u64) -> Self {
        self.total_units = Some(total);
        self
    }

    pub fn phase_summary(mut self, phase: Phase, summary: PhaseSummary) -> Self {
        self.phase_summary = Some((phase, summary));
        self
    }
}
