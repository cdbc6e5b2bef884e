use async_trait::async_trait;
use cdr_types::{Job, JobId, Phase, Priority};
use std::collections::BTreeSet;

use crate::error::StoreError;
use crate::patch::JobPatch;

/// Persistent, concurrency-safe job metadata and per-phase result storage
/// (§4.1).
///
/// A remote-store implementation (e.g. backed by a managed key-value
/// service) can be dropped in behind this trait without changing any
/// caller; the coordinator and phase runners depend only on this interface.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a brand-new job record and push it to the head of the
    /// recent-jobs list.
    async fn create_job(
        &self,
        id: JobId,
        container_name: String,
        file_paths: Vec<String>,
        enabled_phases: BTreeSet<Phase>,
        priority: Priority,
    ) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Apply a partial update. Rejected once the job is in a terminal status.
    async fn update_job(&self, id: JobId, patch: JobPatch) -> Result<(), StoreError>;

    /// Atomically bump `processed`.
    async fn increment_processed(&self, id: JobId) -> Result<(), StoreError>;

    /// Atomically bump both `failed` and `processed`.
    async fn increment_failed(&self, id: JobId) -> Result<(), StoreError>;

    /// Append one result to the job's per-phase list.
    async fn append_phase_result(
        &self,
        id: JobId,
        phase: Phase,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn list_phase_results(&self, id: JobId, phase: Phase) -> Result<Vec<serde_json::Value>, StoreError>;

    /// Newest-first, capped at `limit`.
    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Transitions a non-terminal job to `Cancelled`. Returns `false` if the
    /// job is missing or already terminal.
    async fn cancel_job(&self, id: JobId) -> Result<bool, StoreError>;

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError>;
}
