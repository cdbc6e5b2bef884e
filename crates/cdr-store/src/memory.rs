use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cdr_types::{Job, JobId, Phase, Priority};
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::patch::JobPatch;
use crate::store::JobStore;

struct JobEntry {
    job: Job,
    phase_results: BTreeMap<Phase, Vec<serde_json::Value>>,
    expires_at: chrono::DateTime<Utc>,
}

struct Inner {
    jobs: HashMap<JobId, JobEntry>,
    recent: VecDeque<JobId>,
}

/// In-process job store guarded by a single reader/writer lock (§4.1, §5).
///
/// Suitable as the sole store for a single coordinator process; a clustered
/// deployment would swap this for a remote-backed [`JobStore`] without
/// touching the coordinator or phase runners.
pub struct InMemoryJobStore {
    ttl: Duration,
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
                recent: VecDeque::new(),
            }),
        }
    }

    /// Spawn a background task that periodically evicts jobs past their TTL
    /// (§3 "RetentionPolicy", §8 seed scenario 6).
    pub fn spawn_reaper(self: &Arc<Self>, sweep_interval: StdDuration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                store.reap_expired().await;
            }
        })
    }

    async fn reap_expired(&self) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<JobId> = inner
            .jobs
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
            inner.recent.retain(|existing| existing != id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "reaped expired jobs");
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        id: JobId,
        container_name: String,
        file_paths: Vec<String>,
        enabled_phases: BTreeSet<Phase>,
        priority: Priority,
    ) -> Result<(), StoreError> {
        let job = Job::new(id, container_name, file_paths, enabled_phases, priority);
        let entry = JobEntry {
            expires_at: job.created_at + self.ttl,
            job,
            phase_results: BTreeMap::new(),
        };
        let mut inner = self.inner.write().await;
        inner.jobs.insert(id, entry);
        inner.recent.push_front(id);
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_job(&self, id: JobId, patch: JobPatch) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.job.status.is_terminal() {
            return Err(StoreError::Terminal(id));
        }
        if let Some(status) = patch.status {
            entry.job.status = status;
        }
        if let Some(phase) = patch.current_phase {
            entry.job.current_phase = Some(phase);
        }
        if let Some(at) = patch.started_at {
            entry.job.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            entry.job.completed_at = Some(at);
        }
        if let Some(at) = patch.cancelled_at {
            entry.job.cancelled_at = Some(at);
        }
        if let Some(reason) = patch.failure_reason {
            entry.job.failure_reason = Some(reason);
        }
        if let Some(total) = patch.total_units {
            entry.job.total_units = total;
        }
        if let Some((phase, summary)) = patch.phase_summary {
            entry.job.phase_summaries.insert(phase, summary);
        }
        Ok(())
    }

    async fn increment_processed(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.job.processed += 1;
        Ok(())
    }

    async fn increment_failed(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.job.failed += 1;
        entry.job.processed += 1;
        Ok(())
    }

    async fn append_phase_result(
        &self,
        id: JobId,
        phase: Phase,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.phase_results.entry(phase).or_default().push(result);
        Ok(())
    }

    async fn list_phase_results(&self, id: JobId, phase: Phase) -> Result<Vec<serde_json::Value>, StoreError> {
        let inner = self.inner.read().await;
        let entry = inner.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(entry.phase_results.get(&phase).cloned().unwrap_or_default())
    }

    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .recent
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .take(limit)
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn cancel_job(&self, id: JobId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if entry.job.status.is_terminal() {
            return Ok(false);
        }
        entry.job.status = cdr_types::Status::Cancelled;
        entry.job.cancelled_at = Some(Utc::now());
        Ok(true)
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.jobs.remove(&id);
        inner.recent.retain(|existing| *existing != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdr_types::Status;

    fn enabled() -> BTreeSet<Phase> {
        BTreeSet::from([Phase::Cdr])
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = InMemoryJobStore::new(Duration::days(7));
        let id = JobId::new();
        store
            .create_job(id, "bucket".to_string(), vec!["a.pdf".to_string()], enabled(), Priority::Normal)
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.container_name, "bucket");
        assert_eq!(job.status, Status::Pending);
        assert_eq!(job.processed, 0);
    }

    #[tokio::test]
    async fn get_missing_job_errors() {
        let store = InMemoryJobStore::new(Duration::days(7));
        let err = store.get_job(JobId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn counters_are_monotonic_and_failed_counts_as_processed() {
        let store = InMemoryJobStore::new(Duration::days(7));
        let id = JobId::new();
        store
            .create_job(id, "bucket".to_string(), vec![], enabled(), Priority::Normal)
            .await
            .unwrap();

        store.increment_processed(id).await.unwrap();
        store.increment_failed(id).await.unwrap();

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.processed, 2);
        assert_eq!(job.failed, 1);
    }

    #[tokio::test]
    async fn update_job_rejected_after_terminal() {
        let store = InMemoryJobStore::new(Duration::days(7));
        let id = JobId::new();
        store
            .create_job(id, "bucket".to_string(), vec![], enabled(), Priority::Normal)
            .await
            .unwrap();

        store.update_job(id, JobPatch::new().status(Status::Completed)).await.unwrap();
        let err = store
            .update_job(id, JobPatch::new().status(Status::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Terminal(_)));
    }

    #[tokio::test]
    async fn cancel_job_fails_once_terminal() {
        let store = InMemoryJobStore::new(Duration::days(7));
        let id = JobId::new();
        store
            .create_job(id, "bucket".to_string(), vec![], enabled(), Priority::Normal)
            .await
            .unwrap();

        assert!(store.cancel_job(id).await.unwrap());
        assert!(!store.cancel_job(id).await.unwrap());
    }

    #[tokio::test]
    async fn phase_results_append_and_list_in_order() {
        let store = InMemoryJobStore::new(Duration::days(7));
        let id = JobId::new();
        store
            .create_job(id, "bucket".to_string(), vec![], enabled(), Priority::Normal)
            .await
            .unwrap();

        store
            .append_phase_result(id, Phase::Cdr, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        store
            .append_phase_result(id, Phase::Cdr, serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let results = store.list_phase_results(id, Phase::Cdr).await.unwrap();
        assert_eq!(results, vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]);
    }

    #[tokio::test]
    async fn recent_jobs_are_newest_first() {
        let store = InMemoryJobStore::new(Duration::days(7));
        let first = JobId::new();
        store
            .create_job(first, "bucket".to_string(), vec![], enabled(), Priority::Normal)
            .await
            .unwrap();
        let second = JobId::new();
        store
            .create_job(second, "bucket".to_string(), vec![], enabled(), Priority::Normal)
            .await
            .unwrap();

        let recent = store.list_recent_jobs(10).await.unwrap();
        assert_eq!(recent[0].id, second);
        assert_eq!(recent[1].id, first);
    }

    #[tokio::test]
    async fn reaper_evicts_jobs_past_ttl() {
        let store = Arc::new(InMemoryJobStore::new(Duration::milliseconds(-1)));
        let id = JobId::new();
        store
            .create_job(id, "bucket".to_string(), vec![], enabled(), Priority::Normal)
            .await
            .unwrap();

        store.reap_expired().await;
        let err = store.get_job(id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
