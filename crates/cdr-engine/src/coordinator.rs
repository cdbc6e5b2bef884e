use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdr_adapters::{AvEngine, BlobStore, CdrEngine, EdrConsole};
use cdr_store::{JobPatch, JobStore};
use cdr_types::config::PhaseConfig;
use cdr_types::{CoreError, JobId, Phase, Priority, Status};
use cdr_vmpool::VmPool;
use tokio::sync::Mutex;

use crate::phase1::{self, Phase1Deps};
use crate::phase2::{self, Phase2Deps};
use crate::phase3::{self, Phase3Deps};

/// Request body for submitting a new validation batch (§4.7, §6).
#[derive(Debug, Clone)]
pub struct BatchJobRequest {
    pub container_name: String,
    pub file_paths: Option<Vec<String>>,
    pub enabled_phases: BTreeSet<Phase>,
    pub priority: Priority,
}

/// Collaborators the coordinator wires phase runners with.
pub struct CoordinatorDeps {
    pub store: Arc<dyn JobStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub cdr_engines: Vec<Arc<dyn CdrEngine>>,
    pub av_engines: Vec<Arc<dyn AvEngine>>,
    pub edr_consoles: Vec<Arc<dyn EdrConsole>>,
    pub vm_pool: Arc<VmPool>,
    pub phase1_config: PhaseConfig,
    pub phase2_config: PhaseConfig,
    pub phase3_config: PhaseConfig,
}

/// Owns job lifecycle: accept a request, plan enabled phases, run them in
/// sequence, finalize the job (§4.7).
///
/// The phase engine owns live unit work and the VM pool exclusively owns VM
/// state; the coordinator's only persistent state is the cancellation flag
/// it hands each in-flight job's fan-out.
pub struct Coordinator {
    deps: CoordinatorDeps,
    running: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        Self { deps, running: Mutex::new(HashMap::new()) }
    }

    /// Accept a batch request, create its job record, and — if the phase
    /// plan is valid — spawn the background task that drives it to
    /// completion. Always returns a `JobId`, even for requests rejected at
    /// planning: the job is still queryable, just immediately `Failed`.
    pub async fn submit(self: &Arc<Self>, request: BatchJobRequest) -> Result<JobId, CoreError> {
        let job_id = JobId::new();
        let file_paths = request.file_paths.unwrap_or_default();

        self.deps
            .store
            .create_job(job_id, request.container_name, file_paths, request.enabled_phases.clone(), request.priority)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;

        if let Some(reason) = validate_plan(&request.enabled_phases) {
            tracing::warn!(%job_id, %reason, "rejecting job at planning");
            self.apply_patch(job_id, JobPatch::new().status(Status::Failed).failure_reason(reason).completed_now())
                .await;
            return Ok(job_id);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.running.lock().await.insert(job_id, Arc::clone(&cancelled));

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.drive(job_id, cancelled).await;
            coordinator.running.lock().await.remove(&job_id);
        });

        Ok(job_id)
    }

    /// Request cancellation. Returns `false` if the job is unknown or
    /// already terminal.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, CoreError> {
        if let Some(flag) = self.running.lock().await.get(&job_id) {
            flag.store(true, Ordering::SeqCst);
        }
        self.deps.store.cancel_job(job_id).await.map_err(|e| CoreError::StoreUnavailable(e.to_string()))
    }

    async fn drive(&self, job_id: JobId, cancelled: Arc<AtomicBool>) {
        self.apply_patch(job_id, JobPatch::new().status(Status::Running).started_now().current_phase(Phase::Cdr))
            .await;

        let job = match self.deps.store.get_job(job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(%job_id, error = %err, "job vanished before phase 1 could start");
                return;
            }
        };

        let files = phase1::resolve_files(&job.container_name, job.file_paths.clone(), self.deps.blob_store.as_ref()).await;
        let phase1_unit_count = files.len() as u64 * self.deps.cdr_engines.len() as u64;
        self.apply_patch(job_id, JobPatch::new().total_units(phase1_unit_count)).await;

        let phase1_deps = Phase1Deps {
            store: Arc::clone(&self.deps.store),
            blob_store: Arc::clone(&self.deps.blob_store),
            cdr_engines: self.deps.cdr_engines.clone(),
        };
        let phase1_results = phase1::run_phase1(
            job_id,
            job.container_name.clone(),
            files,
            &self.deps.phase1_config,
            &phase1_deps,
            Arc::clone(&cancelled),
        )
        .await;

        if !self.job_exists(job_id).await {
            return;
        }
        self.apply_patch(job_id, JobPatch::new().phase_summary(Phase::Cdr, to_summary(phase1::summarize(&phase1_results))))
            .await;

        if self.observed_cancelled(job_id).await {
            return;
        }

        if !job.enabled_phases.contains(&Phase::Av) {
            self.finalize_completed(job_id).await;
            return;
        }

        self.apply_patch(job_id, JobPatch::new().current_phase(Phase::Av)).await;
        let phase2_deps = Phase2Deps {
            store: Arc::clone(&self.deps.store),
            blob_store: Arc::clone(&self.deps.blob_store),
            av_engines: self.deps.av_engines.clone(),
        };
        let phase2_results = phase2::run_phase2(
            job_id,
            job.container_name.clone(),
            &phase1_results,
            &self.deps.phase2_config,
            &phase2_deps,
            Arc::clone(&cancelled),
        )
        .await;

        if !self.advance_total_units(job_id, phase2_results.len() as u64).await {
            return;
        }
        self.apply_patch(job_id, JobPatch::new().phase_summary(Phase::Av, to_summary(phase2::summarize(&phase2_results))))
            .await;

        if self.observed_cancelled(job_id).await {
            return;
        }

        if !job.enabled_phases.contains(&Phase::Edr) {
            self.finalize_completed(job_id).await;
            return;
        }

        self.apply_patch(job_id, JobPatch::new().current_phase(Phase::Edr)).await;
        let phase3_deps = Phase3Deps {
            store: Arc::clone(&self.deps.store),
            blob_store: Arc::clone(&self.deps.blob_store),
            edr_consoles: self.deps.edr_consoles.clone(),
            vm_pool: Arc::clone(&self.deps.vm_pool),
        };
        let phase3_results = phase3::run_phase3(
            job_id,
            job.container_name.clone(),
            &phase1_results,
            &self.deps.phase3_config,
            &phase3_deps,
            Arc::clone(&cancelled),
        )
        .await;

        if !self.advance_total_units(job_id, phase3_results.len() as u64).await {
            return;
        }
        self.apply_patch(job_id, JobPatch::new().phase_summary(Phase::Edr, to_summary(phase3::summarize(&phase3_results))))
            .await;

        if self.observed_cancelled(job_id).await {
            return;
        }

        self.finalize_completed(job_id).await;
    }

    async fn job_exists(&self, job_id: JobId) -> bool {
        match self.deps.store.get_job(job_id).await {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(%job_id, error = %err, "job vanished mid-phase");
                false
            }
        }
    }

    async fn advance_total_units(&self, job_id: JobId, phase_units: u64) -> bool {
        let job = match self.deps.store.get_job(job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(%job_id, error = %err, "job vanished mid-phase");
                return false;
            }
        };
        let total = job.total_units + phase_units;
        self.apply_patch(job_id, JobPatch::new().total_units(total)).await;
        true
    }

    async fn observed_cancelled(&self, job_id: JobId) -> bool {
        matches!(self.deps.store.get_job(job_id).await, Ok(job) if job.status == Status::Cancelled)
    }

    async fn finalize_completed(&self, job_id: JobId) {
        self.apply_patch(job_id, JobPatch::new().status(Status::Completed).completed_now()).await;
    }

    async fn apply_patch(&self, job_id: JobId, patch: JobPatch) {
        if let Err(err) = self.deps.store.update_job(job_id, patch).await {
            tracing::warn!(%job_id, error = %err, "job update rejected (likely already terminal)");
        }
    }
}

fn to_summary(value: serde_json::Value) -> cdr_types::PhaseSummary {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => std::iter::once(("value".to_string(), other)).collect(),
    }
}

/// §4.7 / §9: phases 2 or 3 requested without phase 1 would leave Phase 2
/// planning with no Phase-1 results to build a file plan from — reject
/// before any unit is dispatched.
fn validate_plan(enabled_phases: &BTreeSet<Phase>) -> Option<String> {
    let needs_cdr = enabled_phases.contains(&Phase::Av) || enabled_phases.contains(&Phase::Edr);
    if needs_cdr && !enabled_phases.contains(&Phase::Cdr) {
        return Some("phase 2 or 3 requested without phase 1".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdr_adapters::mock::{MockAvEngine, MockBlobStore, MockCdrEngine, MockEdrConsole, MockVmBackend};
    use cdr_store::InMemoryJobStore;
    use cdr_types::config::PoolConfig;
    use std::time::Duration;

    fn fast_phase_config() -> PhaseConfig {
        PhaseConfig {
            vm_acquire_timeout_sec: 1,
            interaction_duration_sec: 0,
            settle_delay_sec: 0,
            retry_delay_sec: 0,
            ..PhaseConfig::default()
        }
    }

    fn coordinator_with(labels: &[&str]) -> (Arc<Coordinator>, Arc<dyn JobStore>) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(chrono::Duration::days(7)));
        let blob_store = Arc::new(MockBlobStore::new());
        blob_store.seed("bucket", "a.pdf", b"content-a".to_vec());
        blob_store.seed("bucket", "b.docx", b"content-b".to_vec());

        let vm_pool = Arc::new(VmPool::new(
            &labels.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
            PoolConfig { pool_size: 1, ..PoolConfig::default() },
            Arc::new(MockVmBackend::new()),
        ));

        let deps = CoordinatorDeps {
            store: Arc::clone(&store),
            blob_store,
            cdr_engines: vec![Arc::new(MockCdrEngine::new("engine-a")), Arc::new(MockCdrEngine::new("engine-b"))],
            av_engines: vec![Arc::new(MockAvEngine::new("defender")), Arc::new(MockAvEngine::new("sentinel"))],
            edr_consoles: labels.iter().map(|l| Arc::new(MockEdrConsole::new(*l)) as Arc<dyn EdrConsole>).collect(),
            vm_pool,
            phase1_config: fast_phase_config(),
            phase2_config: fast_phase_config(),
            phase3_config: fast_phase_config(),
        };
        (Arc::new(Coordinator::new(deps)), store)
    }

    #[tokio::test]
    async fn happy_path_runs_all_three_phases_to_completion() {
        let (coordinator, store) = coordinator_with(&["crowdstrike", "sentinelone"]);
        coordinator.deps.vm_pool.initialize().await;

        let job_id = coordinator
            .submit(BatchJobRequest {
                container_name: "bucket".to_string(),
                file_paths: Some(vec!["a.pdf".to_string(), "b.docx".to_string()]),
                enabled_phases: BTreeSet::from([Phase::Cdr, Phase::Av, Phase::Edr]),
                priority: Priority::Normal,
            })
            .await
            .unwrap();

        let job = wait_for_terminal(&store, job_id).await;
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.progress_percent(), 100.0);
        assert_eq!(job.processed, job.total_units);

        let phase1_count = store.list_phase_results(job_id, Phase::Cdr).await.unwrap().len();
        let phase2_count = store.list_phase_results(job_id, Phase::Av).await.unwrap().len();
        let phase3_count = store.list_phase_results(job_id, Phase::Edr).await.unwrap().len();
        assert_eq!(phase1_count, 4);
        assert_eq!(phase2_count, 12);
        assert_eq!(phase3_count, 12);
    }

    #[tokio::test]
    async fn phase_2_without_phase_1_is_rejected_at_planning() {
        let (coordinator, store) = coordinator_with(&["crowdstrike"]);
        let job_id = coordinator
            .submit(BatchJobRequest {
                container_name: "bucket".to_string(),
                file_paths: Some(vec!["a.pdf".to_string()]),
                enabled_phases: BTreeSet::from([Phase::Av]),
                priority: Priority::Normal,
            })
            .await
            .unwrap();

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, Status::Failed);
        assert!(job.failure_reason.is_some());
    }

    #[tokio::test]
    async fn cdr_only_job_completes_after_phase_1() {
        let (coordinator, store) = coordinator_with(&["crowdstrike"]);
        let job_id = coordinator
            .submit(BatchJobRequest {
                container_name: "bucket".to_string(),
                file_paths: Some(vec!["a.pdf".to_string()]),
                enabled_phases: BTreeSet::from([Phase::Cdr]),
                priority: Priority::Low,
            })
            .await
            .unwrap();

        let job = wait_for_terminal(&store, job_id).await;
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.total_units, 2); // 1 file * 2 cdr engines
    }

    async fn wait_for_terminal(store: &Arc<dyn JobStore>, job_id: JobId) -> cdr_types::Job {
        for _ in 0..200 {
            let job = store.get_job(job_id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not reach a terminal status in time");
    }
}
