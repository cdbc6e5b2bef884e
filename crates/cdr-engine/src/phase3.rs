use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdr_adapters::{BlobStore, EdrConsole};
use cdr_store::JobStore;
use cdr_types::config::PhaseConfig;
use cdr_types::{JobId, Phase, Phase1Result, Phase3Result, UnitStatus};
use cdr_vmpool::{VmLease, VmPool};
use chrono::Utc;

use crate::fan_out::{race_cancellation, run_fan_out};
use crate::plan::{plan_files, PlannedFile};

const SAMPLE_ALERTS_LIMIT: usize = 10;
const COPY_SCRIPT: &str = "cdr-validate-copy";
const EXECUTE_SCRIPT: &str = "cdr-validate-execute";

pub struct Phase3Deps {
    pub store: Arc<dyn JobStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub edr_consoles: Vec<Arc<dyn EdrConsole>>,
    pub vm_pool: Arc<VmPool>,
}

/// Run Phase 3 (EDR) to completion and return every unit result (§4.6).
///
/// Each unit brokers its own VM: one label's pool has no bearing on another's
/// concurrency, since the fan-out bound here is process-wide while the VM
/// pool is the real per-label gate.
pub async fn run_phase3(
    job_id: JobId,
    container: String,
    phase1_results: &[Phase1Result],
    config: &PhaseConfig,
    deps: &Phase3Deps,
    cancelled: Arc<AtomicBool>,
) -> Vec<Phase3Result> {
    let plan = plan_files(phase1_results);
    let units: Vec<(PlannedFile, Arc<dyn EdrConsole>)> = plan
        .iter()
        .flat_map(|file| deps.edr_consoles.iter().map(move |console| (file.clone(), Arc::clone(console))))
        .collect();

    let store = Arc::clone(&deps.store);
    let blob_store = Arc::clone(&deps.blob_store);
    let vm_pool = Arc::clone(&deps.vm_pool);
    let config = config.clone();
    let container = container.clone();

    run_fan_out(units, config.max_concurrency, cancelled, move |(file, console), cancelled| {
        let store = Arc::clone(&store);
        let blob_store = Arc::clone(&blob_store);
        let vm_pool = Arc::clone(&vm_pool);
        let config = config.clone();
        let container = container.clone();
        async move {
            process_unit(
                job_id,
                &container,
                file,
                console.as_ref(),
                store.as_ref(),
                blob_store.as_ref(),
                vm_pool.as_ref(),
                &config,
                cancelled,
            )
            .await
        }
    })
    .await
    .into_iter()
    .flatten()
    .collect()
}

/// Aggregate the per-label and overall alert-reduction figures described in
/// §4.6.
pub fn summarize(results: &[Phase3Result]) -> serde_json::Value {
    let mut by_label: std::collections::BTreeMap<String, (u32, u32, u32)> = std::collections::BTreeMap::new();
    for r in results {
        let entry = by_label.entry(r.edr_console.clone()).or_insert((0, 0, 0));
        entry.2 += 1;
        match r.version {
            cdr_types::Version::PreCdr if r.edr_detected => entry.0 += 1,
            cdr_types::Version::PostCdr if r.edr_detected => entry.1 += 1,
            _ => {}
        }
    }

    let mut labels = serde_json::Map::new();
    let (mut total_pre, mut total_post, mut total_tests) = (0u32, 0u32, 0u32);
    for (label, (pre, post, tests)) in &by_label {
        total_pre += pre;
        total_post += post;
        total_tests += tests;
        let reduction = pre.saturating_sub(*post);
        let reduction_percent = if *pre == 0 { 0.0 } else { 100.0 * reduction as f64 / *pre as f64 };
        labels.insert(
            label.clone(),
            serde_json::json!({
                "tests_performed": tests,
                "pre_cdr_alerts": pre,
                "post_cdr_alerts": post,
                "alert_reduction": reduction,
                "alert_reduction_percent": reduction_percent,
            }),
        );
    }

    let overall_reduction = total_pre.saturating_sub(total_post);
    let overall_reduction_percent = if total_pre == 0 { 0.0 } else { 100.0 * overall_reduction as f64 / total_pre as f64 };

    serde_json::json!({
        "labels": labels,
        "pre_cdr_alerts": total_pre,
        "post_cdr_alerts": total_post,
        "alert_reduction": overall_reduction,
        "alert_reduction_percent": overall_reduction_percent,
    })
}

fn scratch_path(job_id: JobId, blob_path: &str) -> PathBuf {
    let file_name = std::path::Path::new(blob_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    std::env::temp_dir()
        .join(format!("cdr-validate-{job_id}"))
        .join(uuid::Uuid::new_v4().to_string())
        .join(file_name)
}

enum Outcome {
    Detonated { execution_start: chrono::DateTime<Utc>, execution_end: chrono::DateTime<Utc>, alerts: Vec<cdr_adapters::AlertRecord> },
    Failed(String),
    Cancelled,
}

/// A leased VM is itself the external resource (§7); once acquired, any
/// cancellation during detonation or the retry delay still records a
/// `Cancelled` unit and still releases the lease.
#[allow(clippy::too_many_arguments)]
async fn process_unit(
    job_id: JobId,
    container: &str,
    file: PlannedFile,
    edr_console: &dyn EdrConsole,
    store: &dyn JobStore,
    blob_store: &dyn BlobStore,
    vm_pool: &VmPool,
    config: &PhaseConfig,
    cancelled: Arc<AtomicBool>,
) -> Option<Phase3Result> {
    if cancelled.load(Ordering::SeqCst) {
        return None;
    }

    let label = edr_console.label();

    let lease = match race_cancellation(cancelled.as_ref(), vm_pool.acquire(label, Duration::from_secs(config.vm_acquire_timeout_sec)))
        .await
    {
        None => return None, // cancelled while still queued for a VM; nothing was leased
        Some(Err(err)) => {
            let result = error_result(&file, label, "", err.to_string(), 0);
            record(job_id, store, result.clone()).await;
            return Some(result);
        }
        Some(Ok(lease)) => lease,
    };

    let mut retries = 0u32;
    let outcome = loop {
        if cancelled.load(Ordering::SeqCst) {
            break Outcome::Cancelled;
        }

        let detonation = run_detonation(job_id, container, &file, edr_console, blob_store, vm_pool.backend().as_ref(), &lease, config);
        let watched = with_soft_timeout(config, job_id, &file.blob_path, detonation);
        let attempt = match race_cancellation(cancelled.as_ref(), watched).await {
            None => break Outcome::Cancelled,
            Some(outcome) => outcome,
        };

        match attempt {
            Outcome::Detonated { .. } => break attempt,
            Outcome::Cancelled => break attempt,
            Outcome::Failed(_) if retries < config.max_retries => {
                retries += 1;
                let delay = tokio::time::sleep(Duration::from_secs(config.retry_delay_sec));
                if race_cancellation(cancelled.as_ref(), delay).await.is_none() {
                    break Outcome::Cancelled;
                }
            }
            Outcome::Failed(_) => break attempt,
        }
    };

    // VM release happens on every exit path regardless of detonation outcome.
    let _ = vm_pool.release(lease.clone(), true).await;

    let result = match outcome {
        Outcome::Detonated { execution_start, execution_end, alerts } => {
            let alert_types: BTreeSet<String> = alerts.iter().map(|a| a.threat_type.clone()).collect();
            let high_severity_count = alerts.iter().filter(|a| is_high_severity(&a.severity)).count() as u32;
            let sample_alerts = alerts.iter().take(SAMPLE_ALERTS_LIMIT).map(|a| a.raw.clone()).collect();
            Phase3Result {
                blob_path: file.blob_path.clone(),
                version: file.version,
                cdr_engine: file.cdr_engine.clone(),
                original_blob_path: file.original_path.clone(),
                edr_console: label.to_string(),
                vm_name: lease.vm_name.clone(),
                execution_start,
                execution_end,
                alert_count: alerts.len() as u32,
                high_severity_count,
                alert_types,
                sample_alerts,
                edr_detected: Phase3Result::compute_detected(alerts.len() as u32),
                status: UnitStatus::Success,
                retries,
                error: None,
            }
        }
        Outcome::Failed(message) => error_result(&file, label, &lease.vm_name, message, retries),
        Outcome::Cancelled => cancelled_result(&file, label, &lease.vm_name, retries),
    };

    record(job_id, store, result.clone()).await;
    Some(result)
}

fn is_high_severity(severity: &str) -> bool {
    matches!(severity.to_ascii_lowercase().as_str(), "high" | "critical")
}

fn error_result(file: &PlannedFile, label: &str, vm_name: &str, message: String, retries: u32) -> Phase3Result {
    let now = Utc::now();
    Phase3Result {
        blob_path: file.blob_path.clone(),
        version: file.version,
        cdr_engine: file.cdr_engine.clone(),
        original_blob_path: file.original_path.clone(),
        edr_console: label.to_string(),
        vm_name: vm_name.to_string(),
        execution_start: now,
        execution_end: now,
        alert_count: 0,
        high_severity_count: 0,
        alert_types: BTreeSet::new(),
        sample_alerts: Vec::new(),
        edr_detected: false,
        status: UnitStatus::Error,
        retries,
        error: Some(message),
    }
}

fn cancelled_result(file: &PlannedFile, label: &str, vm_name: &str, retries: u32) -> Phase3Result {
    let now = Utc::now();
    Phase3Result {
        blob_path: file.blob_path.clone(),
        version: file.version,
        cdr_engine: file.cdr_engine.clone(),
        original_blob_path: file.original_path.clone(),
        edr_console: label.to_string(),
        vm_name: vm_name.to_string(),
        execution_start: now,
        execution_end: now,
        alert_count: 0,
        high_severity_count: 0,
        alert_types: BTreeSet::new(),
        sample_alerts: Vec::new(),
        edr_detected: false,
        status: UnitStatus::Cancelled,
        retries,
        error: Some("cancelled".to_string()),
    }
}

async fn record(job_id: JobId, store: &dyn JobStore, result: Phase3Result) {
    if result.status == UnitStatus::Success {
        let _ = store.increment_processed(job_id).await;
    } else {
        let _ = store.increment_failed(job_id).await;
    }
    let _ = store
        .append_phase_result(job_id, Phase::Edr, serde_json::to_value(&result).expect("Phase3Result always serializes"))
        .await;
}

/// Bounds one detonation attempt with the phase's soft/hard timeouts (§5):
/// the soft timeout only warns, the hard timeout converts an overrun into a
/// retry-eligible `Failed` outcome.
async fn with_soft_timeout(config: &PhaseConfig, job_id: JobId, label: &str, fut: impl std::future::Future<Output = Outcome>) -> Outcome {
    let soft_timeout = Duration::from_secs(config.soft_timeout_sec);
    let hard_timeout = Duration::from_secs(config.hard_timeout_sec);

    tokio::pin!(fut);
    let soft_watched = async {
        match tokio::time::timeout(soft_timeout, &mut fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(%job_id, %label, soft_timeout_sec = config.soft_timeout_sec, "unit exceeded soft timeout");
                fut.await
            }
        }
    };

    match tokio::time::timeout(hard_timeout, soft_watched).await {
        Ok(outcome) => outcome,
        Err(_) => Outcome::Failed(format!("unit exceeded hard timeout of {}s", config.hard_timeout_sec)),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_detonation(
    job_id: JobId,
    container: &str,
    file: &PlannedFile,
    edr_console: &dyn EdrConsole,
    blob_store: &dyn BlobStore,
    backend: &dyn cdr_adapters::VmBackend,
    lease: &VmLease,
    config: &PhaseConfig,
) -> Outcome {
    match run_detonation_inner(job_id, container, file, edr_console, blob_store, backend, lease, config).await {
        Ok(outcome) => outcome,
        Err(err) => Outcome::Failed(err.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_detonation_inner(
    job_id: JobId,
    container: &str,
    file: &PlannedFile,
    edr_console: &dyn EdrConsole,
    blob_store: &dyn BlobStore,
    backend: &dyn cdr_adapters::VmBackend,
    lease: &VmLease,
    config: &PhaseConfig,
) -> Result<Outcome, cdr_adapters::AdapterError> {
    let scratch = scratch_path(job_id, &file.blob_path);
    if let Some(parent) = scratch.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| cdr_adapters::AdapterError::Other {
            adapter: "scratch".to_string(),
            message: format!("creating {}: {e}", parent.display()),
        })?;
    }
    blob_store.download(container, &file.blob_path, &scratch).await?;

    let copy_result = tokio::fs::read(&scratch).await.map(|bytes| bytes.len());
    if let Some(scratch_dir) = scratch.parent() {
        let _ = tokio::fs::remove_dir_all(scratch_dir).await;
    }
    let bytes = copy_result.map_err(|e| cdr_adapters::AdapterError::Other {
        adapter: "scratch".to_string(),
        message: e.to_string(),
    })?;

    let copy_script = format!("{COPY_SCRIPT}:{}:{}", file.blob_path, bytes);
    let copy_output = backend.run_command(&lease.vm_name, &copy_script).await?;
    if !copy_output.succeeded() {
        return Err(cdr_adapters::AdapterError::Other {
            adapter: "vm-copy".to_string(),
            message: copy_output.stderr,
        });
    }

    let execution_start = Utc::now();
    let exec_output = backend.run_command(&lease.vm_name, EXECUTE_SCRIPT).await?;
    if !exec_output.succeeded() {
        return Err(cdr_adapters::AdapterError::Other {
            adapter: "vm-execute".to_string(),
            message: exec_output.stderr,
        });
    }
    if config.interaction_duration_sec > 0 {
        tokio::time::sleep(Duration::from_secs(config.interaction_duration_sec)).await;
    }
    let execution_end = Utc::now();

    if config.settle_delay_sec > 0 {
        tokio::time::sleep(Duration::from_secs(config.settle_delay_sec)).await;
    }

    let query_to = execution_end + chrono::Duration::seconds(60);
    let alerts = edr_console.get_alerts(&lease.vm_name, execution_start, query_to).await?;

    Ok(Outcome::Detonated { execution_start, execution_end, alerts })
}
