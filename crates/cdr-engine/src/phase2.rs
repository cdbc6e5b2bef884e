use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdr_adapters::{AdapterError, AvEngine, BlobStore};
use cdr_store::JobStore;
use cdr_types::config::PhaseConfig;
use cdr_types::{JobId, Phase, Phase1Result, Phase2Result, UnitStatus};
use chrono::Utc;

use crate::fan_out::{race_cancellation, run_fan_out};
use crate::plan::{plan_files, PlannedFile};

pub struct Phase2Deps {
    pub store: Arc<dyn JobStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub av_engines: Vec<Arc<dyn AvEngine>>,
}

/// Run Phase 2 (AV) to completion and return every unit result (§4.5).
pub async fn run_phase2(
    job_id: JobId,
    container: String,
    phase1_results: &[Phase1Result],
    config: &PhaseConfig,
    deps: &Phase2Deps,
    cancelled: Arc<AtomicBool>,
) -> Vec<Phase2Result> {
    let plan = plan_files(phase1_results);
    let units: Vec<(PlannedFile, Arc<dyn AvEngine>)> = plan
        .iter()
        .flat_map(|file| deps.av_engines.iter().map(move |engine| (file.clone(), Arc::clone(engine))))
        .collect();

    let store = Arc::clone(&deps.store);
    let blob_store = Arc::clone(&deps.blob_store);
    let config = config.clone();

    run_fan_out(units, config.max_concurrency, cancelled, move |(file, engine), cancelled| {
        let store = Arc::clone(&store);
        let blob_store = Arc::clone(&blob_store);
        let container = container.clone();
        let config = config.clone();
        async move {
            process_unit(job_id, &container, file, engine.as_ref(), store.as_ref(), blob_store.as_ref(), &config, cancelled).await
        }
    })
    .await
    .into_iter()
    .flatten()
    .collect()
}

/// Aggregate the pre/post-CDR detection counts described in §4.5.
pub fn summarize(results: &[Phase2Result]) -> serde_json::Value {
    let pre_detections = results
        .iter()
        .filter(|r| r.version == cdr_types::Version::PreCdr && r.is_malicious)
        .count();
    let post_detections = results
        .iter()
        .filter(|r| r.version == cdr_types::Version::PostCdr && r.is_malicious)
        .count();
    let reduction = pre_detections.saturating_sub(post_detections);
    let reduction_percent = if pre_detections == 0 {
        0.0
    } else {
        100.0 * reduction as f64 / pre_detections as f64
    };
    serde_json::json!({
        "pre_cdr_detections": pre_detections,
        "post_cdr_detections": post_detections,
        "detection_reduction": reduction,
        "detection_reduction_percent": reduction_percent,
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

enum Attempt {
    Done(cdr_adapters::AvOutcome),
    Failed(AdapterError),
    Cancelled { resources_consumed: bool },
}

#[allow(clippy::too_many_arguments)]
async fn process_unit(
    job_id: JobId,
    container: &str,
    file: PlannedFile,
    av_engine: &dyn AvEngine,
    store: &dyn JobStore,
    blob_store: &dyn BlobStore,
    config: &PhaseConfig,
    cancelled: Arc<AtomicBool>,
) -> Option<Phase2Result> {
    if cancelled.load(Ordering::SeqCst) {
        return None;
    }

    let started_at = Utc::now();
    let scratch = scratch_path(job_id, &file.blob_path);

    let unit_attempt = attempt(&scratch, container, &file.blob_path, av_engine, blob_store, cancelled.as_ref());
    let attempt = run_with_timeouts(config, job_id, &file.blob_path, unit_attempt).await;

    if let Some(scratch_dir) = scratch.parent() {
        let _ = tokio::fs::remove_dir_all(scratch_dir).await;
    }

    let result = match attempt {
        Attempt::Cancelled { resources_consumed: false } => return None,
        Attempt::Cancelled { resources_consumed: true } => Phase2Result {
            blob_path: file.blob_path.clone(),
            version: file.version,
            cdr_engine: file.cdr_engine.clone(),
            original_blob_path: file.original_path.clone(),
            av_engine: av_engine.label().to_string(),
            is_malicious: false,
            threat_name: None,
            confidence: 0,
            scan_millis: 0,
            engine_version: String::new(),
            status: UnitStatus::Cancelled,
            error: Some("cancelled".to_string()),
            started_at,
            ended_at: Utc::now(),
        },
        Attempt::Done(outcome) => Phase2Result {
            blob_path: file.blob_path.clone(),
            version: file.version,
            cdr_engine: file.cdr_engine.clone(),
            original_blob_path: file.original_path.clone(),
            av_engine: av_engine.label().to_string(),
            is_malicious: outcome.is_malicious,
            threat_name: outcome.threat_name,
            confidence: outcome.confidence,
            scan_millis: outcome.ms,
            engine_version: outcome.engine_version,
            status: UnitStatus::Success,
            error: None,
            started_at,
            ended_at: Utc::now(),
        },
        Attempt::Failed(err) => Phase2Result {
            blob_path: file.blob_path.clone(),
            version: file.version,
            cdr_engine: file.cdr_engine.clone(),
            original_blob_path: file.original_path.clone(),
            av_engine: av_engine.label().to_string(),
            is_malicious: false,
            threat_name: None,
            confidence: 0,
            scan_millis: 0,
            engine_version: String::new(),
            status: UnitStatus::Error,
            error: Some(err.to_string()),
            started_at,
            ended_at: Utc::now(),
        },
    };

    if result.status == UnitStatus::Success {
        let _ = store.increment_processed(job_id).await;
    } else {
        let _ = store.increment_failed(job_id).await;
    }
    let _ = store
        .append_phase_result(job_id, Phase::Av, serde_json::to_value(&result).expect("Phase2Result always serializes"))
        .await;

    Some(result)
}

/// The download/scan chain, racing the cancellation flag at each suspension
/// point (§5).
async fn attempt(
    scratch: &PathBuf,
    container: &str,
    blob_path: &str,
    av_engine: &dyn AvEngine,
    blob_store: &dyn BlobStore,
    cancelled: &AtomicBool,
) -> Attempt {
    if let Some(parent) = scratch.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return Attempt::Failed(AdapterError::Other {
                adapter: "scratch".to_string(),
                message: format!("creating {}: {e}", parent.display()),
            });
        }
    }

    match race_cancellation(cancelled, blob_store.download(container, blob_path, scratch)).await {
        None => return Attempt::Cancelled { resources_consumed: false },
        Some(Err(err)) => return Attempt::Failed(err),
        Some(Ok(_bytes)) => (),
    }

    match race_cancellation(cancelled, av_engine.scan(scratch)).await {
        None => Attempt::Cancelled { resources_consumed: true },
        Some(Err(err)) => Attempt::Failed(err),
        Some(Ok(outcome)) => Attempt::Done(outcome),
    }
}

/// Bounds a unit's `attempt` with the phase's soft/hard timeouts (§5): the
/// soft timeout only warns, the hard timeout converts an overrun into an
/// `Error` result.
async fn run_with_timeouts(
    config: &PhaseConfig,
    job_id: JobId,
    blob_path: &str,
    fut: impl std::future::Future<Output = Attempt>,
) -> Attempt {
    let soft_timeout = Duration::from_secs(config.soft_timeout_sec);
    let hard_timeout = Duration::from_secs(config.hard_timeout_sec);

    tokio::pin!(fut);
    let watched = async {
        match tokio::time::timeout(soft_timeout, &mut fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(%job_id, path = blob_path, soft_timeout_sec = config.soft_timeout_sec, "unit exceeded soft timeout");
                fut.await
            }
        }
    };

    match tokio::time::timeout(hard_timeout, watched).await {
        Ok(outcome) => outcome,
        Err(_) => Attempt::Failed(AdapterError::Other {
            adapter: "timeout".to_string(),
            message: format!("unit exceeded hard timeout of {}s", config.hard_timeout_sec),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdr_adapters::mock::{MockAvEngine, MockBlobStore};
    use cdr_store::InMemoryJobStore;
    use cdr_types::Priority;
    use std::collections::BTreeSet as Set;

    fn phase1_success(original: &str, engine: &str, sanitized: &str) -> Phase1Result {
        Phase1Result {
            original_blob_path: original.to_string(),
            cdr_engine: engine.to_string(),
            sanitized_blob_path: Some(sanitized.to_string()),
            status: UnitStatus::Success,
            processing_millis: 5,
            bytes_before: 10,
            bytes_after: 8,
            threats_found: 1,
            error: None,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fans_out_pre_and_post_cdr_across_av_engines() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(chrono::Duration::days(7)));
        let job_id = JobId::new();
        store
            .create_job(job_id, "bucket".to_string(), vec![], Set::from([Phase::Av]), Priority::Normal)
            .await
            .unwrap();

        let blob_store = Arc::new(MockBlobStore::new());
        blob_store.seed("bucket", "a.pdf", b"clean".to_vec());
        blob_store.seed("bucket", "post-cdr/engine-a/a.pdf", b"clean-sanitized".to_vec());

        let phase1_results = vec![phase1_success("a.pdf", "engine-a", "post-cdr/engine-a/a.pdf")];
        let deps = Phase2Deps {
            store: Arc::clone(&store),
            blob_store,
            av_engines: vec![Arc::new(MockAvEngine::new("defender")), Arc::new(MockAvEngine::new("sentinel"))],
        };

        let results = run_phase2(
            job_id,
            "bucket".to_string(),
            &phase1_results,
            &PhaseConfig::default(),
            &deps,
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        // 1 pre + 1 post, times 2 AV engines
        assert_eq!(results.len(), 4);
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.processed, 4);
    }

    #[tokio::test]
    async fn cancellation_before_download_drops_the_unit_silently() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(chrono::Duration::days(7)));
        let job_id = JobId::new();
        store
            .create_job(job_id, "bucket".to_string(), vec![], Set::from([Phase::Av]), Priority::Normal)
            .await
            .unwrap();

        let blob_store = Arc::new(MockBlobStore::new());
        blob_store.seed("bucket", "a.pdf", b"clean".to_vec());
        blob_store.seed("bucket", "post-cdr/engine-a/a.pdf", b"clean-sanitized".to_vec());

        let phase1_results = vec![phase1_success("a.pdf", "engine-a", "post-cdr/engine-a/a.pdf")];
        let deps = Phase2Deps {
            store: Arc::clone(&store),
            blob_store,
            av_engines: vec![Arc::new(MockAvEngine::new("defender"))],
        };

        let results = run_phase2(
            job_id,
            "bucket".to_string(),
            &phase1_results,
            &PhaseConfig::default(),
            &deps,
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        assert!(results.is_empty());
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.processed, 0);
    }
}
