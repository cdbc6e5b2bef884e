use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdr_adapters::{blob_store::post_cdr_path, AdapterError, BlobStore, CdrEngine, SanitizeStatus};
use cdr_store::JobStore;
use cdr_types::config::PhaseConfig;
use cdr_types::{JobId, Phase, Phase1Result, UnitStatus};
use chrono::Utc;

use crate::fan_out::{race_cancellation, run_fan_out};

/// Everything Phase 1 needs that isn't already part of the job record.
pub struct Phase1Deps {
    pub store: Arc<dyn JobStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub cdr_engines: Vec<Arc<dyn CdrEngine>>,
}

/// Resolve the container's file list: the job's explicit `file_paths` if any
/// were given, otherwise every blob the container currently holds. Exposed
/// so the coordinator can size Phase 1's unit count — and patch
/// `total_units` to it — before any unit is dispatched (§3, §8 P1/P7).
pub async fn resolve_files(container: &str, file_paths: Vec<String>, blob_store: &dyn BlobStore) -> Vec<String> {
    if file_paths.is_empty() {
        blob_store.list(container, None).await.unwrap_or_default()
    } else {
        file_paths
    }
}

/// Run Phase 1 (CDR) to completion and return every unit result (§4.4).
///
/// `files` must already be resolved (see [`resolve_files`]) so that the
/// caller can learn the exact unit count before this function ever touches
/// the store or dispatches work.
pub async fn run_phase1(
    job_id: JobId,
    container: String,
    files: Vec<String>,
    config: &PhaseConfig,
    deps: &Phase1Deps,
    cancelled: Arc<AtomicBool>,
) -> Vec<Phase1Result> {
    let units: Vec<(String, Arc<dyn CdrEngine>)> = files
        .iter()
        .flat_map(|path| deps.cdr_engines.iter().map(move |engine| (path.clone(), Arc::clone(engine))))
        .collect();

    let store = Arc::clone(&deps.store);
    let blob_store = Arc::clone(&deps.blob_store);
    let container = container.clone();
    let config = config.clone();

    run_fan_out(units, config.max_concurrency, cancelled, move |(path, engine), cancelled| {
        let store = Arc::clone(&store);
        let blob_store = Arc::clone(&blob_store);
        let container = container.clone();
        let config = config.clone();
        async move {
            process_unit(job_id, &container, &path, engine.as_ref(), store.as_ref(), blob_store.as_ref(), &config, cancelled)
                .await
        }
    })
    .await
    .into_iter()
    .flatten()
    .collect()
}

/// Aggregate a Phase-1 unit-result list into the §4.4 completion summary.
pub fn summarize(results: &[Phase1Result]) -> serde_json::Value {
    let success = results.iter().filter(|r| r.status == UnitStatus::Success).count();
    let failed = results.iter().filter(|r| r.status == UnitStatus::Failed).count();
    let error = results.iter().filter(|r| r.status == UnitStatus::Error).count();
    serde_json::json!({
        "total": results.len(),
        "success": success,
        "failed": failed,
        "error": error,
    })
}

fn scratch_path(job_id: JobId, original_path: &str) -> PathBuf {
    let file_name = std::path::Path::new(original_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    std::env::temp_dir()
        .join(format!("cdr-validate-{job_id}"))
        .join(uuid::Uuid::new_v4().to_string())
        .join(file_name)
}

enum Attempt {
    Done(cdr_adapters::CdrOutcome),
    Failed(AdapterError),
    Cancelled { resources_consumed: bool },
}

#[allow(clippy::too_many_arguments)]
async fn process_unit(
    job_id: JobId,
    container: &str,
    original_path: &str,
    cdr_engine: &dyn CdrEngine,
    store: &dyn JobStore,
    blob_store: &dyn BlobStore,
    config: &PhaseConfig,
    cancelled: Arc<AtomicBool>,
) -> Option<Phase1Result> {
    if cancelled.load(Ordering::SeqCst) {
        return None;
    }

    let started_at = Utc::now();
    let scratch = scratch_path(job_id, original_path);

    let unit_attempt = attempt(&scratch, container, original_path, cdr_engine, blob_store, cancelled.as_ref());
    let attempt = run_with_timeouts(config, job_id, original_path, unit_attempt).await;

    if let Some(scratch_dir) = scratch.parent() {
        let _ = tokio::fs::remove_dir_all(scratch_dir).await;
    }

    let result = match attempt {
        Attempt::Cancelled { resources_consumed: false } => return None,
        Attempt::Cancelled { resources_consumed: true } => Phase1Result {
            original_blob_path: original_path.to_string(),
            cdr_engine: cdr_engine.label().to_string(),
            sanitized_blob_path: None,
            status: UnitStatus::Cancelled,
            processing_millis: 0,
            bytes_before: 0,
            bytes_after: 0,
            threats_found: 0,
            error: Some("cancelled".to_string()),
            started_at,
            ended_at: Utc::now(),
        },
        Attempt::Done(outcome) => Phase1Result {
            original_blob_path: original_path.to_string(),
            cdr_engine: cdr_engine.label().to_string(),
            sanitized_blob_path: outcome
                .sanitized_path
                .as_ref()
                .map(|_| post_cdr_path(cdr_engine.label(), original_path)),
            status: match outcome.status {
                SanitizeStatus::Success => UnitStatus::Success,
                SanitizeStatus::Failed => UnitStatus::Failed,
            },
            processing_millis: outcome.ms,
            bytes_before: outcome.bytes_before,
            bytes_after: outcome.bytes_after,
            threats_found: outcome.threats_found,
            error: outcome.error,
            started_at,
            ended_at: Utc::now(),
        },
        Attempt::Failed(err) => Phase1Result {
            original_blob_path: original_path.to_string(),
            cdr_engine: cdr_engine.label().to_string(),
            sanitized_blob_path: None,
            status: UnitStatus::Error,
            processing_millis: 0,
            bytes_before: 0,
            bytes_after: 0,
            threats_found: 0,
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
        .append_phase_result(job_id, Phase::Cdr, serde_json::to_value(&result).expect("Phase1Result always serializes"))
        .await;

    Some(result)
}

/// The download/sanitize/upload chain, racing the cancellation flag at each
/// suspension point (§5). `resources_consumed` on a cancelled outcome tells
/// the caller whether the download ever completed, per §7's distinction
/// between a clean drop and a cancellation that touched external state.
async fn attempt(
    scratch: &PathBuf,
    container: &str,
    original_path: &str,
    cdr_engine: &dyn CdrEngine,
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

    match race_cancellation(cancelled, blob_store.download(container, original_path, scratch)).await {
        None => return Attempt::Cancelled { resources_consumed: false },
        Some(Err(err)) => return Attempt::Failed(err),
        Some(Ok(_bytes)) => (),
    }

    let outcome = match race_cancellation(cancelled, cdr_engine.sanitize(scratch)).await {
        None => return Attempt::Cancelled { resources_consumed: true },
        Some(Err(err)) => return Attempt::Failed(err),
        Some(Ok(outcome)) => outcome,
    };

    if let (SanitizeStatus::Success, Some(sanitized_local)) = (outcome.status, outcome.sanitized_path.clone()) {
        let dest = post_cdr_path(cdr_engine.label(), original_path);
        match race_cancellation(cancelled, blob_store.upload(container, &sanitized_local, &dest)).await {
            None => return Attempt::Cancelled { resources_consumed: true },
            Some(Err(err)) => return Attempt::Failed(err),
            Some(Ok(())) => (),
        }
    }

    Attempt::Done(outcome)
}

/// Bounds a unit's `attempt` with the phase's soft/hard timeouts (§5): the
/// soft timeout only warns, the hard timeout converts an overrun into an
/// `Error` result.
async fn run_with_timeouts(
    config: &PhaseConfig,
    job_id: JobId,
    original_path: &str,
    fut: impl std::future::Future<Output = Attempt>,
) -> Attempt {
    let soft_timeout = Duration::from_secs(config.soft_timeout_sec);
    let hard_timeout = Duration::from_secs(config.hard_timeout_sec);

    tokio::pin!(fut);
    let watched = async {
        match tokio::time::timeout(soft_timeout, &mut fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(%job_id, path = original_path, soft_timeout_sec = config.soft_timeout_sec, "unit exceeded soft timeout");
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
    use cdr_adapters::mock::{MockBlobStore, MockCdrEngine};
    use cdr_store::InMemoryJobStore;
    use cdr_types::Priority;
    use std::collections::BTreeSet as Set;

    #[tokio::test]
    async fn happy_path_sanitizes_and_uploads() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(chrono::Duration::days(7)));
        let job_id = JobId::new();
        store
            .create_job(job_id, "bucket".to_string(), vec!["a.pdf".to_string()], Set::from([Phase::Cdr]), Priority::Normal)
            .await
            .unwrap();

        let blob_store = Arc::new(MockBlobStore::new());
        blob_store.seed("bucket", "a.pdf", b"clean content".to_vec());

        let deps = Phase1Deps {
            store: Arc::clone(&store),
            blob_store: blob_store.clone(),
            cdr_engines: vec![Arc::new(MockCdrEngine::new("engine-a"))],
        };

        let config = PhaseConfig::default();
        let files = resolve_files("bucket", vec!["a.pdf".to_string()], blob_store.as_ref()).await;
        let results = run_phase1(job_id, "bucket".to_string(), files, &config, &deps, Arc::new(AtomicBool::new(false))).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, UnitStatus::Success);
        assert!(blob_store.list("bucket", Some("post-cdr/")).await.unwrap().len() == 1);

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.processed, 1);
        assert_eq!(job.failed, 0);
    }

    #[tokio::test]
    async fn cdr_failure_is_recorded_as_failed_not_error() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(chrono::Duration::days(7)));
        let job_id = JobId::new();
        store
            .create_job(job_id, "bucket".to_string(), vec!["b.docx".to_string()], Set::from([Phase::Cdr]), Priority::Normal)
            .await
            .unwrap();

        let blob_store = Arc::new(MockBlobStore::new());
        blob_store.seed("bucket", "b.docx", b"content".to_vec());

        let deps = Phase1Deps {
            store: Arc::clone(&store),
            blob_store: blob_store.clone(),
            cdr_engines: vec![Arc::new(MockCdrEngine::new("engine-b").fail_on("b.docx"))],
        };

        let files = resolve_files("bucket", vec!["b.docx".to_string()], blob_store.as_ref()).await;
        let results =
            run_phase1(job_id, "bucket".to_string(), files, &PhaseConfig::default(), &deps, Arc::new(AtomicBool::new(false))).await;

        assert_eq!(results[0].status, UnitStatus::Failed);
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.failed, 1);
    }

    #[tokio::test]
    async fn cancellation_before_download_drops_the_unit_silently() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(chrono::Duration::days(7)));
        let job_id = JobId::new();
        store
            .create_job(job_id, "bucket".to_string(), vec!["a.pdf".to_string()], Set::from([Phase::Cdr]), Priority::Normal)
            .await
            .unwrap();

        let blob_store = Arc::new(MockBlobStore::new());
        blob_store.seed("bucket", "a.pdf", b"clean content".to_vec());

        let deps = Phase1Deps {
            store: Arc::clone(&store),
            blob_store: blob_store.clone(),
            cdr_engines: vec![Arc::new(MockCdrEngine::new("engine-a"))],
        };

        let files = resolve_files("bucket", vec!["a.pdf".to_string()], blob_store.as_ref()).await;
        let results = run_phase1(
            job_id,
            "bucket".to_string(),
            files,
            &PhaseConfig::default(),
            &deps,
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        assert!(results.is_empty());
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.processed, 0);
        assert_eq!(job.failed, 0);
    }
}
