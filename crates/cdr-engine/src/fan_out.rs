use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// How often a suspended unit rechecks the cancellation flag while racing
/// against it (§5 "all suspensions must honor the job's cancellation
/// signal").
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Generic fan-out/join: run `units` through `worker` concurrently under a
/// bound, stop dispatching once `cancelled` flips, and collect whatever
/// terminal results were produced (§4.3).
///
/// Store appends and counter increments are the worker's responsibility —
/// this function only owns concurrency and cancellation, since the result
/// shape differs per phase. `worker` is handed the cancellation flag so it
/// can abandon an in-flight suspension (download, VM lease, settle sleep)
/// instead of always running to completion once dispatched.
pub async fn run_fan_out<U, F, Fut, R>(units: Vec<U>, concurrency: usize, cancelled: Arc<AtomicBool>, worker: F) -> Vec<R>
where
    U: Send + 'static,
    F: Fn(U, Arc<AtomicBool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let worker = Arc::new(worker);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for unit in units {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let semaphore = Arc::clone(&semaphore);
        let worker = Arc::clone(&worker);
        let cancelled_for_task = Arc::clone(&cancelled);
        tasks.spawn(async move {
            let permit = match race_cancellation(cancelled_for_task.as_ref(), semaphore.acquire_owned()).await {
                Some(Ok(permit)) => permit,
                Some(Err(_)) | None => return None,
            };
            let result = worker(unit, Arc::clone(&cancelled_for_task)).await;
            drop(permit);
            Some(result)
        });
        // Yield so a concurrently-running cancel() request gets scheduled
        // between dispatches, instead of this loop draining every unit into
        // the JoinSet in one synchronous burst that no concurrent task can
        // interrupt.
        tokio::task::yield_now().await;
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(err) => tracing::error!(%err, "fan-out worker task panicked"),
        }
    }
    results
}

/// Races `fut` against `cancelled`, returning `None` as soon as the flag
/// flips rather than waiting for `fut` to resolve on its own. Used at every
/// suspension point a worker can abandon mid-flight.
pub async fn race_cancellation<T>(cancelled: &AtomicBool, fut: impl Future<Output = T>) -> Option<T> {
    tokio::pin!(fut);
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return None;
        }
        match tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut fut).await {
            Ok(out) => return Some(out),
            Err(_) => continue,
        }
    }
}
