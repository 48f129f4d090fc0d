//! Worker loop draining the submission queue.

use crate::job_executor::{JobExecutor, UNCLEAR_FAILURE};
use crate::queue::SubmissionQueue;
use crate::status::StatusUpdate;
use crate::store::OrchestrationError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run one worker until `shutdown` is cancelled or the queue is closed.
///
/// Each job runs in its own task so a panic in a collaborator is caught
/// here instead of killing the worker. After a failed job the worker pauses
/// for `failure_backoff` before taking the next one.
pub async fn run_worker(
    worker_id: usize,
    queue: SubmissionQueue,
    executor: JobExecutor,
    failure_backoff: Duration,
    shutdown: CancellationToken,
) {
    info!(worker_id, "Worker started");

    loop {
        let spec = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            spec = queue.dequeue() => match spec {
                Some(spec) => spec,
                None => break,
            },
        };

        let job_id = spec.id.clone();
        let task_executor = executor.clone();
        let failed = match tokio::spawn(async move { task_executor.execute(spec).await }).await {
            Ok(outcome) => !outcome.success,
            Err(join_error) => {
                let e = OrchestrationError::WorkerPanic {
                    job_id: job_id.clone(),
                    detail: join_error.to_string(),
                };
                error!(worker_id, job_id = %job_id, "{}", e);
                mark_failed(&executor, &job_id);
                true
            }
        };

        if failed && !failure_backoff.is_zero() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(failure_backoff) => {}
            }
        }
    }

    info!(worker_id, "Worker stopped");
}

/// Make sure a job whose task died ends up terminal with a cause.
fn mark_failed(executor: &JobExecutor, job_id: &str) {
    let store = executor.store();
    let has_error = match store.read(job_id) {
        Some(status) => status.error.is_some(),
        None => {
            warn!(job_id = %job_id, "Record vanished while its job was running");
            return;
        }
    };
    let mut update = StatusUpdate::new().running(false);
    if !has_error {
        update = update.error(UNCLEAR_FAILURE);
    }
    let _ = store.mutate(job_id, update);
}

/// Spawn `count` workers sharing one queue and executor.
pub fn spawn_workers(
    count: usize,
    queue: &SubmissionQueue,
    executor: &JobExecutor,
    failure_backoff: Duration,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker_id| {
            tokio::spawn(run_worker(
                worker_id,
                queue.clone(),
                executor.clone(),
                failure_backoff,
                shutdown.clone(),
            ))
        })
        .collect()
}
