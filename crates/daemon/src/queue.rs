//! Submission queue and the store-then-enqueue submission protocol.

use crate::job::JobSpec;
use crate::status::{JobStatus, StatusUpdate};
use crate::store::{OrchestrationError, SharedStatusStore};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

/// Unbounded FIFO of job specs shared by all producers and all workers.
///
/// Producers hold cheap sender clones; workers share one receiver behind an
/// async mutex, so each spec is handed to exactly one worker.
#[derive(Clone)]
pub struct SubmissionQueue {
    tx: mpsc::UnboundedSender<JobSpec>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<JobSpec>>>,
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Push a spec. Never blocks; fails only once the queue is closed.
    pub fn enqueue(&self, spec: JobSpec) -> Result<(), OrchestrationError> {
        self.tx
            .send(spec)
            .map_err(|_| OrchestrationError::QueueClosed)
    }

    /// Wait for the next spec. `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<JobSpec> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Stop accepting new specs; already queued specs can still be drained.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }
}

/// Register a job's status record and then hand its spec to the workers.
///
/// The record is created first so a worker that dequeues the spec always
/// finds something to update.
pub fn submit(
    store: &SharedStatusStore,
    queue: &SubmissionQueue,
    spec: JobSpec,
) -> Result<String, OrchestrationError> {
    let job_id = spec.id.clone();
    store.create(&job_id, JobStatus::queued(store.next_seq()))?;

    let source_url = spec.source_url.clone();
    if let Err(e) = queue.enqueue(spec) {
        error!(job_id = %job_id, "Failed to enqueue job: {}", e);
        let _ = store.mutate(&job_id, StatusUpdate::new().error(e.to_string()));
        return Err(e);
    }

    info!(job_id = %job_id, url = %source_url, "Job queued");
    Ok(job_id)
}
