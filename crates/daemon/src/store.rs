//! Shared job status store.
//!
//! A map of job id to individually locked status records. The map lock is
//! only held long enough to find, insert or remove an entry; all
//! read-modify-write work on a record happens under that record's own lock,
//! so a slow caller on one job never stalls readers of another.

use crate::status::{JobStatus, StatusUpdate};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Internal invariant violations surfaced by the orchestration layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    /// No status record exists for the job (never created or already reclaimed)
    #[error("No status record for job {0}")]
    NotFound(String),

    /// A status record with this id already exists
    #[error("Status record for job {0} already exists")]
    AlreadyExists(String),

    /// The submission queue has been closed
    #[error("Submission queue is closed")]
    QueueClosed,

    /// The pipeline task for a job panicked
    #[error("Pipeline task for job {job_id} panicked: {detail}")]
    WorkerPanic { job_id: String, detail: String },
}

type Record = Arc<Mutex<JobStatus>>;

/// Concurrency-safe job status store.
#[derive(Debug, Default)]
pub struct StatusStore {
    records: RwLock<HashMap<String, Record>>,
    next_seq: AtomicU64,
}

/// Shared handle injected into every component that touches job state.
pub type SharedStatusStore = Arc<StatusStore>;

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new shared store handle.
    pub fn shared() -> SharedStatusStore {
        Arc::new(Self::new())
    }

    /// Hand out the next submission sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a fresh record. An existing id is left untouched.
    pub fn create(&self, id: &str, initial: JobStatus) -> Result<(), OrchestrationError> {
        let mut records = self.records.write();
        if records.contains_key(id) {
            warn!(job_id = %id, "Refusing to overwrite existing status record");
            return Err(OrchestrationError::AlreadyExists(id.to_string()));
        }
        records.insert(id.to_string(), Arc::new(Mutex::new(initial)));
        Ok(())
    }

    fn record(&self, id: &str) -> Option<Record> {
        self.records.read().get(id).cloned()
    }

    /// Apply a partial update atomically and return the resulting snapshot.
    pub fn mutate(&self, id: &str, update: StatusUpdate) -> Result<JobStatus, OrchestrationError> {
        let Some(record) = self.record(id) else {
            warn!(job_id = %id, "Status update for unknown job ignored");
            return Err(OrchestrationError::NotFound(id.to_string()));
        };
        let mut status = record.lock();
        status.apply(update);
        Ok(status.clone())
    }

    /// Snapshot copy of a record.
    pub fn read(&self, id: &str) -> Option<JobStatus> {
        self.record(id).map(|record| record.lock().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    /// Remove a record if present.
    pub fn delete(&self, id: &str) -> bool {
        self.records.write().remove(id).is_some()
    }

    /// Remove a record only if `predicate` holds for its current contents.
    ///
    /// The predicate runs under the record lock while the map is write
    /// locked, so no mutation can slip in between the check and the removal.
    pub fn remove_if<F>(&self, id: &str, predicate: F) -> Option<JobStatus>
    where
        F: FnOnce(&JobStatus) -> bool,
    {
        let mut records = self.records.write();
        let status = {
            let record = records.get(id)?;
            let status = record.lock();
            if !predicate(&status) {
                return None;
            }
            status.clone()
        };
        records.remove(id);
        Some(status)
    }

    /// Snapshot of all job ids.
    pub fn list_ids(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Snapshot copies of all records. Each record is locked on its own.
    pub fn snapshot(&self) -> Vec<(String, JobStatus)> {
        let entries: Vec<(String, Record)> = self
            .records
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        entries
            .into_iter()
            .map(|(id, record)| {
                let status = record.lock().clone();
                (id, status)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{JobState, LOG_CAPACITY};

    fn store_with(id: &str) -> SharedStatusStore {
        let store = StatusStore::shared();
        let seq = store.next_seq();
        store.create(id, JobStatus::queued(seq)).unwrap();
        store
    }

    #[test]
    fn test_create_rejects_duplicate() {
        let store = store_with("job-1");
        let mut changed = JobStatus::queued(99);
        changed.message = "overwritten".to_string();

        assert_eq!(
            store.create("job-1", changed),
            Err(OrchestrationError::AlreadyExists("job-1".to_string()))
        );
        assert_eq!(store.read("job-1").unwrap().seq, 0);
    }

    #[test]
    fn test_read_returns_copy() {
        let store = store_with("job-1");
        let mut copy = store.read("job-1").unwrap();
        copy.progress = 80.0;
        assert_eq!(store.read("job-1").unwrap().progress, 0.0);
    }

    #[test]
    fn test_unknown_id() {
        let store = StatusStore::shared();
        assert!(store.read("missing").is_none());
        assert_eq!(
            store.mutate("missing", StatusUpdate::new().progress(1.0)),
            Err(OrchestrationError::NotFound("missing".to_string()))
        );
        assert!(!store.delete("missing"));
    }

    #[test]
    fn test_delete_and_list() {
        let store = store_with("a");
        store.create("b", JobStatus::queued(store.next_seq())).unwrap();

        let mut ids = store.list_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert_eq!(store.list_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let store = store_with("a");
        assert!(store.remove_if("a", |s| s.running).is_none());
        assert!(store.contains("a"));

        let removed = store.remove_if("a", |s| s.state == JobState::Queued);
        assert!(removed.is_some());
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let store = StatusStore::new();
        let a = store.next_seq();
        let b = store.next_seq();
        assert!(b > a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_lose_nothing() {
        let store = store_with("job");
        let mut handles = Vec::new();

        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..10 {
                    if i % 2 == 0 {
                        store
                            .mutate("job", StatusUpdate::new().log(format!("w{}-{}", i, j)))
                            .unwrap();
                    } else {
                        store
                            .mutate("job", StatusUpdate::new().progress((i * 10 + j) as f64))
                            .unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let status = store.read("job").unwrap();
        // boot line + 4 writers * 10 lines
        assert_eq!(status.logs.len(), 41);
        assert!(status.logs.len() <= LOG_CAPACITY);
        assert!(status.progress > 0.0);
    }

    #[test]
    fn test_concurrent_progress_and_log_in_one_update() {
        let store = store_with("job");
        std::thread::scope(|scope| {
            scope.spawn(|| {
                store
                    .mutate("job", StatusUpdate::new().progress(42.0))
                    .unwrap();
            });
            scope.spawn(|| {
                store
                    .mutate("job", StatusUpdate::new().log("downloading"))
                    .unwrap();
            });
        });
        let status = store.read("job").unwrap();
        assert_eq!(status.progress, 42.0);
        assert!(status.logs.last().unwrap().ends_with("downloading"));
    }
}
