//! Progress and log callbacks handed to collaborators.

use crate::status::StatusUpdate;
use crate::store::SharedStatusStore;
use tracing::debug;

/// Synchronous reporting handle bound to one job.
///
/// Collaborators call it from the worker's own task while they run. Each
/// call is one short store mutation; a record reclaimed mid-flight is only
/// logged.
#[derive(Clone)]
pub struct JobReporter {
    store: SharedStatusStore,
    job_id: String,
}

impl JobReporter {
    pub fn new(store: SharedStatusStore, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Report a progress percentage; clamped to 0..=100 by the store.
    pub fn progress(&self, percent: f64) {
        self.update(StatusUpdate::new().progress(percent));
    }

    /// Append a log line and make it the job's current message.
    pub fn log(&self, line: impl Into<String>) {
        self.update(StatusUpdate::new().say(line));
    }

    /// Append a log line without touching the current message.
    pub fn note(&self, line: impl Into<String>) {
        self.update(StatusUpdate::new().log(line));
    }

    /// Apply an arbitrary update to the job.
    pub fn update(&self, update: StatusUpdate) {
        if let Err(e) = self.store.mutate(&self.job_id, update) {
            debug!(job_id = %self.job_id, "Dropped status update: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobStatus;
    use crate::store::StatusStore;

    #[test]
    fn test_reporter_updates_store() {
        let store = StatusStore::shared();
        store.create("job", JobStatus::queued(0)).unwrap();
        let reporter = JobReporter::new(store.clone(), "job");

        reporter.progress(150.0);
        reporter.log("\x1b[32mDownloading\x1b[0m");
        reporter.note("side note");

        let status = store.read("job").unwrap();
        assert_eq!(status.progress, 100.0);
        assert_eq!(status.message, "Downloading");
        assert!(status.logs.iter().any(|l| l.ends_with(" - Downloading")));
        assert!(status.logs.last().unwrap().ends_with("side note"));
    }

    #[test]
    fn test_reporter_tolerates_reclaimed_record() {
        let store = StatusStore::shared();
        let reporter = JobReporter::new(store, "gone");
        reporter.progress(10.0);
        reporter.log("still fine");
    }
}
