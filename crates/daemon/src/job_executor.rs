//! Job executor: runs one job through fetch, transcode and upload
//!
//! Every step reports into the status store through a [`JobReporter`].
//! A failing step records its error once and aborts the remaining steps;
//! finalization (stats, temp file removal, terminal state) always runs.

use crate::encode::{CodecProfile, TranscodeError, Transcoder};
use crate::fetch::{FetchError, FetchRequest, MediaFetcher};
use crate::job::JobSpec;
use crate::keygen::{allocate_unique_key, candidate_key};
use crate::persistence::Persistence;
use crate::reporter::JobReporter;
use crate::status::{JobState, StatusUpdate};
use crate::storage::{content_type_for, public_url, ObjectStoreConnector, StoreError};
use crate::store::SharedStatusStore;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Fallback error for a job that ended without success and without a recorded cause
pub const UNCLEAR_FAILURE: &str = "Processing failed (reason unclear).";

/// Error type for job execution operations
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A collaborator panicked mid-pipeline
    #[error("{}", UNCLEAR_FAILURE)]
    Panicked(String),
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Result of one execution, as seen by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: String,
    pub success: bool,
    pub duration: Duration,
}

/// What a successful run produced.
struct Delivered {
    size_bytes: u64,
}

/// Executes jobs against a set of collaborators.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct JobExecutor {
    store: SharedStatusStore,
    fetcher: Arc<dyn MediaFetcher>,
    transcoder: Arc<dyn Transcoder>,
    connector: Arc<dyn ObjectStoreConnector>,
    persistence: Arc<dyn Persistence>,
}

impl JobExecutor {
    pub fn new(
        store: SharedStatusStore,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn Transcoder>,
        connector: Arc<dyn ObjectStoreConnector>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            store,
            fetcher,
            transcoder,
            connector,
            persistence,
        }
    }

    pub fn store(&self) -> &SharedStatusStore {
        &self.store
    }

    /// Run `spec` to completion.
    ///
    /// The job's record ends up `completed` with progress 100, or `error`
    /// with exactly one recorded cause. Never returns an error itself;
    /// failures are reflected in the record and in [`JobOutcome::success`].
    pub async fn execute(&self, spec: JobSpec) -> JobOutcome {
        let started = Instant::now();
        let reporter = JobReporter::new(self.store.clone(), spec.id.clone());
        info!(job_id = %spec.id, url = %spec.source_url, platform = %spec.platform, "Starting job");

        reporter.update(
            StatusUpdate::new()
                .running(true)
                .state(JobState::Running)
                .say("Starting processing..."),
        );

        // A panic still goes through finalize so stats and temp files are handled.
        let mut local_file: Option<PathBuf> = None;
        let result = AssertUnwindSafe(self.run_steps(&spec, &reporter, &mut local_file))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(JobError::Panicked(panic_detail(payload))));

        self.finalize(&spec, &reporter, result, local_file, started)
            .await
    }

    async fn run_steps(
        &self,
        spec: &JobSpec,
        reporter: &JobReporter,
        local_file: &mut Option<PathBuf>,
    ) -> Result<Delivered, JobError> {
        // Fetch
        let request = FetchRequest::from_spec(spec);
        let fetched = self.fetcher.fetch(&request, reporter).await?;
        *local_file = Some(fetched.path.clone());
        let mut path = fetched.path.clone();
        let mut extension = fetched.extension.clone();

        // Optional H.264 re-encode
        if spec.needs_transcode() {
            reporter.log("Starting H.264 compatibility conversion (this may take a while)...");
            let converted = self
                .transcoder
                .transcode(&path, CodecProfile::H264Compat)
                .await?;
            reporter.log("H.264 conversion successful.");

            if converted != path {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(job_id = %spec.id, "Could not remove original download {}: {}", path.display(), e);
                    reporter.note(format!("Warning: could not remove original download: {}", e));
                }
            }
            *local_file = Some(converted.clone());
            path = converted;
            extension = ".mp4".to_string();
        }

        let size_bytes = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(job_id = %spec.id, "Could not determine file size: {}", e);
                reporter.note(format!("Warning: could not determine file size: {}", e));
                0
            }
        };

        // Storage
        let target = &spec.storage;
        reporter.log("Connecting to storage...");
        let object_store = self.connector.connect(target).await?;

        reporter.log("Looking for a free object name...");
        let key = allocate_unique_key(object_store.as_ref(), &target.bucket, &spec.id, || {
            candidate_key(&extension)
        })
        .await?;

        reporter.update(
            StatusUpdate::new()
                .progress(50.0)
                .say(format!("Uploading as '{}'...", key)),
        );
        object_store
            .upload(&path, &target.bucket, &key, content_type_for(&extension))
            .await?;

        // Deliver
        let reference = target
            .public_url_base
            .as_deref()
            .map(|base| public_url(base, &key));
        let mut update = StatusUpdate::new().progress(100.0).say("Upload successful.");
        if let Some(reference) = &reference {
            update = update.result_reference(reference.clone());
        }
        reporter.update(update);

        let history_reference =
            reference.unwrap_or_else(|| format!("s3://{}/{}", target.bucket, key));
        let persistence = self.persistence.clone();
        let platform = spec.platform.to_string();
        let title = fetched.title.clone();
        let source_url = spec.source_url.clone();
        let saved = tokio::task::spawn_blocking(move || {
            persistence.append_history(&platform, &title, &source_url, &history_reference)
        })
        .await
        .unwrap_or(false);
        if !saved {
            reporter.note("Warning: could not save history entry.");
        }

        Ok(Delivered { size_bytes })
    }

    async fn finalize(
        &self,
        spec: &JobSpec,
        reporter: &JobReporter,
        result: Result<Delivered, JobError>,
        local_file: Option<PathBuf>,
        started: Instant,
    ) -> JobOutcome {
        let recorded_error = self
            .store
            .read(&spec.id)
            .and_then(|status| status.error);

        let (success, size_bytes) = match (&result, &recorded_error) {
            (Ok(delivered), None) => (true, delivered.size_bytes),
            (Ok(_), Some(_)) => (false, 0),
            (Err(JobError::Panicked(detail)), _) => {
                error!(job_id = %spec.id, panic = %detail, "Job panicked");
                reporter.update(StatusUpdate::new().error(UNCLEAR_FAILURE));
                (false, 0)
            }
            (Err(e), _) => {
                error!(job_id = %spec.id, "Job failed: {}", e);
                reporter.update(StatusUpdate::new().error(e.to_string()));
                (false, 0)
            }
        };

        let duration = started.elapsed();
        let persistence = self.persistence.clone();
        let seconds = duration.as_secs_f64();
        if let Err(e) = tokio::task::spawn_blocking(move || {
            persistence.record_stats(seconds, size_bytes, success)
        })
        .await
        {
            warn!(job_id = %spec.id, "Stats update did not complete: {}", e);
        }

        if let Some(path) = local_file {
            remove_temp_file(&path, reporter).await;
        }

        let state = if success {
            JobState::Completed
        } else {
            JobState::Error
        };
        reporter.update(StatusUpdate::new().running(false).state(state));
        info!(
            job_id = %spec.id,
            success,
            duration_secs = seconds,
            "Job finished"
        );

        JobOutcome {
            job_id: spec.id.clone(),
            success,
            duration,
        }
    }
}

async fn remove_temp_file(path: &Path, reporter: &JobReporter) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(job_id = %reporter.job_id(), "Removed local file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(job_id = %reporter.job_id(), "Could not remove local file {}: {}", path.display(), e);
            reporter.note(format!("Warning: could not remove local file: {}", e));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::job::test_support::{spec, storage_target};
    use crate::job::{CodecPreference, Platform};
    use crate::keygen::test_support::ProbeStore;
    use crate::keygen::MAX_KEY_ATTEMPTS;
    use crate::queue::{submit, SubmissionQueue};

    async fn run(harness: &Harness, spec: JobSpec) -> (JobOutcome, crate::status::JobStatus) {
        let queue = SubmissionQueue::new();
        let id = submit(&harness.store, &queue, spec).unwrap();
        let spec = queue.dequeue().await.unwrap();
        let outcome = harness.executor().execute(spec).await;
        (outcome, harness.store.read(&id).unwrap())
    }

    #[tokio::test]
    async fn test_successful_job_with_public_base() {
        let harness = Harness::happy();
        let mut s = spec("https://soundcloud.com/a/b");
        s.storage = storage_target(Some("https://cdn.example.com/"));

        let (outcome, status) = run(&harness, s).await;

        assert!(outcome.success);
        assert_eq!(status.state, JobState::Completed);
        assert!(!status.running);
        assert_eq!(status.progress, 100.0);
        assert!(status.error.is_none());

        let uploads = harness.connector.store.uploads.lock().clone();
        assert_eq!(uploads.len(), 1);
        let (bucket, key, content_type) = &uploads[0];
        assert_eq!(bucket, "media");
        assert!(key.ends_with(".mp3"));
        assert_eq!(content_type, "audio/mpeg");
        assert_eq!(
            status.result_reference.as_deref(),
            Some(format!("https://cdn.example.com/{}", key).as_str())
        );

        let history = harness.persistence.history.lock().clone();
        assert_eq!(history[0].title, "Test Title");
        assert_eq!(history[0].platform, "SoundCloud");

        let stats = harness.persistence.stats.lock().clone();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].2);
        assert_eq!(stats[0].1, b"media bytes".len() as u64);

        // Local file removed.
        assert_eq!(std::fs::read_dir(harness.fetcher.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_no_public_base_leaves_reference_unset() {
        let harness = Harness::happy();
        let (outcome, status) = run(&harness, spec("https://soundcloud.com/a/b")).await;

        assert!(outcome.success);
        assert_eq!(status.result_reference, None);
        let history = harness.persistence.history.lock().clone();
        assert!(history[0].reference.starts_with("s3://media/"));
    }

    #[tokio::test]
    async fn test_fetch_failure_records_error() {
        let mut fetcher = FakeFetcher::new(".mp3");
        fetcher.fail = Some(FetchError::Private);
        let harness = Harness::new(
            fetcher,
            FakeTranscoder::default(),
            FakeConnector::new(ProbeStore::default()),
        );

        let (outcome, status) = run(&harness, spec("https://soundcloud.com/a/b")).await;

        assert!(!outcome.success);
        assert_eq!(status.state, JobState::Error);
        assert!(!status.running);
        assert_eq!(status.error, Some(FetchError::Private.to_string()));
        assert!(harness.connector.store.probes.lock().is_empty());
        let stats = harness.persistence.stats.lock().clone();
        assert_eq!((stats[0].1, stats[0].2), (0, false));
    }

    #[tokio::test]
    async fn test_saturated_key_space_fails_job() {
        let harness = Harness::new(
            FakeFetcher::new(".mp3"),
            FakeTranscoder::default(),
            FakeConnector::new(ProbeStore::with_taken(MAX_KEY_ATTEMPTS as usize)),
        );

        let (outcome, status) = run(&harness, spec("https://soundcloud.com/a/b")).await;

        assert!(!outcome.success);
        assert_eq!(status.state, JobState::Error);
        assert!(status
            .error
            .unwrap()
            .contains("Could not allocate a unique object name after 10 attempts"));
        assert!(harness.connector.store.uploads.lock().is_empty());
        assert_eq!(harness.connector.store.probes.lock().len(), 10);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_job() {
        let mut connector = FakeConnector::new(ProbeStore::default());
        connector.fail = true;
        let harness = Harness::new(FakeFetcher::new(".mp3"), FakeTranscoder::default(), connector);

        let (_, status) = run(&harness, spec("https://soundcloud.com/a/b")).await;
        assert_eq!(status.state, JobState::Error);
        assert!(status.error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_upload_failure_fails_job() {
        let probe = ProbeStore {
            fail_upload: true,
            ..ProbeStore::default()
        };
        let harness = Harness::new(
            FakeFetcher::new(".mp3"),
            FakeTranscoder::default(),
            FakeConnector::new(probe),
        );

        let (_, status) = run(&harness, spec("https://soundcloud.com/a/b")).await;
        assert_eq!(status.state, JobState::Error);
        assert!(status.error.unwrap().starts_with("Upload failed"));
        assert!(harness.persistence.history.lock().is_empty());
    }

    #[tokio::test]
    async fn test_h264_transcode_for_video_platform() {
        let harness = Harness::new(
            FakeFetcher::new(".webm"),
            FakeTranscoder::default(),
            FakeConnector::new(ProbeStore::default()),
        );
        let mut s = spec("https://www.tiktok.com/@x/video/1");
        s.platform = Platform::TikTok;
        s.codec = CodecPreference::H264;

        let (outcome, _) = run(&harness, s).await;

        assert!(outcome.success);
        assert_eq!(*harness.transcoder.calls.lock(), 1);
        let uploads = harness.connector.store.uploads.lock().clone();
        assert!(uploads[0].1.ends_with(".mp4"));
        assert_eq!(uploads[0].2, "video/mp4");
        assert_eq!(std::fs::read_dir(harness.fetcher.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_transcode_failure_fails_job() {
        let transcoder = FakeTranscoder {
            fail: true,
            ..FakeTranscoder::default()
        };
        let harness = Harness::new(
            FakeFetcher::new(".mp4"),
            transcoder,
            FakeConnector::new(ProbeStore::default()),
        );
        let mut s = spec("https://youtu.be/abc");
        s.platform = Platform::YouTube;
        s.codec = CodecPreference::H264;

        let (_, status) = run(&harness, s).await;

        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.error, Some(TranscodeError::Failed(1).to_string()));
        assert_eq!(std::fs::read_dir(harness.fetcher.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_panic_after_fetch_still_finalizes() {
        let transcoder = FakeTranscoder {
            panic: true,
            ..FakeTranscoder::default()
        };
        let harness = Harness::new(
            FakeFetcher::new(".mp4"),
            transcoder,
            FakeConnector::new(ProbeStore::default()),
        );
        let mut s = spec("https://youtu.be/abc");
        s.platform = Platform::YouTube;
        s.codec = CodecPreference::H264;

        let (outcome, status) = run(&harness, s).await;

        assert!(!outcome.success);
        assert_eq!(status.state, JobState::Error);
        assert!(!status.running);
        assert_eq!(status.error.as_deref(), Some(UNCLEAR_FAILURE));

        let stats = harness.persistence.stats.lock().clone();
        assert_eq!(stats.len(), 1);
        assert_eq!((stats[0].1, stats[0].2), (0, false));
        // The download written before the panic is gone.
        assert_eq!(std::fs::read_dir(harness.fetcher.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_audio_platform_skips_transcode() {
        let harness = Harness::happy();
        let mut s = spec("https://soundcloud.com/a/b");
        s.codec = CodecPreference::H264;

        let (outcome, _) = run(&harness, s).await;
        assert!(outcome.success);
        assert_eq!(*harness.transcoder.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_reporter_output_is_clean() {
        let harness = Harness::happy();
        let (_, status) = run(&harness, spec("https://soundcloud.com/a/b")).await;
        assert!(status.logs.iter().any(|l| l.ends_with(" - Downloading")));
        assert!(status.logs.iter().all(|l| !l.contains('\x1b')));
    }
}
