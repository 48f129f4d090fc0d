//! Daemon supervisor
//!
//! Owns the status store, the submission queue, the worker pool and the
//! sweeper. All long-lived tasks share one cancellation token; `shutdown`
//! cancels it and waits for every task to finish.

use crate::config::{Config, ConfigError};
use crate::encode::{FfmpegTranscoder, Transcoder};
use crate::fetch::{MediaFetcher, YtDlpFetcher};
use crate::job::{
    validate_source_url, CodecPreference, FormatPreferences, JobSpec, MediaFormat, Mp4Quality,
    Platform, StorageTarget, SubmissionError,
};
use crate::job_executor::JobExecutor;
use crate::persistence::{HistoryEntry, JsonPersistence, Persistence, Stats, StatsSummary};
use crate::position::{estimate_position, QueuePosition};
use crate::queue::{submit, SubmissionQueue};
use crate::startup::{run_startup_checks, StartupError};
use crate::status::{JobState, JobStatus};
use crate::storage::{ObjectStoreConnector, S3Connector};
use crate::store::{OrchestrationError, SharedStatusStore, StatusStore};
use crate::sweeper::Sweeper;
use crate::worker::spawn_workers;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Submission refused before a job was created
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    /// Queue or store invariant violated
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

fn default_platform() -> Platform {
    Platform::SoundCloud
}

fn default_bitrate() -> String {
    "192k".to_string()
}

/// A submission as received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobRequest {
    pub url: String,
    #[serde(default = "default_platform")]
    pub platform: Platform,
    #[serde(default)]
    pub format: MediaFormat,
    #[serde(default = "default_bitrate")]
    pub mp3_bitrate: String,
    /// Quality label, e.g. "Best" or "Medium (~720p)"
    #[serde(default)]
    pub mp4_quality: Option<String>,
    #[serde(default)]
    pub codec: CodecPreference,
}

impl JobRequest {
    pub fn new(url: impl Into<String>, platform: Platform) -> Self {
        Self {
            url: url.into(),
            platform,
            format: MediaFormat::default(),
            mp3_bitrate: default_bitrate(),
            mp4_quality: None,
            codec: CodecPreference::default(),
        }
    }

    fn preferences(&self) -> FormatPreferences {
        let mp4_quality = match self.mp4_quality.as_deref() {
            None => Some(Mp4Quality::Best),
            Some(label) => Mp4Quality::from_label(label),
        };
        FormatPreferences {
            format: self.format,
            mp3_bitrate: self.mp3_bitrate.clone(),
            mp4_quality,
        }
    }
}

/// Status as returned to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_queued: Option<usize>,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    config: Config,
    store: SharedStatusStore,
    queue: SubmissionQueue,
    executor: JobExecutor,
    persistence: Arc<dyn Persistence>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    /// Load configuration, run startup checks and wire the real collaborators.
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file; a missing file means defaults
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config)
    }

    /// Run startup checks against an already loaded configuration.
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Wire the real collaborators without probing external tools.
    pub fn new_without_checks(config: Config) -> Self {
        let fetcher = Arc::new(YtDlpFetcher::new(
            config.fetch.download_dir.clone(),
            config.fetch.cookie_file.clone(),
        ));
        let persistence = Arc::new(JsonPersistence::from_config(&config.history));
        Self::with_collaborators(
            config,
            fetcher,
            Arc::new(FfmpegTranscoder),
            Arc::new(S3Connector),
            persistence,
        )
    }

    /// Build a daemon around arbitrary collaborators.
    pub fn with_collaborators(
        config: Config,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn Transcoder>,
        connector: Arc<dyn ObjectStoreConnector>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let store = StatusStore::shared();
        let executor = JobExecutor::new(
            store.clone(),
            fetcher,
            transcoder,
            connector,
            persistence.clone(),
        );
        Self {
            config,
            store,
            queue: SubmissionQueue::new(),
            executor,
            persistence,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SharedStatusStore {
        &self.store
    }

    /// Token cancelled by [`Daemon::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the worker pool and the sweeper. Calling it again is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }

        let workers = self.config.workers.effective_count() as usize;
        let retention = &self.config.retention;
        handles.extend(spawn_workers(
            workers,
            &self.queue,
            &self.executor,
            Duration::from_secs(retention.failure_backoff_secs),
            &self.shutdown,
        ));

        let sweeper = Sweeper::new(
            self.store.clone(),
            Duration::from_secs(retention.ttl_secs),
            Duration::from_secs(retention.sweep_interval_secs),
        );
        handles.push(tokio::spawn(sweeper.run(self.shutdown.clone())));

        info!(workers, "Daemon started");
    }

    /// Validate a request and queue it.
    ///
    /// Returns the new job id. The status record exists before this returns.
    pub async fn submit(&self, request: JobRequest) -> Result<String, DaemonError> {
        if let Platform::Other(name) = &request.platform {
            warn!(
                "Unknown platform '{}', trying anyway with URL '{}'",
                name, request.url
            );
        }
        validate_source_url(&request.url, &request.platform)?;

        let url = request.url.clone();
        let duplicate = self
            .with_persistence(None, move |p| p.find_source(&url))
            .await;
        if let Some(entry) = duplicate {
            return Err(SubmissionError::Duplicate {
                platform: entry.platform,
            }
            .into());
        }

        let storage = StorageTarget::from_config(&self.config.storage)
            .ok_or(SubmissionError::StorageNotConfigured)?;

        let spec = JobSpec::new(
            request.url.clone(),
            request.platform.clone(),
            request.preferences(),
            request.codec,
            storage,
        );
        Ok(submit(&self.store, &self.queue, spec)?)
    }

    /// Current status of a job, with its queue position while queued.
    ///
    /// `None` means the job never existed or has been reclaimed.
    pub fn status(&self, job_id: &str) -> Option<JobStatusView> {
        let status = self.store.read(job_id)?;
        let position = if status.state == JobState::Queued {
            estimate_position(&self.store.snapshot(), job_id)
        } else {
            None
        };
        Some(JobStatusView {
            status,
            position: position.map(|p: QueuePosition| p.position),
            total_queued: position.map(|p| p.total_queued),
        })
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.with_persistence(Vec::new(), |p| p.load_history()).await
    }

    pub async fn clear_history(&self) -> bool {
        self.with_persistence(false, |p| p.clear_history()).await
    }

    pub async fn stats(&self) -> StatsSummary {
        self.with_persistence(Stats::default(), |p| p.load_stats())
            .await
            .summary()
    }

    /// Run a file-backed persistence call on the blocking pool.
    ///
    /// Yields `fallback` if the call panics.
    async fn with_persistence<T, F>(&self, fallback: T, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&dyn Persistence) -> T + Send + 'static,
    {
        let persistence = self.persistence.clone();
        match tokio::task::spawn_blocking(move || f(persistence.as_ref())).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Persistence task failed: {}", e);
                fallback
            }
        }
    }

    /// Stop accepting work, let running jobs finish and wait for all tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down daemon");
        self.shutdown.cancel();
        self.queue.close().await;

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Task ended abnormally during shutdown: {}", e);
            }
        }
        info!("Daemon stopped");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::job_executor::test_support::Harness;

    pub fn complete_storage_config() -> Config {
        let mut config = Config::default();
        config.storage.access_key_id = Some("AKIATEST".to_string());
        config.storage.secret_access_key = Some("secret".to_string());
        config.storage.bucket = Some("media".to_string());
        config.retention.failure_backoff_secs = 0;
        config
    }

    pub fn daemon(harness: &Harness, config: Config) -> Daemon {
        Daemon::with_collaborators(
            config,
            harness.fetcher.clone(),
            harness.transcoder.clone(),
            harness.connector.clone(),
            harness.persistence.clone(),
        )
    }
}
