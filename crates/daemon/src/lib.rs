//! Media Relay Daemon
//!
//! Background service that accepts media jobs over HTTP, downloads them with
//! yt-dlp, optionally converts them with ffmpeg and uploads the result to an
//! S3-compatible bucket. Job progress lives in an in-memory status store that
//! clients poll.

pub mod api_server;
pub mod daemon;
pub mod encode;
pub mod fetch;
pub mod job;
pub mod job_executor;
pub mod keygen;
pub mod persistence;
pub mod position;
pub mod queue;
pub mod reporter;
pub mod startup;
pub mod status;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use relay_daemon_config as config;
pub use relay_daemon_config::Config;
pub use api_server::{create_router, run_api_server, ServerError, SharedDaemon};
pub use daemon::{Daemon, DaemonError, JobRequest, JobStatusView};
pub use encode::{CodecProfile, FfmpegTranscoder, TranscodeError, Transcoder};
pub use fetch::{FetchError, FetchRequest, FetchedMedia, MediaFetcher, YtDlpFetcher};
pub use job::{JobSpec, MediaFormat, Platform, StorageTarget, SubmissionError};
pub use job_executor::{JobError, JobExecutor, JobOutcome};
pub use persistence::{HistoryEntry, JsonPersistence, Persistence, Stats, StatsSummary};
pub use position::{estimate_position, QueuePosition};
pub use queue::SubmissionQueue;
pub use startup::{run_startup_checks, StartupError};
pub use status::{JobState, JobStatus, StatusUpdate};
pub use storage::{ObjectStore, ObjectStoreConnector, S3Connector, StoreError};
pub use store::{OrchestrationError, SharedStatusStore, StatusStore};
pub use sweeper::{SweepReport, Sweeper};
