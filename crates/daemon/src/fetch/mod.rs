//! Media fetching collaborators
//!
//! The pipeline talks to a [`MediaFetcher`]; [`ytdlp`] is the real one.

pub mod ytdlp;

use crate::job::{FormatPreferences, JobSpec, MediaFormat, Platform};
use crate::reporter::JobReporter;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

pub use ytdlp::YtDlpFetcher;

/// Error type for fetch operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Download error: unsupported URL.")]
    UnsupportedUrl,

    #[error("Download error: video unavailable.")]
    Unavailable,

    #[error("Download error: video is private.")]
    Private,

    #[error("Download error: access denied (403).")]
    Forbidden,

    #[error("Download error: not found (404).")]
    NotFound,

    /// Content needs a logged-in session; `hint` says what to do about cookies
    #[error("Download error: {service} requires login for this content. ({hint})")]
    LoginRequired { service: String, hint: String },

    /// Platform and format cannot be combined
    #[error("Invalid combination: {platform}/{format}")]
    UnsupportedCombination { platform: String, format: String },

    #[error("yt-dlp not found or not executable")]
    ToolMissing,

    /// Download reported success but the file could not be located
    #[error("Could not find downloaded file for '{title}' in '{dir}'")]
    OutputMissing { title: String, dir: String },

    /// Any other downloader failure, truncated to 200 characters
    #[error("Download error: {0}")]
    Failed(String),

    #[error("IO error during download: {0}")]
    Io(String),
}

/// What to fetch and in which shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source_url: String,
    pub platform: Platform,
    pub preferences: FormatPreferences,
}

impl FetchRequest {
    pub fn from_spec(spec: &JobSpec) -> Self {
        Self {
            source_url: spec.source_url.clone(),
            platform: spec.platform.clone(),
            preferences: spec.preferences.clone(),
        }
    }

    /// Extension the fetched file is expected to end up with.
    pub fn expected_extension(&self) -> &'static str {
        match (&self.platform, self.preferences.format) {
            (Platform::SoundCloud, _) => ".mp3",
            (Platform::YouTube, MediaFormat::Mp3) => ".mp3",
            (p, _) if p.is_video_platform() => ".mp4",
            (_, MediaFormat::Mp4) => ".mp4",
            (_, MediaFormat::Mp3) => ".mp3",
        }
    }
}

/// A file fetched to local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub title: String,
    /// Lowercase, with leading dot
    pub extension: String,
}

/// Downloads remote media to a local file.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetch `request`, reporting progress and log lines through `reporter`.
    async fn fetch(
        &self,
        request: &FetchRequest,
        reporter: &JobReporter,
    ) -> Result<FetchedMedia, FetchError>;
}

/// Map downloader error output to a [`FetchError`].
pub fn classify_download_error(output: &str, cookie_configured: bool) -> FetchError {
    let hint = |configured: bool| {
        if configured {
            "cookie file may be invalid or expired".to_string()
        } else {
            "cookie file not configured".to_string()
        }
    };

    if output.contains("Unsupported URL") {
        FetchError::UnsupportedUrl
    } else if output.contains("Video unavailable") {
        FetchError::Unavailable
    } else if output.contains("Private video") {
        FetchError::Private
    } else if output.contains("HTTP Error 403") {
        FetchError::Forbidden
    } else if output.contains("HTTP Error 404") {
        FetchError::NotFound
    } else if output.contains("Login is required") || output.contains("age-restricted") {
        FetchError::LoginRequired {
            service: "content".to_string(),
            hint: hint(cookie_configured),
        }
    } else if output.contains("InstagramLoginRequiredError") {
        FetchError::LoginRequired {
            service: "Instagram".to_string(),
            hint: hint(cookie_configured),
        }
    } else if output.contains("TwitterLoginRequiredError") {
        FetchError::LoginRequired {
            service: "Twitter/X".to_string(),
            hint: hint(cookie_configured),
        }
    } else {
        let trimmed = output.trim();
        let last = trimmed
            .lines()
            .rev()
            .find(|l| l.contains("ERROR"))
            .unwrap_or(trimmed);
        FetchError::Failed(last.chars().take(200).collect())
    }
}
