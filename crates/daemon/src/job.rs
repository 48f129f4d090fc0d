//! Job specifications and submission-time validation.
//!
//! A [`JobSpec`] is immutable once built. It travels through the submission
//! queue and is owned by exactly one worker for the job's lifetime.

use crate::config::StorageConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Source platform of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    SoundCloud,
    YouTube,
    TikTok,
    Instagram,
    Twitter,
    /// Unrecognized platform name, passed through as given
    Other(String),
}

impl Platform {
    pub fn as_str(&self) -> &str {
        match self {
            Platform::SoundCloud => "SoundCloud",
            Platform::YouTube => "YouTube",
            Platform::TikTok => "TikTok",
            Platform::Instagram => "Instagram",
            Platform::Twitter => "Twitter",
            Platform::Other(name) => name,
        }
    }

    /// Platforms that deliver video and can therefore be re-encoded to H.264.
    pub fn is_video_platform(&self) -> bool {
        matches!(
            self,
            Platform::YouTube | Platform::TikTok | Platform::Instagram | Platform::Twitter
        )
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SoundCloud" => Platform::SoundCloud,
            "YouTube" => Platform::YouTube,
            "TikTok" => Platform::TikTok,
            "Instagram" => Platform::Instagram,
            "Twitter" => Platform::Twitter,
            _ => Platform::Other(value),
        }
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.as_str().to_string()
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::SoundCloud
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container the caller asked for (relevant for YouTube).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    #[default]
    Mp3,
    Mp4,
}

/// Target video quality for MP4 downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mp4Quality {
    #[default]
    Best,
    /// Up to roughly 720p
    Medium,
    /// Up to roughly 480p
    Low,
}

impl Mp4Quality {
    /// Parse the labels used by clients ("Best", "Medium (~720p)", "Low (~480p)").
    pub fn from_label(label: &str) -> Option<Self> {
        if label == "Best" {
            Some(Mp4Quality::Best)
        } else if label.contains("Medium") {
            Some(Mp4Quality::Medium)
        } else if label.contains("Low") {
            Some(Mp4Quality::Low)
        } else {
            None
        }
    }
}

/// Whether the fetched video keeps its codec or is re-encoded to H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecPreference {
    #[default]
    Original,
    H264,
}

/// Format and quality preferences handed to the fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPreferences {
    pub format: MediaFormat,
    /// "Best" or a bitrate such as "192k"
    pub mp3_bitrate: String,
    pub mp4_quality: Option<Mp4Quality>,
}

impl Default for FormatPreferences {
    fn default() -> Self {
        Self {
            format: MediaFormat::Mp3,
            mp3_bitrate: "192k".to_string(),
            mp4_quality: Some(Mp4Quality::Best),
        }
    }
}

/// Destination bucket and credentials, captured at submission time.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub public_url_base: Option<String>,
}

impl fmt::Debug for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageTarget")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("public_url_base", &self.public_url_base)
            .finish()
    }
}

impl StorageTarget {
    /// Build a target from configuration; `None` when a required value is missing.
    pub fn from_config(cfg: &StorageConfig) -> Option<Self> {
        if !cfg.is_complete() {
            return None;
        }
        Some(Self {
            access_key_id: cfg.access_key_id.clone()?,
            secret_access_key: cfg.secret_access_key.clone()?,
            bucket: cfg.bucket.clone()?,
            region: cfg.region.clone(),
            endpoint_url: cfg.endpoint_url.clone(),
            public_url_base: cfg.public_url_base.clone().filter(|b| !b.is_empty()),
        })
    }
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub id: String,
    pub source_url: String,
    pub platform: Platform,
    pub preferences: FormatPreferences,
    pub codec: CodecPreference,
    pub storage: StorageTarget,
}

impl JobSpec {
    /// Create a spec with a freshly generated id.
    pub fn new(
        source_url: impl Into<String>,
        platform: Platform,
        preferences: FormatPreferences,
        codec: CodecPreference,
        storage: StorageTarget,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_url: source_url.into(),
            platform,
            preferences,
            codec,
            storage,
        }
    }

    /// True when the job needs an H.264 re-encode after download.
    pub fn needs_transcode(&self) -> bool {
        self.codec == CodecPreference::H264 && self.platform.is_video_platform()
    }
}

/// Reasons a submission is refused before a job is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("{0}")]
    InvalidUrl(String),

    #[error("This link ({platform}) has already been processed (history is enabled).")]
    Duplicate { platform: String },

    #[error("Storage configuration is incomplete.")]
    StorageNotConfigured,
}

/// Check that `raw` is an http(s) URL belonging to `platform`.
///
/// Unknown platforms are accepted; the caller is expected to log a warning.
pub fn validate_source_url(raw: &str, platform: &Platform) -> Result<(), SubmissionError> {
    let invalid = || {
        let mut msg = format!("Invalid URL for {}.", platform);
        match platform {
            Platform::Instagram => {
                msg.push_str(" Make sure it is a reel or post link (contains /reel/ or /p/).")
            }
            Platform::Twitter => {
                msg.push_str(" Make sure it is a tweet link (contains /status/).")
            }
            _ => {}
        }
        SubmissionError::InvalidUrl(msg)
    };

    if !(raw.starts_with("http://") || raw.starts_with("https://")) {
        return Err(invalid());
    }
    let parsed = Url::parse(raw).map_err(|_| invalid())?;
    let domain = parsed.host_str().unwrap_or_default().to_lowercase();
    let path = parsed.path().to_lowercase();

    let ok = match platform {
        Platform::SoundCloud => domain.contains("soundcloud.com"),
        Platform::YouTube => domain.contains("youtube.com") || domain.contains("youtu.be"),
        Platform::TikTok => domain.contains("tiktok.com"),
        Platform::Instagram => {
            domain.contains("instagram.com") && (path.contains("/reel/") || path.contains("/p/"))
        }
        Platform::Twitter => {
            (domain.contains("twitter.com") || domain.contains("x.com"))
                && path.contains("/status/")
        }
        Platform::Other(_) => true,
    };

    if ok {
        Ok(())
    } else {
        Err(invalid())
    }
}
