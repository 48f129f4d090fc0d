//! Object storage collaborators.
//!
//! The pipeline only sees the [`ObjectStore`] and [`ObjectStoreConnector`]
//! traits; [`s3`] provides the real implementation.

pub mod s3;

use crate::job::StorageTarget;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub use s3::{S3Connector, S3ObjectStore};

/// Errors reported by object storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Client could not be built from the supplied settings
    #[error("Failed to configure storage client: {0}")]
    Config(String),

    /// Credentials missing or rejected
    #[error("Storage credentials missing or invalid: {0}")]
    Credentials(String),

    /// Existence check failed for a reason other than "not found"
    #[error("Storage error while checking name {key}: {detail}")]
    Probe { key: String, detail: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    /// Every generated candidate name was already taken
    #[error("Could not allocate a unique object name after {attempts} attempts")]
    NameSaturation { attempts: u32 },

    #[error("Local source file not found: {0}")]
    SourceMissing(String),
}

/// Connection to one object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(false)` only when the store positively reports the key as absent.
    async fn key_exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError>;

    async fn upload(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

/// Builds a fresh [`ObjectStore`] for each job from that job's credentials.
#[async_trait]
pub trait ObjectStoreConnector: Send + Sync {
    async fn connect(&self, target: &StorageTarget) -> Result<Box<dyn ObjectStore>, StoreError>;
}

/// MIME type for an upload, derived from the file extension.
pub fn content_type_for(extension: &str) -> &'static str {
    match extension.trim_start_matches('.').to_lowercase().as_str() {
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Public URL of an uploaded object under `base`.
pub fn public_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), urlencoding::encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(".mp4"), "video/mp4");
        assert_eq!(content_type_for(".MP3"), "audio/mpeg");
        assert_eq!(content_type_for("mov"), "video/quicktime");
        assert_eq!(content_type_for(".avi"), "video/x-msvideo");
        assert_eq!(content_type_for(".webm"), "video/webm");
        assert_eq!(content_type_for(".mkv"), "application/octet-stream");
    }

    #[test]
    fn test_public_url_encodes_key() {
        assert_eq!(
            public_url("https://cdn.example.com/media/", "26ab12.mp3"),
            "https://cdn.example.com/media/26ab12.mp3"
        );
        assert_eq!(
            public_url("https://cdn.example.com", "a b.mp4"),
            "https://cdn.example.com/a%20b.mp4"
        );
    }
}
