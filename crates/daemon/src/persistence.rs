//! Download history and aggregate statistics
//!
//! Both live in small pretty-printed JSON files. Load failures never
//! propagate: a missing, empty or corrupt file reads as the default and the
//! problem is logged.

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Error type for persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One finished download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Local time, `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
    pub platform: String,
    pub title: String,
    #[serde(alias = "soundcloud_url")]
    pub source_url: String,
    /// Public URL, or `s3://bucket/key` when no public base is configured
    #[serde(rename = "s3_url")]
    pub reference: String,
}

/// Running totals across all jobs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    /// Sum over successful jobs only
    pub total_duration_seconds: f64,
    /// Sum over successful jobs only
    pub total_size_bytes: u64,
}

/// Stats as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub average_duration_seconds: f64,
    pub total_size_formatted: String,
}

impl Stats {
    pub fn summary(&self) -> StatsSummary {
        let average = if self.successful_jobs > 0 {
            self.total_duration_seconds / self.successful_jobs as f64
        } else {
            0.0
        };
        StatsSummary {
            total_jobs: self.total_jobs,
            successful_jobs: self.successful_jobs,
            average_duration_seconds: (average * 100.0).round() / 100.0,
            total_size_formatted: format_size(self.total_size_bytes),
        }
    }
}

/// Human readable byte count with two decimals, e.g. `1.5 MB`.
pub fn format_size(size_bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    if size_bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = size_bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

/// History and statistics storage used by the pipeline and the HTTP layer.
pub trait Persistence: Send + Sync {
    fn history_enabled(&self) -> bool;

    /// Newest first. Empty when history is disabled.
    fn load_history(&self) -> Vec<HistoryEntry>;

    /// Prepend an entry. Returns `false` if it could not be saved.
    fn append_history(&self, platform: &str, title: &str, source_url: &str, reference: &str)
        -> bool;

    fn clear_history(&self) -> bool;

    fn load_stats(&self) -> Stats;

    /// Count one finished job. Duration and size only count on success.
    fn record_stats(&self, duration_seconds: f64, size_bytes: u64, success: bool);

    /// First history entry for `source_url`, if history is enabled.
    fn find_source(&self, source_url: &str) -> Option<HistoryEntry> {
        if !self.history_enabled() {
            return None;
        }
        self.load_history()
            .into_iter()
            .find(|entry| entry.source_url == source_url)
    }
}

/// [`Persistence`] backed by two JSON files.
#[derive(Debug)]
pub struct JsonPersistence {
    history_enabled: bool,
    history_file: PathBuf,
    stats_file: PathBuf,
    // Serializes read-modify-write cycles between workers
    write_lock: Mutex<()>,
}

impl JsonPersistence {
    pub fn new(history_enabled: bool, history_file: PathBuf, stats_file: PathBuf) -> Self {
        Self {
            history_enabled,
            history_file,
            stats_file,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &crate::config::HistoryConfig) -> Self {
        Self::new(cfg.enabled, cfg.history_file.clone(), cfg.stats_file.clone())
    }

    fn read_json<T>(path: &Path) -> Result<Option<T>, PersistenceError>
    where
        T: for<'de> Deserialize<'de>,
    {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| PersistenceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if content.trim().is_empty() {
            warn!("{} is empty", path.display());
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| PersistenceError::Json {
                path: path.display().to_string(),
                source,
            })
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(value).map_err(|source| PersistenceError::Json {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, json).map_err(|source| PersistenceError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn history_unlocked(&self) -> Vec<HistoryEntry> {
        match Self::read_json::<Vec<HistoryEntry>>(&self.history_file) {
            Ok(history) => history.unwrap_or_default(),
            Err(e) => {
                error!("Failed to load history: {}", e);
                Vec::new()
            }
        }
    }

    fn stats_unlocked(&self) -> Stats {
        match Self::read_json::<Stats>(&self.stats_file) {
            Ok(stats) => stats.unwrap_or_default(),
            Err(e) => {
                error!("Failed to load stats: {}", e);
                Stats::default()
            }
        }
    }
}

impl Persistence for JsonPersistence {
    fn history_enabled(&self) -> bool {
        self.history_enabled
    }

    fn load_history(&self) -> Vec<HistoryEntry> {
        if !self.history_enabled {
            return Vec::new();
        }
        self.history_unlocked()
    }

    fn append_history(
        &self,
        platform: &str,
        title: &str,
        source_url: &str,
        reference: &str,
    ) -> bool {
        if !self.history_enabled {
            return true;
        }
        let _guard = self.write_lock.lock();
        let mut history = self.history_unlocked();
        history.insert(
            0,
            HistoryEntry {
                timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                platform: platform.to_string(),
                title: title.to_string(),
                source_url: source_url.to_string(),
                reference: reference.to_string(),
            },
        );
        match Self::write_json(&self.history_file, &history) {
            Ok(()) => {
                info!("History saved: {}", self.history_file.display());
                true
            }
            Err(e) => {
                error!("Failed to save history: {}", e);
                false
            }
        }
    }

    fn clear_history(&self) -> bool {
        if !self.history_enabled {
            return true;
        }
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(&self.history_file) {
            Ok(()) => {
                info!("History file removed");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                error!("Failed to remove history file: {}", e);
                false
            }
        }
    }

    fn load_stats(&self) -> Stats {
        self.stats_unlocked()
    }

    fn record_stats(&self, duration_seconds: f64, size_bytes: u64, success: bool) {
        let _guard = self.write_lock.lock();
        let mut stats = self.stats_unlocked();
        stats.total_jobs += 1;
        if success {
            stats.successful_jobs += 1;
            stats.total_duration_seconds += duration_seconds;
            stats.total_size_bytes += size_bytes;
        }
        if let Err(e) = Self::write_json(&self.stats_file, &stats) {
            error!("Failed to save stats: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn persistence(dir: &TempDir, enabled: bool) -> JsonPersistence {
        JsonPersistence::new(
            enabled,
            dir.path().join("download_history.json"),
            dir.path().join("stats.json"),
        )
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5 MB");
    }

    #[test]
    fn test_history_newest_first() {
        let dir = TempDir::new().unwrap();
        let p = persistence(&dir, true);

        assert!(p.append_history("YouTube", "one", "https://youtu.be/1", "https://cdn/1.mp4"));
        assert!(p.append_history("TikTok", "two", "https://tiktok.com/2", "s3://media/2.mp4"));

        let history = p.load_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].title, "two");
        assert_eq!(history[1].reference, "https://cdn/1.mp4");
        assert_eq!(
            p.find_source("https://youtu.be/1").map(|e| e.platform),
            Some("YouTube".to_string())
        );

        assert!(p.clear_history());
        assert!(p.load_history().is_empty());
        assert!(p.clear_history());
    }

    #[test]
    fn test_disabled_history_is_noop() {
        let dir = TempDir::new().unwrap();
        let p = persistence(&dir, false);
        assert!(p.append_history("YouTube", "t", "https://youtu.be/1", "r"));
        assert!(p.load_history().is_empty());
        assert!(p.find_source("https://youtu.be/1").is_none());
        assert!(!dir.path().join("download_history.json").exists());
    }

    #[test]
    fn test_corrupt_files_load_as_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("download_history.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("stats.json"), "").unwrap();
        let p = persistence(&dir, true);
        assert!(p.load_history().is_empty());
        assert_eq!(p.load_stats(), Stats::default());
    }

    #[test]
    fn test_legacy_history_field() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("download_history.json"),
            r#"[{"timestamp":"2024-01-01 10:00:00","platform":"SoundCloud","title":"t",
                "soundcloud_url":"https://soundcloud.com/a/b","s3_url":"https://cdn/x.mp3"}]"#,
        )
        .unwrap();
        let p = persistence(&dir, true);
        assert!(p.find_source("https://soundcloud.com/a/b").is_some());
    }

    #[test]
    fn test_stats_count_duration_only_on_success() {
        let dir = TempDir::new().unwrap();
        let p = persistence(&dir, true);
        p.record_stats(10.0, 1000, true);
        p.record_stats(99.0, 5000, false);
        p.record_stats(5.0, 24, true);

        let stats = p.load_stats();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.successful_jobs, 2);
        assert_eq!(stats.total_size_bytes, 1024);

        let summary = stats.summary();
        assert_eq!(summary.average_duration_seconds, 7.5);
        assert_eq!(summary.total_size_formatted, "1 KB");
    }

    #[test]
    fn test_partial_stats_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stats.json"), r#"{"total_jobs": 4}"#).unwrap();
        let p = persistence(&dir, true);
        let stats = p.load_stats();
        assert_eq!(stats.total_jobs, 4);
        assert_eq!(stats.successful_jobs, 0);
    }
}
