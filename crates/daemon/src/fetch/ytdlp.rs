//! yt-dlp fetcher
//!
//! Runs yt-dlp twice per job: once to resolve the title and output name,
//! then to download with `--newline` so progress arrives one line at a time.

use super::{classify_download_error, FetchError, FetchRequest, FetchedMedia, MediaFetcher};
use crate::job::{MediaFormat, Mp4Quality, Platform};
use crate::keygen::random_suffix;
use crate::reporter::JobReporter;
use crate::status::strip_ansi_codes;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::SystemTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Output template relative to the download directory
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Minimum percentage change between two logged progress lines
const PROGRESS_LOG_STEP: i64 = 5;

/// Extensions accepted in addition to `.mp4` when locating a video download
const ALT_VIDEO_EXTENSIONS: &[&str] = &[".webm", ".mkv", ".mov", ".avi"];

/// Fetcher backed by the yt-dlp command line tool.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: String,
    download_dir: PathBuf,
    cookie_file: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(download_dir: impl Into<PathBuf>, cookie_file: Option<PathBuf>) -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            download_dir: download_dir.into(),
            cookie_file,
        }
    }

    /// Use a different executable, e.g. an absolute path.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--no-playlist", "--restrict-filenames", "--no-color"]);
        if let Some(cookie) = &self.cookie_file {
            cmd.arg("--cookies").arg(cookie);
        }
        cmd.arg("-o")
            .arg(self.download_dir.join(OUTPUT_TEMPLATE))
            .stdin(Stdio::null());
        cmd
    }

    fn spawn_error(e: std::io::Error) -> FetchError {
        match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::ToolMissing,
            _ => FetchError::Io(e.to_string()),
        }
    }

    /// Resolve id, title and the file name yt-dlp will write.
    async fn probe(&self, request: &FetchRequest) -> Result<ProbeInfo, FetchError> {
        let mut cmd = self.base_command();
        cmd.args(["--print", "id", "--print", "title", "--print", "filename"])
            .arg(&request.source_url);

        let output = cmd.output().await.map_err(Self::spawn_error)?;
        if !output.status.success() {
            let stderr = strip_ansi_codes(&String::from_utf8_lossy(&output.stderr));
            error!("yt-dlp info extraction failed: {}", stderr.trim());
            return Err(classify_download_error(&stderr, self.cookie_file.is_some()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().map(str::trim);
        let id = lines.next().unwrap_or_default().to_string();
        let raw_title = lines.next().unwrap_or_default().to_string();
        let filename = lines.next().unwrap_or_default().to_string();

        let base_name = Path::new(&filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(ProbeInfo {
            title: display_title(&request.platform, &raw_title, &id),
            base_name,
        })
    }
}

struct ProbeInfo {
    title: String,
    base_name: String,
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        reporter: &JobReporter,
    ) -> Result<FetchedMedia, FetchError> {
        let job_id = reporter.job_id().to_string();
        reporter.log(format!("Starting download from {}...", request.platform));
        reporter.progress(0.0);

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;

        let selection = download_args(request)?;
        match &self.cookie_file {
            Some(path) => info!(job_id = %job_id, "Using cookie file: {}", path.display()),
            None => debug!(job_id = %job_id, "No cookie file configured"),
        }

        reporter.log("Extracting information...");
        let probe = self.probe(request).await?;
        reporter.log(format!("Downloading '{}'...", probe.title));

        let mut cmd = self.base_command();
        cmd.arg("--newline")
            .args(&selection)
            .arg(&request.source_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(Self::spawn_error)?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            let mut throttle = ProgressThrottle::default();
            while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
                let line = strip_ansi_codes(&line);
                if let Some(progress) = parse_progress_line(&line) {
                    reporter.progress(progress.percent);
                    if throttle.should_log(progress.percent) {
                        reporter.log(format!(
                            "Download: {} - {}",
                            probe.title, progress.detail
                        ));
                    }
                } else if line.starts_with("[ExtractAudio]") || line.starts_with("[Merger]") {
                    reporter.note(line.trim());
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let stderr = strip_ansi_codes(&stderr);
            error!(job_id = %job_id, url = %request.source_url, "yt-dlp failed: {}", stderr.trim());
            return Err(classify_download_error(&stderr, self.cookie_file.is_some()));
        }

        let expected = request.expected_extension();
        let Some(path) = locate_download(&self.download_dir, &probe.base_name, expected) else {
            return Err(FetchError::OutputMissing {
                title: probe.title,
                dir: self.download_dir.display().to_string(),
            });
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        reporter.log(format!("Download complete: {}", file_name));
        info!(job_id = %job_id, "Downloaded file: {}", path.display());

        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| expected.to_string());

        Ok(FetchedMedia {
            path,
            title: probe.title,
            extension,
        })
    }
}

/// Format selection and post-processing arguments for a request.
pub fn download_args(request: &FetchRequest) -> Result<Vec<String>, FetchError> {
    let prefs = &request.preferences;
    let audio = |args: &mut Vec<String>| {
        args.extend(["-f", "bestaudio/best", "-x", "--audio-format", "mp3"].map(String::from));
        if prefs.mp3_bitrate != "Best" {
            let kbps = prefs.mp3_bitrate.trim_end_matches(['k', 'K']);
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", kbps));
        }
    };

    let mut args = Vec::new();
    let format = match (&request.platform, prefs.format) {
        (Platform::SoundCloud, _) | (Platform::YouTube, MediaFormat::Mp3) => {
            audio(&mut args);
            return Ok(args);
        }
        (Platform::YouTube, MediaFormat::Mp4) => match prefs.mp4_quality {
            Some(Mp4Quality::Best) => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
            Some(Mp4Quality::Medium) => {
                "bestvideo[height<=?720][ext=mp4]+bestaudio[ext=m4a]/best[height<=?720][ext=mp4]/best[height<=?720]"
            }
            Some(Mp4Quality::Low) => {
                "bestvideo[height<=?480][ext=mp4]+bestaudio[ext=m4a]/best[height<=?480][ext=mp4]/best[height<=?480]"
            }
            None => {
                warn!("Unknown MP4 quality, using best");
                "best[ext=mp4]/best"
            }
        },
        (Platform::TikTok, _) => "bestvideo[ext=mp4]+bestaudio/best[ext=mp4]/best",
        (Platform::Instagram, _) => {
            "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo[ext=mp4]/best[ext=mp4]/best"
        }
        (Platform::Twitter, _) => {
            "bestvideo[ext=mp4]+bestaudio/bestvideo+bestaudio/best[ext=mp4]/best"
        }
        (Platform::Other(name), format) => {
            return Err(FetchError::UnsupportedCombination {
                platform: name.clone(),
                format: format!("{:?}", format).to_lowercase(),
            })
        }
    };

    args.push("-f".to_string());
    args.push(format.to_string());
    Ok(args)
}

/// Title shown to users. Instagram and Twitter titles are often just the
/// post text, so links are stripped and an id-based name is used when
/// nothing is left.
pub fn display_title(platform: &Platform, raw_title: &str, id: &str) -> String {
    static URLS: OnceLock<Regex> = OnceLock::new();

    let raw_title = strip_ansi_codes(raw_title);
    let title = match platform {
        Platform::Instagram | Platform::Twitter => {
            let re = URLS.get_or_init(|| {
                Regex::new(r#"https?://[^\s<>"]+|www\.[^\s<>"]+"#).expect("static URL pattern")
            });
            re.replace_all(&raw_title, "").trim().to_string()
        }
        _ => raw_title.trim().to_string(),
    };

    let missing = title.is_empty() || title == "NA";
    match platform {
        Platform::Instagram | Platform::Twitter if missing => {
            let id = if id.is_empty() || id == "NA" {
                random_suffix(6)
            } else {
                id.to_string()
            };
            format!("{}_Video_{}", platform, id)
        }
        _ if missing => "Unknown title".to_string(),
        _ => title,
    }
}

/// One parsed `[download]` progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub percent: f64,
    /// Remainder of the line from the percentage on, e.g. `42.0% of 3.45MiB at ...`
    pub detail: String,
}

/// Read one line, replacing invalid UTF-8 instead of failing.
///
/// Returns `None` at end of stream or on a read error.
pub async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf);
            Some(line.trim_end_matches(['\n', '\r']).to_string())
        }
    }
}

/// Parse a yt-dlp `--newline` progress line.
pub fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    static PROGRESS: OnceLock<Regex> = OnceLock::new();
    let re = PROGRESS.get_or_init(|| {
        Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%(.*)$").expect("static progress pattern")
    });

    let caps = re.captures(line.trim())?;
    let percent: f64 = caps[1].parse().ok()?;
    let detail = format!("{}%{}", &caps[1], caps[2].trim_end());
    Some(DownloadProgress {
        percent,
        detail: detail.split_whitespace().collect::<Vec<_>>().join(" "),
    })
}

/// Limits progress log lines to the start, the end and every
/// [`PROGRESS_LOG_STEP`] points in between.
#[derive(Debug, Default)]
struct ProgressThrottle {
    last: Option<i64>,
}

impl ProgressThrottle {
    fn should_log(&mut self, percent: f64) -> bool {
        let current = percent as i64;
        let due = match self.last {
            None => true,
            Some(last) => {
                current == 0 || current == 100 || (current - last).abs() >= PROGRESS_LOG_STEP
            }
        };
        if due {
            self.last = Some(current);
        }
        due
    }
}

/// Find the downloaded file: name starts with `base_name` (case-insensitive)
/// and has the expected extension, or any common video container when
/// `.mp4` is expected. The most recently modified match wins.
pub fn locate_download(dir: &Path, base_name: &str, expected_ext: &str) -> Option<PathBuf> {
    let expected_ext = expected_ext.to_lowercase();
    let mut candidates = vec![expected_ext.as_str()];
    if expected_ext == ".mp4" {
        candidates.extend_from_slice(ALT_VIDEO_EXTENSIONS);
    }
    let prefix = base_name.to_lowercase();

    let mut best: Option<(PathBuf, SystemTime)> = None;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !stem.starts_with(&prefix) || !candidates.contains(&ext.as_str()) {
            continue;
        }

        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().map_or(true, |(_, t)| modified > *t) {
            best = Some((path.to_path_buf(), modified));
        }
    }

    best.map(|(path, _)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FormatPreferences, Platform};
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_stop_reading() {
        let mut input: &[u8] = b"[download]  10.0% of 1MiB\n\xff\xfe broken\r\n[download] 100% of 1MiB\n";
        let mut buf = Vec::new();
        let mut lines = Vec::new();
        while let Some(line) = next_lossy_line(&mut input, &mut buf).await {
            lines.push(line);
        }

        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(" broken"));
        assert!(lines[1].contains('\u{FFFD}'));
        assert_eq!(parse_progress_line(&lines[2]).map(|p| p.percent), Some(100.0));
    }

    fn request(platform: Platform, format: MediaFormat) -> FetchRequest {
        FetchRequest {
            source_url: "https://example.com/x".to_string(),
            platform,
            preferences: FormatPreferences {
                format,
                ..FormatPreferences::default()
            },
        }
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_audio_args_with_bitrate() {
        let args = download_args(&request(Platform::SoundCloud, MediaFormat::Mp3)).unwrap();
        assert!(has_flag_with_value(&args, "-f", "bestaudio/best"));
        assert!(has_flag_with_value(&args, "--audio-format", "mp3"));
        assert!(has_flag_with_value(&args, "--audio-quality", "192K"));
    }

    #[test]
    fn test_audio_args_best_bitrate_has_no_quality() {
        let mut req = request(Platform::YouTube, MediaFormat::Mp3);
        req.preferences.mp3_bitrate = "Best".to_string();
        let args = download_args(&req).unwrap();
        assert!(args.contains(&"-x".to_string()));
        assert!(!args.contains(&"--audio-quality".to_string()));
    }

    #[test]
    fn test_youtube_video_quality() {
        let mut req = request(Platform::YouTube, MediaFormat::Mp4);
        req.preferences.mp4_quality = Some(Mp4Quality::Medium);
        let args = download_args(&req).unwrap();
        assert!(args[1].contains("height<=?720"));
        assert!(!args.contains(&"-x".to_string()));
    }

    #[test]
    fn test_unknown_platform_is_rejected() {
        let req = request(Platform::Other("Vimeo".to_string()), MediaFormat::Mp4);
        assert_eq!(
            download_args(&req),
            Err(FetchError::UnsupportedCombination {
                platform: "Vimeo".to_string(),
                format: "mp4".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_progress_line() {
        let p = parse_progress_line("[download]  42.0% of    3.45MiB at  1.23MiB/s ETA 00:02")
            .unwrap();
        assert_eq!(p.percent, 42.0);
        assert_eq!(p.detail, "42.0% of 3.45MiB at 1.23MiB/s ETA 00:02");

        assert!(parse_progress_line("[download] Destination: a.webm").is_none());
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn test_progress_throttle() {
        let mut throttle = ProgressThrottle::default();
        let logged: Vec<f64> = [0.0, 1.0, 4.9, 5.0, 7.0, 10.2, 99.0, 100.0]
            .into_iter()
            .filter(|p| throttle.should_log(*p))
            .collect();
        assert_eq!(logged, vec![0.0, 5.0, 10.2, 99.0, 100.0]);
    }

    #[test]
    fn test_display_title() {
        assert_eq!(display_title(&Platform::YouTube, "My Song", "id1"), "My Song");
        assert_eq!(
            display_title(&Platform::Twitter, "look https://t.co/abc", "99"),
            "look"
        );
        assert_eq!(
            display_title(&Platform::Instagram, "https://t.co/abc", "77"),
            "Instagram_Video_77"
        );
        assert_eq!(display_title(&Platform::SoundCloud, "", ""), "Unknown title");
    }

    #[test]
    fn test_locate_download_prefers_newest_match() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("My_Clip.mp4");
        let new = dir.path().join("my_clip.webm");
        File::create(&old).unwrap();
        File::create(&new).unwrap();
        File::create(dir.path().join("My_Clip.txt")).unwrap();
        File::create(dir.path().join("Other.mp4")).unwrap();

        let now = SystemTime::now();
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(now - Duration::from_secs(60))
            .unwrap();
        File::options()
            .write(true)
            .open(&new)
            .unwrap()
            .set_modified(now)
            .unwrap();

        assert_eq!(locate_download(dir.path(), "My_Clip", ".mp4"), Some(new));
        assert_eq!(locate_download(dir.path(), "My_Clip", ".mp3"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_missing() {
        use crate::store::StatusStore;
        use crate::status::JobStatus;

        let dir = TempDir::new().unwrap();
        let store = StatusStore::shared();
        store.create("job", JobStatus::queued(0)).unwrap();
        let reporter = JobReporter::new(store, "job");

        let fetcher = YtDlpFetcher::new(dir.path(), None).with_binary("definitely-not-yt-dlp-xyz");
        let err = fetcher
            .fetch(&request(Platform::SoundCloud, MediaFormat::Mp3), &reporter)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::ToolMissing);
    }
}
