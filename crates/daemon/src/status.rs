//! Job status records and the typed partial update applied to them.
//!
//! A [`JobStatus`] is owned by the status store; workers never hold one
//! directly; they describe changes as a [`StatusUpdate`] which the store
//! merges under the record lock via [`JobStatus::apply`].

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;

/// Maximum number of log lines retained per job.
pub const LOG_CAPACITY: usize = 100;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the submission queue.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Error => "error",
        }
    }

    /// Completed or error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Error)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded log of timestamped lines; the oldest line is dropped first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogBuffer {
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already formatted line, evicting from the front when full.
    pub fn push(&mut self, line: String) {
        while self.lines.len() >= LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    pub fn last(&self) -> Option<&String> {
        self.lines.back()
    }
}

/// Remove terminal control sequences (colors, cursor movement) from text.
pub fn strip_ansi_codes(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("static ANSI pattern")
    });
    re.replace_all(text, "").into_owned()
}

/// Format a log line as `HH:MM:SS - text` using local wall-clock time.
pub fn timestamped(text: &str) -> String {
    format!("{} - {}", Local::now().format("%H:%M:%S"), text)
}

/// Three-way field patch: leave alone, set, or clear.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    fn apply_to(self, slot: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Set(value) => *slot = Some(value),
            Patch::Clear => *slot = None,
        }
    }
}

/// Status record of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub running: bool,
    pub progress: f64,
    pub message: String,
    pub logs: LogBuffer,
    pub error: Option<String>,
    pub result_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    /// Submission order, breaks ties between equal `created_at` values.
    pub seq: u64,
}

impl JobStatus {
    /// Fresh record for a job that has just been accepted.
    pub fn queued(seq: u64) -> Self {
        let now = Utc::now();
        let mut logs = LogBuffer::new();
        logs.push(timestamped("Job queued."));
        Self {
            state: JobState::Queued,
            running: false,
            progress: 0.0,
            message: "Waiting in queue...".to_string(),
            logs,
            error: None,
            result_reference: None,
            created_at: now,
            last_update_at: now,
            seq,
        }
    }

    /// Merge a partial update into this record.
    ///
    /// Rules, in order:
    /// - `message` and `log` are applied with control sequences stripped,
    ///   `progress` is clamped to 0..=100
    /// - `error` forces `running = false` and `state = error` and always
    ///   overwrites `message`; the `error` field keeps the first cause and
    ///   later ones are appended to the log
    /// - `result_reference` follows its [`Patch`]
    /// - `running = false` without an error promotes a running job to `completed`
    /// - an explicit `state` is honored unless an error is recorded
    pub fn apply(&mut self, update: StatusUpdate) {
        self.last_update_at = Utc::now();

        if let Some(message) = update.message {
            self.message = strip_ansi_codes(&message);
        }
        if let Some(progress) = update.progress {
            self.progress = clamp_progress(progress);
        }
        if let Some(line) = update.log {
            self.logs.push(timestamped(&strip_ansi_codes(&line)));
        }

        if let Some(error) = update.error {
            let error = strip_ansi_codes(&error);
            self.message = format!("Error: {}", error);
            match &self.error {
                None => self.error = Some(error),
                Some(_) => self.logs.push(timestamped(&format!("Error: {}", error))),
            }
        }

        update.result_reference.apply_to(&mut self.result_reference);

        if let Some(running) = update.running {
            self.running = running;
            if !running && self.error.is_none() && self.state == JobState::Running {
                self.state = JobState::Completed;
            }
        }

        if let Some(state) = update.state {
            if self.error.is_none() {
                self.state = state;
            }
        }

        if self.error.is_some() {
            self.running = false;
            self.state = JobState::Error;
        }
    }
}

fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Partial update to a [`JobStatus`]. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusUpdate {
    pub message: Option<String>,
    pub progress: Option<f64>,
    pub log: Option<String>,
    pub error: Option<String>,
    pub result_reference: Patch<String>,
    pub running: Option<bool>,
    pub state: Option<JobState>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.log = Some(line.into());
        self
    }

    /// Log a line and make it the current message.
    pub fn say(self, line: impl Into<String>) -> Self {
        let line = line.into();
        self.message(line.clone()).log(line)
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn result_reference(mut self, reference: impl Into<String>) -> Self {
        self.result_reference = Patch::Set(reference.into());
        self
    }

    pub fn running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }
}
