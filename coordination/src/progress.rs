//! Progress log for sweep-progress.log
//!
//! Append-only, one human-readable line per pipeline event. The log outlives
//! the process, so an operator can see which shards failed or which images
//! had partial ensembles without replaying tracing output.
//!
//! Format: `[TIMESTAMP] [CHECKPOINT] [RUN:N|-] [MARKER] [SCOPE?] summary`

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactError, ArtifactResult};

/// File name of the progress log under the output root
pub const PROGRESS_FILE: &str = "sweep-progress.log";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[(?P<ts>[^\]]+)\] \[(?P<checkpoint>[^\]]*)\] \[RUN:(?P<run>\d+|-)\] \[(?P<marker>[A-Z_]+)\](?: \[(?P<scope>[^\]]*)\])?(?: (?P<summary>.*))?$",
    )
    .expect("LINE_PATTERN regex should compile")
});

/// Progress entry markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressMarker {
    SweepStart,
    SweepEnd,
    ShardDone,
    ShardSkipped,
    ShardFailed,
    RunAggregated,
    DuplicateImage,
    PartialEnsemble,
    CheckpointVoted,
    CheckpointScored,
    CheckpointSkipped,
    Error,
}

impl ProgressMarker {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "SWEEP_START" => Some(Self::SweepStart),
            "SWEEP_END" => Some(Self::SweepEnd),
            "SHARD_DONE" => Some(Self::ShardDone),
            "SHARD_SKIPPED" => Some(Self::ShardSkipped),
            "SHARD_FAILED" => Some(Self::ShardFailed),
            "RUN_AGGREGATED" => Some(Self::RunAggregated),
            "DUPLICATE_IMAGE" => Some(Self::DuplicateImage),
            "PARTIAL_ENSEMBLE" => Some(Self::PartialEnsemble),
            "CHECKPOINT_VOTED" => Some(Self::CheckpointVoted),
            "CHECKPOINT_SCORED" => Some(Self::CheckpointScored),
            "CHECKPOINT_SKIPPED" => Some(Self::CheckpointSkipped),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProgressMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SweepStart => write!(f, "SWEEP_START"),
            Self::SweepEnd => write!(f, "SWEEP_END"),
            Self::ShardDone => write!(f, "SHARD_DONE"),
            Self::ShardSkipped => write!(f, "SHARD_SKIPPED"),
            Self::ShardFailed => write!(f, "SHARD_FAILED"),
            Self::RunAggregated => write!(f, "RUN_AGGREGATED"),
            Self::DuplicateImage => write!(f, "DUPLICATE_IMAGE"),
            Self::PartialEnsemble => write!(f, "PARTIAL_ENSEMBLE"),
            Self::CheckpointVoted => write!(f, "CHECKPOINT_VOTED"),
            Self::CheckpointScored => write!(f, "CHECKPOINT_SCORED"),
            Self::CheckpointSkipped => write!(f, "CHECKPOINT_SKIPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One line of the progress log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    /// Checkpoint id, or `-` for sweep-wide events
    pub checkpoint: String,
    pub run: Option<usize>,
    pub marker: ProgressMarker,
    /// Shard key or image id the event is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub summary: String,
}

impl ProgressEntry {
    pub fn new(checkpoint: impl Into<String>, marker: ProgressMarker, summary: impl Into<String>) -> Self {
        Self {
            // The log only keeps whole seconds
            timestamp: Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now),
            checkpoint: checkpoint.into(),
            run: None,
            marker,
            scope: None,
            summary: summary.into(),
        }
    }

    pub fn with_run(mut self, run: usize) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Format as one log line
    pub fn to_log_line(&self) -> String {
        let run = self
            .run
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        let scope = self
            .scope
            .as_ref()
            .map(|s| format!(" [{}]", s))
            .unwrap_or_default();
        // Keep one entry per line whatever the summary contains
        let summary = self.summary.replace(['\r', '\n'], " ");

        format!(
            "[{}] [{}] [RUN:{}] [{}]{} {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.checkpoint,
            run,
            self.marker,
            scope,
            summary
        )
    }

    /// Parse a log line; `None` for anything not written by `to_log_line`
    pub fn from_log_line(line: &str) -> Option<Self> {
        let caps = LINE_PATTERN.captures(line.trim_end())?;

        let timestamp = NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        let run = match &caps["run"] {
            "-" => None,
            n => Some(n.parse().ok()?),
        };
        let marker = ProgressMarker::from_str(&caps["marker"])?;

        Some(Self {
            timestamp,
            checkpoint: caps["checkpoint"].to_string(),
            run,
            marker,
            scope: caps.name("scope").map(|m| m.as_str().to_string()),
            summary: caps
                .name("summary")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
    }
}

/// Progress log under the output root
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Log located at `<output_root>/sweep-progress.log`
    pub fn in_dir(output_root: &Path) -> Self {
        Self::new(output_root.join(PROGRESS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append an entry
    pub fn append(&self, entry: &ProgressEntry) -> ArtifactResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                crate::artifact::ensure_dir(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        writeln!(file, "{}", entry.to_log_line()).map_err(|e| self.io_error(e))
    }

    /// Append, logging instead of failing. The log is diagnostic only.
    pub fn record(&self, entry: ProgressEntry) {
        if let Err(e) = self.append(&entry) {
            tracing::warn!(error = %e, marker = %entry.marker, "Could not write progress log");
        }
    }

    /// Read all entries, skipping unparsable lines
    pub fn read_all(&self) -> ArtifactResult<Vec<ProgressEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        let reader = BufReader::new(file);

        Ok(reader
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| ProgressEntry::from_log_line(&line))
            .collect())
    }

    /// Read last N entries
    pub fn read_last(&self, n: usize) -> ArtifactResult<Vec<ProgressEntry>> {
        let entries = self.read_all()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Entries for one checkpoint
    pub fn checkpoint_entries(&self, checkpoint: &str) -> ArtifactResult<Vec<ProgressEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.checkpoint == checkpoint)
            .collect())
    }
}
