//! Per-shard status files
//!
//! The status file is the explicit completion marker for a shard. Output
//! presence alone is only trusted when the output also parses.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{self, ArtifactError, ArtifactResult};

/// Lifecycle of one shard job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted status of one shard in one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard: String,
    pub state: ShardState,
    pub attempts: u32,
    /// Images planned for the shard
    pub images: usize,
    /// Captions in the accepted output
    pub captions: usize,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShardStatus {
    pub fn pending(shard: impl Into<String>, images: usize) -> Self {
        Self {
            shard: shard.into(),
            state: ShardState::Pending,
            attempts: 0,
            images,
            captions: 0,
            updated_at: Utc::now(),
            error: None,
        }
    }

    /// Mark a new attempt as started
    pub fn start_attempt(&mut self) {
        self.state = ShardState::Running;
        self.attempts += 1;
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_done(&mut self, captions: usize) {
        self.state = ShardState::Done;
        self.captions = captions;
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = ShardState::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn is_done(&self) -> bool {
        self.state == ShardState::Done
    }

    /// Load a status file; a missing or unreadable file yields `None`
    pub fn load(path: &Path) -> Option<Self> {
        match artifact::read_json(path) {
            Ok(status) => Some(status),
            Err(ArtifactError::NotFound { .. }) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable shard status");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> ArtifactResult<()> {
        artifact::write_json_atomic(path, self)
    }
}
