//! Evaluation invoker
//!
//! Hands a finished submission to the external scorer, persists its full
//! output, and pulls out the summary lines for a quick look. Scores are never
//! parsed or recomputed here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::{self, ArtifactError};
use crate::config::SweepConfig;
use crate::runner::backend::{render_word, stderr_tail};
use crate::runner::exit_label;

/// Errors raised while scoring a submission
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Submission not found: {}", .path.display())]
    MissingSubmission { path: PathBuf },

    #[error("Invalid evaluation command: {0}")]
    InvalidTemplate(String),

    #[error("Invalid summary marker: {0}")]
    InvalidMarker(#[from] regex::Error),

    #[error("Failed to launch scorer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Scorer exited with {}: {stderr}", exit_label(.code))]
    ScorerFailed { code: Option<i32>, stderr: String },

    #[error("Scorer timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Result type for evaluation
pub type EvalResult<T> = Result<T, EvalError>;

/// External scoring process
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score `submission` against `references`, returning the report text.
    ///
    /// A scorer that exits abnormally must return an error, never partial text.
    async fn score(&self, submission: &Path, references: &Path) -> EvalResult<String>;
}

/// Runs the scorer from a shell-word command template
#[derive(Debug, Clone)]
pub struct CommandScorer {
    template: Vec<String>,
    timeout: Duration,
}

impl CommandScorer {
    pub fn new(template: &str, timeout: Duration) -> EvalResult<Self> {
        let template = shlex::split(template)
            .ok_or_else(|| EvalError::InvalidTemplate(format!("unbalanced quotes: {}", template)))?;
        if template.is_empty() {
            return Err(EvalError::InvalidTemplate("empty command".into()));
        }
        Ok(Self { template, timeout })
    }

    pub fn from_config(config: &SweepConfig) -> EvalResult<Self> {
        Self::new(&config.eval_command, config.eval_timeout())
    }

    pub fn render(&self, submission: &Path, references: &Path) -> Vec<String> {
        let submission = submission.display().to_string();
        let references = references.display().to_string();
        let substitutions = [
            ("{submission}", submission.as_str()),
            ("{references}", references.as_str()),
        ];
        self.template
            .iter()
            .map(|word| render_word(word, &substitutions))
            .collect()
    }
}

#[async_trait]
impl Scorer for CommandScorer {
    async fn score(&self, submission: &Path, references: &Path) -> EvalResult<String> {
        let argv = self.render(submission, references);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EvalError::InvalidTemplate("empty command".into()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %program, submission = %submission.display(), "Spawning scorer");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(EvalError::Spawn(e)),
            Err(_) => return Err(EvalError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            return Err(EvalError::ScorerFailed {
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Persisted scorer output plus its summary lines
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub output: PathBuf,
    pub summary_lines: Vec<String>,
    pub elapsed_ms: u64,
}

/// Runs the scorer and stores its report
pub struct EvaluationInvoker {
    scorer: Arc<dyn Scorer>,
    references: PathBuf,
    marker: Regex,
}

impl EvaluationInvoker {
    pub fn new(scorer: Arc<dyn Scorer>, references: PathBuf, marker: &str) -> EvalResult<Self> {
        Ok(Self {
            scorer,
            references,
            marker: Regex::new(marker)?,
        })
    }

    pub fn from_config(config: &SweepConfig, scorer: Arc<dyn Scorer>) -> EvalResult<Self> {
        Self::new(scorer, config.references_file.clone(), &config.summary_marker)
    }

    pub fn marker(&self) -> &Regex {
        &self.marker
    }

    /// Score `submission` and write the scorer's full output to `output`.
    ///
    /// Nothing is written unless the scorer succeeds.
    pub async fn evaluate(&self, submission: &Path, output: &Path) -> EvalResult<EvaluationReport> {
        if !submission.is_file() {
            return Err(EvalError::MissingSubmission {
                path: submission.to_path_buf(),
            });
        }

        let start = Instant::now();
        let text = self.scorer.score(submission, &self.references).await?;
        artifact::write_text_atomic(output, &text)?;

        let summary_lines = summary_lines(&text, &self.marker);
        for line in &summary_lines {
            info!(target: "caption_sweep::eval", "{}", line);
        }

        let report = EvaluationReport {
            output: output.to_path_buf(),
            summary_lines,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            output = %output.display(),
            summary_lines = report.summary_lines.len(),
            elapsed_ms = report.elapsed_ms,
            "Evaluation written"
        );
        Ok(report)
    }
}

/// Lines of `text` matching `marker`, trailing whitespace removed
pub fn summary_lines(text: &str, marker: &Regex) -> Vec<String> {
    text.lines()
        .filter(|line| marker.is_match(line))
        .map(|line| line.trim_end().to_string())
        .collect()
}

/// Summary lines of an evaluation report already on disk
pub fn read_summary(path: &Path, marker: &Regex) -> EvalResult<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EvalError::Artifact(if e.kind() == std::io::ErrorKind::NotFound {
            ArtifactError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ArtifactError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        })
    })?;
    Ok(summary_lines(&text, marker))
}
