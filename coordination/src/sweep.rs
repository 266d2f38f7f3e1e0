//! Checkpoint sweep controller
//!
//! Drives planning, inference, aggregation, voting and evaluation for each
//! checkpoint in order, writing everything under `<output_root>/<checkpoint>/`.
//!
//! # Re-entrancy
//!
//! Every stage is skipped when its artifact already exists:
//!
//! | Stage      | Artifact                         |
//! |------------|----------------------------------|
//! | inference  | `run_<i>/shard_<key>.json` (done) |
//! | aggregate  | `captions_run<i>.json`           |
//! | vote       | `submission.json`                |
//! | evaluate   | `eval.txt`                       |
//!
//! A checkpoint with `eval.txt` is finished and never touched again; deleting
//! only that file re-runs only the evaluation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::aggregate::{self, AggregateError, AggregateReport};
use crate::artifact::{self, ArtifactError};
use crate::config::{ConfigError, SweepConfig};
use crate::corpus::{PlanError, ShardPlan, ShardPlanner};
use crate::ensemble::{EnsembleReducer, ReduceReport, VotingError, VotingProtocol};
use crate::evaluation::{self, CommandScorer, EvalError, EvaluationInvoker, EvaluationReport, Scorer};
use crate::progress::{ProgressEntry, ProgressLog, ProgressMarker};
use crate::runner::{
    CommandBackend, InferenceBackend, RunContext, RunReport, RunnerConfig, RunnerError,
    ShardFailure, ShardJobRunner,
};

/// Per-run merged captions
pub fn run_captions_path(checkpoint_dir: &Path, run_index: usize) -> PathBuf {
    checkpoint_dir.join(format!("captions_run{}.json", run_index))
}

/// Shard directory of one run
pub fn run_dir(checkpoint_dir: &Path, run_index: usize) -> PathBuf {
    checkpoint_dir.join(format!("run_{}", run_index))
}

pub const SUBMISSION_FILE: &str = "submission.json";
pub const EVAL_FILE: &str = "eval.txt";
pub const REPORT_FILE: &str = "sweep-report.json";

/// Partial-ensemble images written individually to the progress log
const PARTIAL_LOG_LIMIT: usize = 25;

/// Errors that abort one checkpoint (or the whole sweep, for config errors)
#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Checkpoint {checkpoint}: {} shard job(s) failed ({})", .failures.len(), describe_failures(.failures))]
    ShardsFailed {
        checkpoint: String,
        failures: Vec<(usize, ShardFailure)>,
    },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Voting(#[from] VotingError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

fn describe_failures(failures: &[(usize, ShardFailure)]) -> String {
    failures
        .iter()
        .map(|(run, f)| format!("run {} shard {}", run, f.shard))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SweepError {
    /// Shard jobs behind this error, if it is a shard failure
    pub fn shards_failed(&self) -> usize {
        match self {
            Self::ShardsFailed { failures, .. } => failures.len(),
            _ => 0,
        }
    }
}

/// Result type for sweep operations
pub type SweepResult<T> = Result<T, SweepError>;

/// Final state of one checkpoint in a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Scored,
    Skipped,
    Failed,
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scored => write!(f, "scored"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Entry of sweep-report.json
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    pub checkpoint: String,
    pub status: CheckpointStatus,
    pub runs: usize,
    pub shards_failed: usize,
    pub partial_images: usize,
    pub summary_lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckpointReport {
    fn new(checkpoint: &str, status: CheckpointStatus, runs: usize) -> Self {
        Self {
            checkpoint: checkpoint.to_string(),
            status,
            runs,
            shards_failed: 0,
            partial_images: 0,
            summary_lines: Vec::new(),
            error: None,
        }
    }
}

/// Outcome of a whole sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub checkpoints: Vec<CheckpointReport>,
    pub elapsed_ms: u64,
}

impl SweepReport {
    pub fn any_failed(&self) -> bool {
        self.count(CheckpointStatus::Failed) > 0
    }

    pub fn count(&self, status: CheckpointStatus) -> usize {
        self.checkpoints.iter().filter(|c| c.status == status).count()
    }
}

/// Drives the per-checkpoint pipeline
pub struct SweepController {
    config: SweepConfig,
    planner: ShardPlanner,
    runner: ShardJobRunner,
    reducer: EnsembleReducer,
    evaluator: EvaluationInvoker,
    progress: ProgressLog,
}

impl SweepController {
    /// Build a controller around explicit collaborators
    pub fn new(
        config: SweepConfig,
        backend: Arc<dyn InferenceBackend>,
        scorer: Arc<dyn Scorer>,
    ) -> SweepResult<Self> {
        config.validate()?;
        let planner = ShardPlanner::from_config(&config);
        let runner = ShardJobRunner::new(backend, RunnerConfig::from_sweep(&config));
        let reducer = EnsembleReducer::new(VotingProtocol::new(
            config.voting.strategy,
            config.voting.max_ngram,
        ));
        let evaluator = EvaluationInvoker::from_config(&config, scorer)?;
        let progress = ProgressLog::in_dir(&config.output_root);
        Ok(Self {
            config,
            planner,
            runner,
            reducer,
            evaluator,
            progress,
        })
    }

    /// Build a controller that runs the configured command templates
    pub fn from_config(config: SweepConfig) -> SweepResult<Self> {
        let backend = Arc::new(CommandBackend::from_config(&config)?);
        let scorer = Arc::new(CommandScorer::from_config(&config)?);
        Self::new(config, backend, scorer)
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn progress(&self) -> &ProgressLog {
        &self.progress
    }

    pub fn evaluator(&self) -> &EvaluationInvoker {
        &self.evaluator
    }

    /// Scan the corpus into shards
    pub fn plan(&self) -> SweepResult<ShardPlan> {
        Ok(self.planner.plan()?)
    }

    /// Run every shard of one run, recording shard events
    pub async fn infer(
        &self,
        checkpoint: &str,
        run_index: usize,
        plan: &ShardPlan,
    ) -> SweepResult<RunReport> {
        let checkpoint_dir = self.config.checkpoint_output_dir(checkpoint);
        let ctx = RunContext {
            checkpoint_id: checkpoint.to_string(),
            checkpoint_path: self.config.checkpoint_path(checkpoint),
            run_index,
            run_dir: run_dir(&checkpoint_dir, run_index),
        };

        let report = self.runner.run(&ctx, plan).await?;

        for key in &report.skipped {
            self.progress.record(
                ProgressEntry::new(checkpoint, ProgressMarker::ShardSkipped, "output already present")
                    .with_run(run_index)
                    .with_scope(key),
            );
        }
        for key in &report.completed {
            let images = plan.shard(key).map(|s| s.len()).unwrap_or(0);
            self.progress.record(
                ProgressEntry::new(checkpoint, ProgressMarker::ShardDone, format!("{} images", images))
                    .with_run(run_index)
                    .with_scope(key),
            );
        }
        for failure in &report.failed {
            self.progress.record(
                ProgressEntry::new(checkpoint, ProgressMarker::ShardFailed, &failure.error)
                    .with_run(run_index)
                    .with_scope(&failure.shard),
            );
        }
        Ok(report)
    }

    /// Merge one run's shards into `captions_run<i>.json`
    pub fn aggregate(
        &self,
        checkpoint: &str,
        run_index: usize,
        plan: &ShardPlan,
    ) -> SweepResult<AggregateReport> {
        let checkpoint_dir = self.config.checkpoint_output_dir(checkpoint);
        let report = aggregate::aggregate_run(
            run_index,
            &run_dir(&checkpoint_dir, run_index),
            plan,
            &run_captions_path(&checkpoint_dir, run_index),
        )?;

        for dup in &report.duplicates {
            self.progress.record(
                ProgressEntry::new(
                    checkpoint,
                    ProgressMarker::DuplicateImage,
                    format!("kept shard {}, dropped shard {}", dup.kept, dup.dropped),
                )
                .with_run(run_index)
                .with_scope(&dup.image_id),
            );
        }
        self.progress.record(
            ProgressEntry::new(
                checkpoint,
                ProgressMarker::RunAggregated,
                format!("{} captions from {} shards", report.captions, report.shards),
            )
            .with_run(run_index),
        );
        Ok(report)
    }

    /// Reduce the checkpoint's per-run files into `submission.json`
    pub fn vote(&self, checkpoint: &str, plan: &ShardPlan) -> SweepResult<ReduceReport> {
        let checkpoint_dir = self.config.checkpoint_output_dir(checkpoint);
        let runs = (0..self.config.run_count)
            .map(|i| aggregate::load_run(i, &run_captions_path(&checkpoint_dir, i)))
            .collect::<Result<Vec<_>, _>>()?;

        let expected = plan.image_ids();
        let report = self.reducer.reduce(&runs, Some(&expected))?;
        artifact::write_json_atomic(&checkpoint_dir.join(SUBMISSION_FILE), &report.submission)?;

        for dup in &report.duplicates {
            self.progress.record(
                ProgressEntry::new(checkpoint, ProgressMarker::DuplicateImage, "listed twice in run, kept first")
                    .with_run(dup.run_index)
                    .with_scope(&dup.image_id),
            );
        }
        for partial in report.partial.iter().take(PARTIAL_LOG_LIMIT) {
            self.progress.record(
                ProgressEntry::new(
                    checkpoint,
                    ProgressMarker::PartialEnsemble,
                    format!("runs {:?} of {}", partial.runs_present, report.run_count),
                )
                .with_scope(&partial.image_id),
            );
        }
        if report.partial.len() > PARTIAL_LOG_LIMIT {
            self.progress.record(ProgressEntry::new(
                checkpoint,
                ProgressMarker::PartialEnsemble,
                format!("{} more images with partial coverage", report.partial.len() - PARTIAL_LOG_LIMIT),
            ));
        }
        self.progress.record(ProgressEntry::new(
            checkpoint,
            ProgressMarker::CheckpointVoted,
            format!(
                "{} images from {} runs ({}), {} tie-broken",
                report.submission.len(),
                report.run_count,
                self.reducer.protocol().strategy(),
                report.tie_broken()
            ),
        ));
        Ok(report)
    }

    /// Score the checkpoint's submission into `eval.txt`
    pub async fn evaluate(&self, checkpoint: &str) -> SweepResult<EvaluationReport> {
        let checkpoint_dir = self.config.checkpoint_output_dir(checkpoint);
        let report = self
            .evaluator
            .evaluate(&checkpoint_dir.join(SUBMISSION_FILE), &checkpoint_dir.join(EVAL_FILE))
            .await?;
        self.progress.record(ProgressEntry::new(
            checkpoint,
            ProgressMarker::CheckpointScored,
            report.summary_lines.join(" | "),
        ));
        Ok(report)
    }

    /// Run the whole pipeline for one checkpoint, skipping finished stages
    pub async fn run_checkpoint(&self, checkpoint: &str) -> SweepResult<CheckpointReport> {
        let start = Instant::now();
        let checkpoint_dir = self.config.checkpoint_output_dir(checkpoint);
        let runs = self.config.run_count;
        let eval_path = checkpoint_dir.join(EVAL_FILE);

        if eval_path.exists() {
            info!(checkpoint, "Evaluation present, skipping checkpoint");
            self.progress.record(ProgressEntry::new(
                checkpoint,
                ProgressMarker::CheckpointSkipped,
                "evaluation already present",
            ));
            let mut report = CheckpointReport::new(checkpoint, CheckpointStatus::Skipped, runs);
            report.summary_lines =
                evaluation::read_summary(&eval_path, self.evaluator.marker()).unwrap_or_default();
            return Ok(report);
        }

        artifact::ensure_dir(&checkpoint_dir)?;
        let mut report = CheckpointReport::new(checkpoint, CheckpointStatus::Scored, runs);

        if checkpoint_dir.join(SUBMISSION_FILE).exists() {
            info!(checkpoint, "Submission present, going straight to evaluation");
        } else {
            let plan = self.plan()?;
            info!(
                checkpoint,
                shards = plan.shards.len(),
                images = plan.total_images(),
                runs,
                "Starting checkpoint"
            );

            let mut failures = Vec::new();
            for run_index in 0..runs {
                if run_captions_path(&checkpoint_dir, run_index).exists() {
                    info!(checkpoint, run = run_index, "Run already aggregated");
                    continue;
                }
                let run_report = self.infer(checkpoint, run_index, &plan).await?;
                failures.extend(run_report.failed.into_iter().map(|f| (run_index, f)));
            }
            // Aggregation needs every shard; leave the rest for the next invocation
            if !failures.is_empty() {
                return Err(SweepError::ShardsFailed {
                    checkpoint: checkpoint.to_string(),
                    failures,
                });
            }

            for run_index in 0..runs {
                if !run_captions_path(&checkpoint_dir, run_index).exists() {
                    self.aggregate(checkpoint, run_index, &plan)?;
                }
            }

            let reduced = self.vote(checkpoint, &plan)?;
            report.partial_images = reduced.partial.len();
        }

        let evaluation = self.evaluate(checkpoint).await?;
        report.summary_lines = evaluation.summary_lines;

        info!(
            checkpoint,
            partial_images = report.partial_images,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checkpoint scored"
        );
        Ok(report)
    }

    /// Sweep every configured checkpoint in order.
    ///
    /// A failing checkpoint is logged and recorded, and the sweep moves on.
    /// Only configuration problems abort the sweep itself.
    pub async fn run_sweep(&self) -> SweepResult<SweepReport> {
        self.config.validate_for_sweep()?;
        let start = Instant::now();
        artifact::ensure_dir(&self.config.output_root)?;

        self.progress.record(ProgressEntry::new(
            "-",
            ProgressMarker::SweepStart,
            format!(
                "{} checkpoints, {} runs each",
                self.config.checkpoints.len(),
                self.config.run_count
            ),
        ));

        let mut checkpoints = Vec::with_capacity(self.config.checkpoints.len());
        for checkpoint in &self.config.checkpoints {
            match self.run_checkpoint(checkpoint).await {
                Ok(report) => checkpoints.push(report),
                Err(e) => {
                    error!(checkpoint = %checkpoint, error = %e, "Checkpoint failed");
                    self.progress
                        .record(ProgressEntry::new(checkpoint, ProgressMarker::Error, e.to_string()));
                    let mut report = CheckpointReport::new(
                        checkpoint,
                        CheckpointStatus::Failed,
                        self.config.run_count,
                    );
                    report.shards_failed = e.shards_failed();
                    report.error = Some(e.to_string());
                    checkpoints.push(report);
                }
            }
        }

        let report = SweepReport {
            checkpoints,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        artifact::write_json_atomic(&self.config.output_root.join(REPORT_FILE), &report)?;

        let failed = report.count(CheckpointStatus::Failed);
        self.progress.record(ProgressEntry::new(
            "-",
            ProgressMarker::SweepEnd,
            format!(
                "{} scored, {} skipped, {} failed",
                report.count(CheckpointStatus::Scored),
                report.count(CheckpointStatus::Skipped),
                failed
            ),
        ));
        if failed > 0 {
            warn!(failed, "Sweep finished with failed checkpoints");
        } else {
            info!(elapsed_ms = report.elapsed_ms, "Sweep finished");
        }
        Ok(report)
    }
}
