//! Caption Sweep Coordination Library
//!
//! This library provides the orchestration behind image-caption checkpoint
//! sweeps:
//! - Shard planning over a flat image corpus
//! - Bounded, resumable fan-out of shard inference jobs
//! - Per-run aggregation and ensemble caption voting across runs
//! - Evaluation through an external scorer
//!
//! # Pipeline
//!
//! ```text
//! ShardPlanner ─► ShardJobRunner (per run) ─► aggregate_run ─► EnsembleReducer ─► EvaluationInvoker
//!                       │                                                              │
//!                 run_<i>/shard_<key>.json     captions_run<i>.json   submission.json   eval.txt
//! ```
//!
//! [`SweepController`] drives the pipeline for each checkpoint and skips any
//! stage whose artifact already exists.
//!
//! # Usage
//!
//! ```ignore
//! use coordination::{SweepConfig, SweepController};
//!
//! let config = SweepConfig::load(Some(Path::new("sweep.toml")))?;
//! let controller = SweepController::from_config(config)?;
//! let report = controller.run_sweep().await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod aggregate;
pub mod artifact;
pub mod config;
pub mod corpus;
pub mod ensemble;
pub mod evaluation;
pub mod progress;
pub mod runner;
pub mod sweep;
pub mod types;

pub use aggregate::{aggregate_run, load_run, AggregateError, AggregateReport};
pub use artifact::{ArtifactError, ArtifactResult};
pub use config::{ConfigError, DecodeConfig, SweepConfig, VotingConfig};
pub use corpus::{ImageRecord, PlanError, Shard, ShardPlan, ShardPlanner};
pub use ensemble::{
    EnsembleReducer, ReduceReport, VoteOutcome, VotingError, VotingProtocol, VotingStrategy,
};
pub use evaluation::{CommandScorer, EvalError, EvaluationInvoker, EvaluationReport, Scorer};
pub use progress::{ProgressEntry, ProgressLog, ProgressMarker};
pub use runner::{
    CommandBackend, InferenceBackend, RunContext, RunReport, RunnerConfig, RunnerError, ShardJob,
    ShardJobRunner, ShardState, ShardStatus,
};
pub use sweep::{CheckpointReport, CheckpointStatus, SweepController, SweepError, SweepReport};
pub use types::{CaptionResult, ConsensusResult, ImageId, RunOutput, Submission};
