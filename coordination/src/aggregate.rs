//! Run aggregation
//!
//! Concatenates the shard outputs of one run, in shard-key order, into a
//! single per-run caption file. A missing or unparsable shard is fatal for
//! the run: merging around it would hand the voter an incomplete corpus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::{self, ArtifactError};
use crate::corpus::ShardPlan;
use crate::types::{CaptionResult, ImageId, RunOutput};

/// Errors raised while merging a run
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Run {run} is missing output for shard {shard}: {}", .path.display())]
    MissingShard {
        run: usize,
        shard: String,
        path: PathBuf,
    },

    #[error("Run {run} has unusable output for shard {shard}: {source}")]
    MalformedShard {
        run: usize,
        shard: String,
        #[source]
        source: ArtifactError,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Result type for aggregation
pub type AggregateResult<T> = Result<T, AggregateError>;

/// An image reported by more than one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateImage {
    pub image_id: ImageId,
    /// Shard whose record was kept
    pub kept: String,
    pub dropped: String,
}

/// Summary of one merge
#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport {
    pub run_index: usize,
    pub shards: usize,
    pub captions: usize,
    pub duplicates: Vec<DuplicateImage>,
    pub output: PathBuf,
}

/// Merge every shard of `plan` found in `run_dir` and write the result to
/// `output` atomically.
pub fn aggregate_run(
    run_index: usize,
    run_dir: &Path,
    plan: &ShardPlan,
    output: &Path,
) -> AggregateResult<AggregateReport> {
    let mut merged: Vec<CaptionResult> = Vec::with_capacity(plan.total_images());
    let mut owner: HashMap<ImageId, String> = HashMap::new();
    let mut duplicates = Vec::new();

    for shard in &plan.shards {
        let path = shard.output_path(run_dir);
        let results: Vec<CaptionResult> = match artifact::read_json(&path) {
            Ok(r) => r,
            Err(ArtifactError::NotFound { path }) => {
                return Err(AggregateError::MissingShard {
                    run: run_index,
                    shard: shard.key.clone(),
                    path,
                })
            }
            Err(source) => {
                return Err(AggregateError::MalformedShard {
                    run: run_index,
                    shard: shard.key.clone(),
                    source,
                })
            }
        };

        for result in results {
            if let Some(kept) = owner.get(&result.image_id) {
                warn!(
                    run = run_index,
                    image_id = %result.image_id,
                    kept = %kept,
                    dropped = %shard.key,
                    "Image reported by two shards, keeping the first"
                );
                duplicates.push(DuplicateImage {
                    image_id: result.image_id.clone(),
                    kept: kept.clone(),
                    dropped: shard.key.clone(),
                });
                continue;
            }
            owner.insert(result.image_id.clone(), shard.key.clone());
            merged.push(result);
        }
    }

    artifact::write_json_atomic(output, &merged)?;

    let report = AggregateReport {
        run_index,
        shards: plan.shards.len(),
        captions: merged.len(),
        duplicates,
        output: output.to_path_buf(),
    };
    info!(
        run = run_index,
        shards = report.shards,
        captions = report.captions,
        duplicates = report.duplicates.len(),
        output = %output.display(),
        "Run aggregated"
    );
    Ok(report)
}

/// Load a per-run caption file
pub fn load_run(run_index: usize, path: &Path) -> AggregateResult<RunOutput> {
    let results: Vec<CaptionResult> = artifact::read_json(path)?;
    Ok(RunOutput::new(run_index, results))
}
