//! Ensemble caption reduction
//!
//! Combines K independent runs over the same corpus into one submission.
//!
//! # Workflow
//!
//! ```text
//! run_0 ─┐
//! run_1 ─┼─► EnsembleSet (image → candidates) ─► VotingProtocol ─► Submission
//! run_K ─┘
//! ```
//!
//! 1. Candidates are grouped per image across runs, keeping each run's index
//! 2. Each group is voted on independently (see [`voting`])
//! 3. Images covered by fewer than K runs are voted on with what exists and
//!    reported as partial coverage
//! 4. Expected images covered by no run fail the reduction with the full list
//!
//! # Usage
//!
//! ```ignore
//! use coordination::ensemble::{EnsembleReducer, VotingProtocol, VotingStrategy};
//!
//! let reducer = EnsembleReducer::new(VotingProtocol::new(VotingStrategy::TokenOverlap, 2));
//! let report = reducer.reduce(&runs, Some(&plan.image_ids()))?;
//! artifact::write_json_atomic(&path, &report.submission)?;
//! ```

pub mod similarity;
pub mod voting;

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::types::{ConsensusResult, ImageId, RunOutput, Submission};

pub use voting::{
    Candidate, ScoredCandidate, VoteOutcome, VotingError, VotingProtocol, VotingResult,
    VotingStrategy,
};

/// Candidates for every image across all runs
#[derive(Debug, Clone, Default)]
pub struct EnsembleSet {
    /// Image ids in first-seen order (run order, then position within run)
    order: Vec<ImageId>,
    groups: HashMap<ImageId, Vec<Candidate>>,
    /// Number of runs that went into the set
    run_count: usize,
    /// Images listed more than once inside a single run
    duplicates: Vec<RunDuplicate>,
}

impl EnsembleSet {
    /// Group candidates by image. A run listing an image twice keeps the first.
    pub fn from_runs(runs: &[RunOutput]) -> Self {
        let mut set = Self {
            run_count: runs.len(),
            ..Default::default()
        };

        for run in runs {
            let mut seen: HashSet<&str> = HashSet::new();
            for result in &run.results {
                if !seen.insert(result.image_id.as_str()) {
                    warn!(run = run.run_index, image_id = %result.image_id, "Duplicate image in run, keeping first");
                    set.duplicates.push(RunDuplicate {
                        run_index: run.run_index,
                        image_id: result.image_id.clone(),
                    });
                    continue;
                }
                let group = set.groups.entry(result.image_id.clone()).or_insert_with(|| {
                    set.order.push(result.image_id.clone());
                    Vec::new()
                });
                group.push(Candidate::new(run.run_index, result.caption.clone()));
            }
        }
        set
    }

    pub fn run_count(&self) -> usize {
        self.run_count
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn image_ids(&self) -> &[ImageId] {
        &self.order
    }

    /// Candidates for one image; empty when no run covered it
    pub fn candidates(&self, image_id: &str) -> &[Candidate] {
        self.groups.get(image_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn duplicates(&self) -> &[RunDuplicate] {
        &self.duplicates
    }
}

/// A second caption for an image inside one run; the first one was kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDuplicate {
    pub run_index: usize,
    pub image_id: ImageId,
}

/// An image covered by only some of the runs
#[derive(Debug, Clone, Serialize)]
pub struct PartialCoverage {
    pub image_id: ImageId,
    pub runs_present: Vec<usize>,
}

/// Result of reducing K runs
#[derive(Debug, Clone, Serialize)]
pub struct ReduceReport {
    pub submission: Submission,
    pub outcomes: Vec<VoteOutcome>,
    pub run_count: usize,
    pub partial: Vec<PartialCoverage>,
    /// Images present in runs but absent from the expected corpus
    pub unexpected: Vec<ImageId>,
    pub duplicates: Vec<RunDuplicate>,
}

impl ReduceReport {
    /// Outcomes that needed tie-breaking
    pub fn tie_broken(&self) -> usize {
        self.outcomes.iter().filter(|o| o.tie_broken).count()
    }
}

/// Reduces K run outputs to one consensus caption per image
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsembleReducer {
    protocol: VotingProtocol,
}

impl EnsembleReducer {
    pub fn new(protocol: VotingProtocol) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> &VotingProtocol {
        &self.protocol
    }

    /// Reduce `runs` to a submission.
    ///
    /// With `expected`, the submission follows that order and any expected
    /// image missing from every run fails the whole reduction. Without it,
    /// images appear in first-seen order.
    pub fn reduce(
        &self,
        runs: &[RunOutput],
        expected: Option<&[ImageId]>,
    ) -> VotingResult<ReduceReport> {
        if runs.is_empty() {
            return Err(VotingError::NoRuns);
        }

        let set = EnsembleSet::from_runs(runs);
        let (order, unexpected) = match expected {
            Some(ids) => {
                let missing: Vec<ImageId> = ids
                    .iter()
                    .filter(|id| set.candidates(id).is_empty())
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(VotingError::EmptyEnsemble { image_ids: missing });
                }

                let known: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let unexpected: Vec<ImageId> = set
                    .image_ids()
                    .iter()
                    .filter(|id| !known.contains(id.as_str()))
                    .cloned()
                    .collect();
                if !unexpected.is_empty() {
                    warn!(
                        count = unexpected.len(),
                        first = %unexpected[0],
                        "Runs contain images outside the corpus; appending them"
                    );
                }
                let mut order = ids.to_vec();
                order.extend(unexpected.iter().cloned());
                (order, unexpected)
            }
            None => (set.image_ids().to_vec(), Vec::new()),
        };

        let mut outcomes = Vec::with_capacity(order.len());
        let mut partial = Vec::new();
        for image_id in &order {
            let outcome = self.protocol.vote(image_id, set.candidates(image_id))?;
            if outcome.runs_present.len() < set.run_count() {
                partial.push(PartialCoverage {
                    image_id: image_id.clone(),
                    runs_present: outcome.runs_present.clone(),
                });
            }
            outcomes.push(outcome);
        }

        if !partial.is_empty() {
            warn!(
                images = partial.len(),
                runs = set.run_count(),
                "Some images are covered by only part of the ensemble"
            );
        }

        let submission: Submission = outcomes
            .iter()
            .map(|o| ConsensusResult {
                image_id: o.image_id.clone(),
                caption: o.winner.clone(),
            })
            .collect();

        let report = ReduceReport {
            submission,
            outcomes,
            run_count: set.run_count(),
            partial,
            unexpected,
            duplicates: set.duplicates().to_vec(),
        };
        info!(
            images = report.submission.len(),
            runs = report.run_count,
            strategy = %self.protocol.strategy(),
            partial = report.partial.len(),
            tie_broken = report.tie_broken(),
            "Ensemble reduced"
        );
        Ok(report)
    }
}
