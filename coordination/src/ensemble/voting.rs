//! Voting protocol for caption consensus
//!
//! Scores every distinct candidate caption of one image by its agreement
//! with the other candidates in the group, then picks the best one.
//!
//! # Tie-breaking
//!
//! Scores within `SCORE_EPSILON` are equal. Among equal scores the candidate
//! produced by more runs wins; after that, the one first produced by the
//! lowest run index. The outcome therefore depends only on the candidates
//! and their run indices, never on hash or completion order.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::similarity::{token_similarity, tokenize};
use crate::types::ImageId;

/// Error type for voting operations
#[derive(Debug, thiserror::Error)]
pub enum VotingError {
    #[error("No candidates for image {0}")]
    NoCandidates(ImageId),

    #[error("No run outputs to reduce")]
    NoRuns,

    #[error("{} image(s) have no caption in any run: {}", .image_ids.len(), preview(.image_ids))]
    EmptyEnsemble { image_ids: Vec<ImageId> },
}

fn preview(ids: &[ImageId]) -> String {
    const SHOWN: usize = 10;
    let mut s = ids.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if ids.len() > SHOWN {
        s.push_str(&format!(", ... (+{})", ids.len() - SHOWN));
    }
    s
}

/// Result type for voting operations
pub type VotingResult<T> = Result<T, VotingError>;

/// Scores closer than this are treated as a tie
pub const SCORE_EPSILON: f64 = 1e-9;

/// How candidates are scored against each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    /// Fraction of the other runs that produced the identical string
    Majority,
    /// Mean n-gram F1 similarity against the other runs' captions
    #[default]
    TokenOverlap,
}

impl std::fmt::Display for VotingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Majority => write!(f, "majority"),
            Self::TokenOverlap => write!(f, "token_overlap"),
        }
    }
}

/// One run's caption for an image
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub run_index: usize,
    pub caption: String,
}

impl Candidate {
    pub fn new(run_index: usize, caption: impl Into<String>) -> Self {
        Self {
            run_index,
            caption: caption.into(),
        }
    }
}

/// A distinct caption with its aggregate score
#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub caption: String,
    /// Runs that produced exactly this string
    pub votes: usize,
    /// Lowest run index that produced it
    pub first_run: usize,
    pub score: f64,
}

/// Outcome of voting for one image
#[derive(Debug, Clone, Serialize)]
pub struct VoteOutcome {
    pub image_id: ImageId,
    pub winner: String,
    pub score: f64,
    pub votes: usize,
    /// Distinct candidates in first-seen order
    pub candidates: Vec<ScoredCandidate>,
    /// Runs that contributed a caption
    pub runs_present: Vec<usize>,
    /// Whether the winner needed the tie-break rules
    pub tie_broken: bool,
}

/// Voting protocol implementation
#[derive(Debug, Clone, Copy)]
pub struct VotingProtocol {
    strategy: VotingStrategy,
    max_ngram: usize,
}

impl Default for VotingProtocol {
    fn default() -> Self {
        Self::new(VotingStrategy::default(), 2)
    }
}

impl VotingProtocol {
    pub fn new(strategy: VotingStrategy, max_ngram: usize) -> Self {
        Self {
            strategy,
            max_ngram: max_ngram.max(1),
        }
    }

    pub fn strategy(&self) -> VotingStrategy {
        self.strategy
    }

    /// Pick the consensus caption among `candidates`
    pub fn vote(&self, image_id: &str, candidates: &[Candidate]) -> VotingResult<VoteOutcome> {
        if candidates.is_empty() {
            return Err(VotingError::NoCandidates(image_id.to_string()));
        }

        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| c.run_index);
        let runs_present: Vec<usize> = ordered.iter().map(|c| c.run_index).collect();

        let scored = self.score(&ordered);

        let mut best = 0;
        for i in 1..scored.len() {
            if beats(&scored[i], &scored[best]) {
                best = i;
            }
        }
        let winner = &scored[best];
        let tie_broken = scored
            .iter()
            .enumerate()
            .any(|(i, c)| i != best && (c.score - winner.score).abs() <= SCORE_EPSILON);

        debug!(
            image_id,
            strategy = %self.strategy,
            candidates = scored.len(),
            score = winner.score,
            tie_broken,
            "Vote complete"
        );

        Ok(VoteOutcome {
            image_id: image_id.to_string(),
            winner: winner.caption.clone(),
            score: winner.score,
            votes: winner.votes,
            candidates: scored.clone(),
            runs_present,
            tie_broken,
        })
    }

    /// Aggregate score of each distinct caption against all other candidates
    fn score(&self, ordered: &[&Candidate]) -> Vec<ScoredCandidate> {
        let mut distinct: Vec<ScoredCandidate> = Vec::new();
        for c in ordered {
            match distinct.iter_mut().find(|d| d.caption == c.caption) {
                Some(d) => d.votes += 1,
                None => distinct.push(ScoredCandidate {
                    caption: c.caption.clone(),
                    votes: 1,
                    first_run: c.run_index,
                    score: 0.0,
                }),
            }
        }

        let others = ordered.len().saturating_sub(1);
        if others == 0 {
            return distinct;
        }

        match self.strategy {
            VotingStrategy::Majority => {
                for d in &mut distinct {
                    d.score = (d.votes - 1) as f64 / others as f64;
                }
            }
            VotingStrategy::TokenOverlap => {
                let tokens: Vec<Vec<String>> =
                    distinct.iter().map(|d| tokenize(&d.caption)).collect();
                let votes: Vec<usize> = distinct.iter().map(|d| d.votes).collect();

                for (i, d) in distinct.iter_mut().enumerate() {
                    // Identical copies from other runs agree fully
                    let mut total = (votes[i] - 1) as f64;
                    for (j, other) in tokens.iter().enumerate() {
                        if i != j {
                            total += votes[j] as f64
                                * token_similarity(&tokens[i], other, self.max_ngram);
                        }
                    }
                    d.score = total / others as f64;
                }
            }
        }

        distinct
    }
}

/// Whether `a` ranks strictly above `b`
fn beats(a: &ScoredCandidate, b: &ScoredCandidate) -> bool {
    if (a.score - b.score).abs() > SCORE_EPSILON {
        return a.score > b.score;
    }
    if a.votes != b.votes {
        return a.votes > b.votes;
    }
    a.first_run < b.first_run
}
