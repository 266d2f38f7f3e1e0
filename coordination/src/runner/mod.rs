//! Shard job runner
//!
//! Fans one run's shards out to the inference collaborator through a bounded
//! worker pool. Each shard is owned by exactly one job, so no two jobs ever
//! write the same file.
//!
//! # Resumption
//!
//! A shard is skipped when its status file says `done` and its output is
//! present. An output without a status file is adopted if it parses and
//! discarded otherwise. New output is staged at `<output>.partial`, validated,
//! then renamed into place before the status flips to `done`, so a crash at
//! any point leaves either no output or a complete one.
//!
//! # Failure isolation
//!
//! A failing shard records `failed` in its status file, leaves no output, and
//! never aborts its siblings. The next invocation retries it.

pub mod backend;
pub mod status;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::artifact::{self, ArtifactError};
use crate::config::SweepConfig;
use crate::corpus::{Shard, ShardPlan};
use crate::types::CaptionResult;

pub use backend::{CommandBackend, InferenceBackend, ShardJob};
pub use status::{ShardState, ShardStatus};

/// Errors raised by shard jobs
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid command template: {0}")]
    InvalidTemplate(String),

    #[error("Failed to launch inference for shard {shard}: {source}")]
    Spawn {
        shard: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Inference for shard {shard} exited with {}: {stderr}", exit_label(.code))]
    CollaboratorFailed {
        shard: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Inference for shard {shard} timed out after {after:?}")]
    Timeout { shard: String, after: Duration },

    #[error("Shard {shard} produced unusable output: {source}")]
    MalformedOutput {
        shard: String,
        #[source]
        source: ArtifactError,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Shard worker panicked: {0}")]
    Panicked(String),
}

pub(crate) fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "signal".to_string(),
    }
}

/// Result type for runner operations
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Identity of one run of one checkpoint
#[derive(Debug, Clone)]
pub struct RunContext {
    pub checkpoint_id: String,
    pub checkpoint_path: PathBuf,
    pub run_index: usize,
    /// Directory holding this run's shard files
    pub run_dir: PathBuf,
}

/// A shard that did not complete
#[derive(Debug, Clone, Serialize)]
pub struct ShardFailure {
    pub shard: String,
    pub error: String,
}

/// What happened to each shard of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_index: usize,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<ShardFailure>,
}

impl RunReport {
    /// True when every shard has output on disk
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn launched(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub corpus_dir: PathBuf,
    pub max_parallel: usize,
    pub launch_delay: Duration,
    pub job_timeout: Duration,
    pub device: Option<String>,
}

impl RunnerConfig {
    pub fn from_sweep(config: &SweepConfig) -> Self {
        Self {
            corpus_dir: config.corpus_dir.clone(),
            max_parallel: config.max_parallel.max(1),
            launch_delay: config.launch_delay(),
            job_timeout: config.job_timeout(),
            device: config.device.clone(),
        }
    }
}

/// Outcome of resumption checks for one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Output is complete; do nothing
    Skip,
    /// Shard needs (re)processing
    Launch,
}

/// Runs the shards of one run through an `InferenceBackend`
pub struct ShardJobRunner {
    backend: Arc<dyn InferenceBackend>,
    config: RunnerConfig,
}

impl ShardJobRunner {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: RunnerConfig) -> Self {
        Self { backend, config }
    }

    /// Process every shard of `plan` for one run.
    ///
    /// Only I/O errors on the run directory itself abort the call; shard-level
    /// failures are collected in the report.
    pub async fn run(&self, ctx: &RunContext, plan: &ShardPlan) -> RunnerResult<RunReport> {
        artifact::ensure_dir(&ctx.run_dir)?;

        let start = Instant::now();
        let mut report = RunReport {
            run_index: ctx.run_index,
            ..Default::default()
        };

        let sem = Arc::new(Semaphore::new(self.config.max_parallel));
        let ctx = Arc::new(ctx.clone());
        let mut join_set: JoinSet<RunnerResult<usize>> = JoinSet::new();
        let mut keys: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut launched = 0usize;

        for shard in &plan.shards {
            if resume_decision(shard, &ctx.run_dir) == ResumeDecision::Skip {
                debug!(checkpoint = %ctx.checkpoint_id, run = ctx.run_index, shard = %shard.key, "Shard already complete");
                report.skipped.push(shard.key.clone());
                continue;
            }

            if launched > 0 && !self.config.launch_delay.is_zero() {
                tokio::time::sleep(self.config.launch_delay).await;
            }
            launched += 1;

            let sem = sem.clone();
            let ctx = ctx.clone();
            let backend = self.backend.clone();
            let config = self.config.clone();
            let shard = shard.clone();

            let key = shard.key.clone();
            let handle = join_set.spawn(async move {
                let _permit = sem.acquire_owned().await;
                process_shard(backend.as_ref(), &config, &ctx, &shard).await
            });
            keys.insert(handle.id(), key);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            let id = match &joined {
                Ok((id, _)) => *id,
                Err(e) => e.id(),
            };
            let key = keys.remove(&id).unwrap_or_else(|| "?".into());
            match joined {
                Ok((_, Ok(captions))) => {
                    info!(checkpoint = %ctx.checkpoint_id, run = ctx.run_index, shard = %key, captions, "Shard complete");
                    report.completed.push(key);
                }
                Ok((_, Err(e))) => {
                    warn!(checkpoint = %ctx.checkpoint_id, run = ctx.run_index, shard = %key, error = %e, "Shard failed");
                    report.failed.push(ShardFailure {
                        shard: key,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    // The status file of a panicked shard stays `running`; it
                    // has no output, so the next invocation relaunches it.
                    warn!(checkpoint = %ctx.checkpoint_id, run = ctx.run_index, shard = %key, error = %e, "Shard worker panicked");
                    report.failed.push(ShardFailure {
                        shard: key,
                        error: RunnerError::Panicked(e.to_string()).to_string(),
                    });
                }
            }
        }

        // Completion order is arbitrary; report in key order
        let order = |k: &String| plan.shards.iter().position(|s| &s.key == k);
        report.completed.sort_by_key(order);
        report.failed.sort_by_key(|f| order(&f.shard));

        info!(
            checkpoint = %ctx.checkpoint_id,
            run = ctx.run_index,
            completed = report.completed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(report)
    }
}

/// Decide whether a shard must be (re)launched, cleaning up stale output
pub fn resume_decision(shard: &Shard, run_dir: &Path) -> ResumeDecision {
    let output = shard.output_path(run_dir);
    let status_path = shard.status_path(run_dir);

    if !output.exists() {
        return ResumeDecision::Launch;
    }

    if ShardStatus::load(&status_path).is_some_and(|s| s.is_done()) {
        return ResumeDecision::Skip;
    }

    // Output without a done marker: trust it only if it parses
    match artifact::read_json::<Vec<CaptionResult>>(&output) {
        Ok(results) => {
            let mut status = ShardStatus::pending(&shard.key, shard.len());
            status.mark_done(results.len());
            if let Err(e) = status.save(&status_path) {
                warn!(shard = %shard.key, error = %e, "Could not record adopted shard output");
            }
            ResumeDecision::Skip
        }
        Err(e) => {
            warn!(shard = %shard.key, error = %e, "Discarding unparsable shard output");
            if let Err(e) = artifact::remove_if_exists(&output) {
                warn!(shard = %shard.key, error = %e, "Could not remove stale output");
            }
            ResumeDecision::Launch
        }
    }
}

/// Run one shard end to end; returns the number of accepted captions
async fn process_shard(
    backend: &dyn InferenceBackend,
    config: &RunnerConfig,
    ctx: &RunContext,
    shard: &Shard,
) -> RunnerResult<usize> {
    let run_dir = &ctx.run_dir;
    let output = shard.output_path(run_dir);
    let status_path = shard.status_path(run_dir);

    let mut status =
        ShardStatus::load(&status_path).unwrap_or_else(|| ShardStatus::pending(&shard.key, shard.len()));
    status.images = shard.len();
    status.start_attempt();
    status.save(&status_path)?;

    let result = attempt_shard(backend, config, ctx, shard, &output).await;

    match &result {
        Ok(captions) => status.mark_done(*captions),
        Err(e) => status.mark_failed(e.to_string()),
    }
    status.save(&status_path)?;
    result
}

async fn attempt_shard(
    backend: &dyn InferenceBackend,
    config: &RunnerConfig,
    ctx: &RunContext,
    shard: &Shard,
    output: &Path,
) -> RunnerResult<usize> {
    // Nothing to caption; an empty result still marks the shard complete
    if shard.is_empty() {
        artifact::write_json_atomic(output, &Vec::<CaptionResult>::new())?;
        return Ok(0);
    }

    let staging = artifact::staging_path(output);
    artifact::remove_if_exists(&staging)?;

    let image_list = shard.image_list_path(&ctx.run_dir);
    let listing: String = shard
        .images
        .iter()
        .map(|i| format!("{}\n", i.path.display()))
        .collect();
    artifact::write_text_atomic(&image_list, &listing)?;

    let job = ShardJob {
        checkpoint_id: ctx.checkpoint_id.clone(),
        checkpoint_path: ctx.checkpoint_path.clone(),
        run_index: ctx.run_index,
        shard_key: shard.key.clone(),
        images: shard.images.clone(),
        image_glob: shard.image_glob(&config.corpus_dir),
        image_list,
        output: staging.clone(),
        device: config.device.clone(),
    };

    let start = Instant::now();
    let outcome = match tokio::time::timeout(config.job_timeout, backend.run(&job)).await {
        Ok(res) => res,
        Err(_) => Err(RunnerError::Timeout {
            shard: shard.key.clone(),
            after: config.job_timeout,
        }),
    };
    if let Err(e) = outcome {
        let _ = artifact::remove_if_exists(&staging);
        return Err(e);
    }

    let results: Vec<CaptionResult> = match artifact::read_json(&staging) {
        Ok(r) => r,
        Err(source) => {
            let _ = artifact::remove_if_exists(&staging);
            return Err(RunnerError::MalformedOutput {
                shard: shard.key.clone(),
                source,
            });
        }
    };

    check_coverage(shard, &results);
    artifact::promote(&staging, output)?;

    debug!(
        shard = %shard.key,
        run = ctx.run_index,
        captions = results.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Shard output accepted"
    );
    Ok(results.len())
}

/// Warn about images the collaborator skipped or ids it invented
fn check_coverage(shard: &Shard, results: &[CaptionResult]) {
    let planned: HashSet<&str> = shard.images.iter().map(|i| i.image_id.as_str()).collect();
    let produced: HashSet<&str> = results.iter().map(|r| r.image_id.as_str()).collect();

    let missing = planned.difference(&produced).count();
    let unexpected = produced.difference(&planned).count();
    if missing > 0 || unexpected > 0 {
        warn!(
            shard = %shard.key,
            planned = planned.len(),
            produced = produced.len(),
            missing,
            unexpected,
            "Shard output does not match its image list"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{plan_shards, ImageRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Writes "caption of <id>" for every image, failing listed shards
    struct FakeBackend {
        calls: AtomicUsize,
        fail_shards: Vec<String>,
        garbage_shards: Vec<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        devices: Mutex<Vec<Option<String>>>,
        launches: Mutex<Vec<tokio::time::Instant>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_shards: vec![],
                garbage_shards: vec![],
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                devices: Mutex::new(vec![]),
                launches: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for FakeBackend {
        async fn run(&self, job: &ShardJob) -> RunnerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.devices.lock().unwrap().push(job.device.clone());
            self.launches.lock().unwrap().push(tokio::time::Instant::now());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_shards.contains(&job.shard_key) {
                return Err(RunnerError::CollaboratorFailed {
                    shard: job.shard_key.clone(),
                    code: Some(1),
                    stderr: "CUDA out of memory".into(),
                });
            }
            if self.garbage_shards.contains(&job.shard_key) {
                std::fs::write(&job.output, "[{\"image_id\": ").unwrap();
                return Ok(());
            }
            let results: Vec<CaptionResult> = job
                .images
                .iter()
                .map(|i| CaptionResult::new(&i.image_id, format!("caption of {}", i.image_id)))
                .collect();
            std::fs::write(&job.output, serde_json::to_vec(&results).unwrap()).unwrap();
            Ok(())
        }
    }

    fn plan() -> ShardPlan {
        let images = ["0a", "0b", "1a", "2a", "2b", "2c"]
            .iter()
            .map(|id| ImageRecord::new(*id, format!("/corpus/{}.jpg", id)))
            .collect();
        plan_shards(images, &["0".into(), "1".into(), "2".into(), "3".into()])
    }

    fn ctx(dir: &Path) -> RunContext {
        RunContext {
            checkpoint_id: "1000".into(),
            checkpoint_path: PathBuf::from("/models/model.ckpt-1000"),
            run_index: 0,
            run_dir: dir.join("run_0"),
        }
    }

    fn config(max_parallel: usize) -> RunnerConfig {
        RunnerConfig {
            corpus_dir: PathBuf::from("/corpus"),
            max_parallel,
            launch_delay: Duration::ZERO,
            job_timeout: Duration::from_secs(5),
            device: Some("0".into()),
        }
    }

    #[tokio::test]
    async fn test_run_writes_every_shard() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let runner = ShardJobRunner::new(backend.clone(), config(2));
        let ctx = ctx(dir.path());
        let plan = plan();

        let report = runner.run(&ctx, &plan).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.completed, vec!["0", "1", "2", "3"]);
        // Empty shard "3" never reaches the collaborator
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        for shard in &plan.shards {
            let out: Vec<CaptionResult> =
                artifact::read_json(&shard.output_path(&ctx.run_dir)).unwrap();
            assert_eq!(out.len(), shard.len());
            assert!(ShardStatus::load(&shard.status_path(&ctx.run_dir)).unwrap().is_done());
            assert!(!artifact::staging_path(&shard.output_path(&ctx.run_dir)).exists());
        }
        assert!(backend
            .devices
            .lock()
            .unwrap()
            .iter()
            .all(|d| d.as_deref() == Some("0")));
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let runner = ShardJobRunner::new(backend.clone(), config(4));
        let ctx = ctx(dir.path());
        let plan = plan();

        runner.run(&ctx, &plan).await.unwrap();
        let out_path = plan.shards[0].output_path(&ctx.run_dir);
        let before = std::fs::read(&out_path).unwrap();

        let report = runner.run(&ctx, &plan).await.unwrap();
        assert_eq!(report.launched(), 0);
        assert_eq!(report.skipped.len(), 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(&out_path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retried() {
        let dir = tempdir().unwrap();
        let ctx = ctx(dir.path());
        let plan = plan();

        let mut failing = FakeBackend::new();
        failing.fail_shards = vec!["1".into()];
        let runner = ShardJobRunner::new(Arc::new(failing), config(4));
        let report = runner.run(&ctx, &plan).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].shard, "1");
        assert!(report.failed[0].error.contains("CUDA out of memory"));
        assert_eq!(report.completed, vec!["0", "2", "3"]);

        let shard1 = plan.shard("1").unwrap();
        assert!(!shard1.output_path(&ctx.run_dir).exists());
        let status = ShardStatus::load(&shard1.status_path(&ctx.run_dir)).unwrap();
        assert_eq!(status.state, ShardState::Failed);

        // Next invocation relaunches only the failed shard
        let healthy = Arc::new(FakeBackend::new());
        let runner = ShardJobRunner::new(healthy.clone(), config(4));
        let report = runner.run(&ctx, &plan).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.completed, vec!["1"]);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        let status = ShardStatus::load(&shard1.status_path(&ctx.run_dir)).unwrap();
        assert_eq!(status.attempts, 2);
    }

    #[tokio::test]
    async fn test_malformed_output_leaves_no_file() {
        let dir = tempdir().unwrap();
        let ctx = ctx(dir.path());
        let plan = plan();

        let mut backend = FakeBackend::new();
        backend.garbage_shards = vec!["2".into()];
        let runner = ShardJobRunner::new(Arc::new(backend), config(4));
        let report = runner.run(&ctx, &plan).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        let shard2 = plan.shard("2").unwrap();
        assert!(!shard2.output_path(&ctx.run_dir).exists());
        assert!(!artifact::staging_path(&shard2.output_path(&ctx.run_dir)).exists());
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let runner = ShardJobRunner::new(backend.clone(), config(1));

        runner.run(&ctx(dir.path()), &plan()).await.unwrap();
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launches_are_spaced_by_delay() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let mut cfg = config(4);
        cfg.launch_delay = Duration::from_millis(250);
        let runner = ShardJobRunner::new(backend.clone(), cfg);

        let report = runner.run(&ctx(dir.path()), &plan()).await.unwrap();
        assert!(report.is_complete());

        let launches = backend.launches.lock().unwrap().clone();
        assert_eq!(launches.len(), 3);
        for pair in launches.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(250),
                "launches only {:?} apart",
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test]
    async fn test_panicked_shard_is_named() {
        struct PanicOn(&'static str);

        #[async_trait]
        impl InferenceBackend for PanicOn {
            async fn run(&self, job: &ShardJob) -> RunnerResult<()> {
                if job.shard_key == self.0 {
                    panic!("collaborator wrapper bug");
                }
                let results: Vec<CaptionResult> = job
                    .images
                    .iter()
                    .map(|i| CaptionResult::new(&i.image_id, "x"))
                    .collect();
                std::fs::write(&job.output, serde_json::to_vec(&results).unwrap()).unwrap();
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let runner = ShardJobRunner::new(Arc::new(PanicOn("2")), config(4));
        let report = runner.run(&ctx(dir.path()), &plan()).await.unwrap();

        assert_eq!(report.completed, vec!["0", "1", "3"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].shard, "2");
        assert!(report.failed[0].error.contains("panicked"));
    }

    #[tokio::test]
    async fn test_timeout_fails_shard() {
        struct Hang;

        #[async_trait]
        impl InferenceBackend for Hang {
            async fn run(&self, _job: &ShardJob) -> RunnerResult<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let mut cfg = config(4);
        cfg.job_timeout = Duration::from_millis(50);
        let runner = ShardJobRunner::new(Arc::new(Hang), cfg);
        let report = runner.run(&ctx(dir.path()), &plan()).await.unwrap();

        assert_eq!(report.failed.len(), 3);
        assert!(report.failed[0].error.contains("timed out"));
        assert_eq!(report.completed, vec!["3"]);
    }

    #[test]
    fn test_adopts_parseable_output_without_status() {
        let dir = tempdir().unwrap();
        let plan = plan();
        let shard = plan.shard("0").unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();

        artifact::write_json_atomic(
            &shard.output_path(dir.path()),
            &vec![CaptionResult::new("0a", "x"), CaptionResult::new("0b", "y")],
        )
        .unwrap();

        assert_eq!(resume_decision(shard, dir.path()), ResumeDecision::Skip);
        let status = ShardStatus::load(&shard.status_path(dir.path())).unwrap();
        assert!(status.is_done());
        assert_eq!(status.captions, 2);
    }

    #[test]
    fn test_discards_truncated_output_without_status() {
        let dir = tempdir().unwrap();
        let plan = plan();
        let shard = plan.shard("0").unwrap();
        let output = shard.output_path(dir.path());
        std::fs::write(&output, "[{\"image_id\": \"0a\", \"capt").unwrap();

        assert_eq!(resume_decision(shard, dir.path()), ResumeDecision::Launch);
        assert!(!output.exists());
    }
}
