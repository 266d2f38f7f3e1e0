//! Inference collaborator seam
//!
//! The model itself is an external program. `CommandBackend` renders the
//! configured command template for one shard and runs it as a child process;
//! tests substitute their own `InferenceBackend`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

use super::{RunnerError, RunnerResult};
use crate::config::{DecodeConfig, SweepConfig};
use crate::corpus::ImageRecord;

/// Everything the collaborator needs to caption one shard
#[derive(Debug, Clone)]
pub struct ShardJob {
    pub checkpoint_id: String,
    pub checkpoint_path: PathBuf,
    pub run_index: usize,
    pub shard_key: String,
    pub images: Vec<ImageRecord>,
    /// File-name glob covering the shard
    pub image_glob: String,
    /// File listing the shard's images, one per line
    pub image_list: PathBuf,
    /// Where the collaborator must write its JSON (a staging path)
    pub output: PathBuf,
    /// Device pinned for this job only
    pub device: Option<String>,
}

/// External model-inference process
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Caption every image in `job` and write the records to `job.output`.
    ///
    /// Returning `Ok` means the collaborator exited cleanly; the runner still
    /// validates the output before accepting it.
    async fn run(&self, job: &ShardJob) -> RunnerResult<()>;
}

/// Runs the inference collaborator from a shell-word command template
#[derive(Debug, Clone)]
pub struct CommandBackend {
    template: Vec<String>,
    vocab_file: PathBuf,
    model_variant: String,
    decode: DecodeConfig,
}

/// Bytes of stderr kept in failure messages
const STDERR_TAIL_BYTES: usize = 2048;

impl CommandBackend {
    pub fn new(
        template: &str,
        vocab_file: PathBuf,
        model_variant: String,
        decode: DecodeConfig,
    ) -> RunnerResult<Self> {
        let template = split_template(template)?;
        Ok(Self {
            template,
            vocab_file,
            model_variant,
            decode,
        })
    }

    pub fn from_config(config: &SweepConfig) -> RunnerResult<Self> {
        Self::new(
            &config.inference_command,
            config.vocab_file.clone(),
            config.model_variant.clone(),
            config.decode.clone(),
        )
    }

    /// Program and arguments for one job
    pub fn render(&self, job: &ShardJob) -> Vec<String> {
        let vocab = self.vocab_file.display().to_string();
        let checkpoint = job.checkpoint_path.display().to_string();
        let output = job.output.display().to_string();
        let image_list = job.image_list.display().to_string();
        let batch_size = self.decode.batch_size.to_string();
        let fuzzy = self.decode.fuzzy.to_string();

        let substitutions: [(&str, &str); 8] = [
            ("{images}", job.image_glob.as_str()),
            ("{image_list}", image_list.as_str()),
            ("{checkpoint}", checkpoint.as_str()),
            ("{vocab}", vocab.as_str()),
            ("{output}", output.as_str()),
            ("{model}", self.model_variant.as_str()),
            ("{batch_size}", batch_size.as_str()),
            ("{fuzzy}", fuzzy.as_str()),
        ];

        let mut argv: Vec<String> = self
            .template
            .iter()
            .map(|word| render_word(word, &substitutions))
            .collect();
        argv.extend(self.decode.extra_args.iter().cloned());
        argv
    }
}

#[async_trait]
impl InferenceBackend for CommandBackend {
    async fn run(&self, job: &ShardJob) -> RunnerResult<()> {
        let argv = self.render(job);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RunnerError::InvalidTemplate("empty command".into()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Device selection is scoped to the child, never the orchestrator
        if let Some(ref device) = job.device {
            cmd.env("CUDA_VISIBLE_DEVICES", device);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(shard = %job.shard_key, run = job.run_index, program = %program, "Spawning inference");

        let output = cmd.output().await.map_err(|e| RunnerError::Spawn {
            shard: job.shard_key.clone(),
            source: e,
        })?;

        if !output.status.success() {
            return Err(RunnerError::CollaboratorFailed {
                shard: job.shard_key.clone(),
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }
}

/// Split a template into words without invoking a shell
pub fn split_template(template: &str) -> RunnerResult<Vec<String>> {
    let words = shlex::split(template)
        .ok_or_else(|| RunnerError::InvalidTemplate(format!("unbalanced quotes: {}", template)))?;
    if words.is_empty() {
        return Err(RunnerError::InvalidTemplate("empty command".into()));
    }
    Ok(words)
}

/// Replace every placeholder inside one argument
pub fn render_word(word: &str, substitutions: &[(&str, &str)]) -> String {
    substitutions
        .iter()
        .fold(word.to_string(), |acc, &(placeholder, value)| {
            acc.replace(placeholder, value)
        })
}

pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
