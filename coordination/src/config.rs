//! Sweep configuration
//!
//! Loaded from an optional TOML file, then overridden by `CAPTION_SWEEP_*`
//! environment variables. Every field has a default so a bare
//! `caption-sweep plan` works against `./images`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ensemble::VotingStrategy;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "CAPTION_SWEEP_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    BadEnv { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Decoding options passed through to the inference collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Stochastic ("fuzzy") decoding; required for runs to differ
    pub fuzzy: bool,
    pub batch_size: usize,
    /// Extra flags appended verbatim (attention variants etc.)
    pub extra_args: Vec<String>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            fuzzy: false,
            batch_size: 100,
            extra_args: Vec::new(),
        }
    }
}

/// Voting policy for the ensemble reducer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    pub strategy: VotingStrategy,
    /// Highest n-gram order used by token-overlap similarity
    pub max_ngram: usize,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            strategy: VotingStrategy::TokenOverlap,
            max_ngram: 2,
        }
    }
}

/// Top-level sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Directory holding the image corpus (flat)
    pub corpus_dir: PathBuf,
    /// Lower-case extensions counted as images; empty means every file
    pub image_extensions: Vec<String>,
    /// Ordered shard keys; an image belongs to the key its file name starts with
    pub shard_keys: Vec<String>,
    /// Root under which one directory per checkpoint is created
    pub output_root: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// File prefix of checkpoints, e.g. `model.ckpt-` + `1000000`
    pub checkpoint_prefix: String,
    /// Checkpoint ids (training steps), swept in order
    pub checkpoints: Vec<String>,
    pub vocab_file: PathBuf,
    pub references_file: PathBuf,
    /// Model-variant selector passed to the collaborator
    pub model_variant: String,
    /// Independent inference runs per checkpoint
    pub run_count: usize,
    /// Concurrent shard jobs
    pub max_parallel: usize,
    /// Delay between consecutive job launches
    pub launch_delay_ms: u64,
    pub job_timeout_secs: u64,
    /// Device pinned for child processes (`CUDA_VISIBLE_DEVICES`)
    pub device: Option<String>,
    pub decode: DecodeConfig,
    pub voting: VotingConfig,
    /// Inference command template
    pub inference_command: String,
    /// Evaluation command template
    pub eval_command: String,
    pub eval_timeout_secs: u64,
    /// Regex selecting summary lines in the scorer output
    pub summary_marker: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("images"),
            image_extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            shard_keys: "0123456789abcdef".chars().map(String::from).collect(),
            output_root: PathBuf::from("sweep-output"),
            checkpoint_dir: PathBuf::from("model/train"),
            checkpoint_prefix: "model.ckpt-".into(),
            checkpoints: Vec::new(),
            vocab_file: PathBuf::from("data/word_counts.txt"),
            references_file: PathBuf::from("data/captions_val.json"),
            model_variant: "show_and_tell".into(),
            run_count: 1,
            max_parallel: 4,
            launch_delay_ms: 0,
            job_timeout_secs: 3600,
            device: None,
            decode: DecodeConfig::default(),
            voting: VotingConfig::default(),
            inference_command: "python run_inference.py --input_files={images} \
                                --checkpoint_path={checkpoint} --vocab_file={vocab} \
                                --output={output} --model={model} \
                                --batch_size={batch_size} --fuzzy={fuzzy}"
                .into(),
            eval_command: "python eval.py --submission={submission} --references={references}"
                .into(),
            eval_timeout_secs: 1800,
            summary_marker: "^Eval".into(),
        }
    }
}

impl SweepConfig {
    /// Load from an optional TOML file and apply environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `CAPTION_SWEEP_*` overrides
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Some(v) = env_var("OUTPUT_ROOT") {
            self.output_root = PathBuf::from(v);
        }
        if let Some(v) = env_var("CORPUS_DIR") {
            self.corpus_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("MAX_PARALLEL")? {
            self.max_parallel = v;
        }
        if let Some(v) = env_parse("LAUNCH_DELAY_MS")? {
            self.launch_delay_ms = v;
        }
        if let Some(v) = env_parse("JOB_TIMEOUT_SECS")? {
            self.job_timeout_secs = v;
        }
        if let Some(v) = env_parse("RUN_COUNT")? {
            self.run_count = v;
        }
        // "none" clears a device pinned in the file
        if let Some(v) = env_var("DEVICE") {
            self.device = Some(v).filter(|d| d != "none");
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.shard_keys.is_empty() {
            return Err(ConfigError::Invalid("shard_keys is empty".into()));
        }
        let mut seen = HashSet::new();
        for key in &self.shard_keys {
            if key.is_empty() {
                return Err(ConfigError::Invalid("empty shard key".into()));
            }
            if !seen.insert(key.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate shard key '{}'", key)));
            }
        }
        // A key that prefixes another would put one image in two shards
        for a in &self.shard_keys {
            for b in &self.shard_keys {
                if a != b && b.starts_with(a.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "shard key '{}' is a prefix of '{}'",
                        a, b
                    )));
                }
            }
        }
        if self.run_count == 0 {
            return Err(ConfigError::Invalid("run_count must be at least 1".into()));
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".into()));
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid("job_timeout_secs must be at least 1".into()));
        }
        if self.eval_timeout_secs == 0 {
            return Err(ConfigError::Invalid("eval_timeout_secs must be at least 1".into()));
        }
        if self.voting.max_ngram == 0 {
            return Err(ConfigError::Invalid("voting.max_ngram must be at least 1".into()));
        }
        if self.inference_command.trim().is_empty() {
            return Err(ConfigError::Invalid("inference_command is empty".into()));
        }
        if self.eval_command.trim().is_empty() {
            return Err(ConfigError::Invalid("eval_command is empty".into()));
        }
        regex::Regex::new(&self.summary_marker)
            .map_err(|e| ConfigError::Invalid(format!("summary_marker: {}", e)))?;
        Ok(())
    }

    /// Validation for a full sweep, which additionally needs checkpoints
    pub fn validate_for_sweep(&self) -> ConfigResult<()> {
        self.validate()?;
        if self.checkpoints.is_empty() {
            return Err(ConfigError::Invalid("no checkpoints to sweep".into()));
        }
        Ok(())
    }

    /// Path of a checkpoint file on disk
    pub fn checkpoint_path(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}{}", self.checkpoint_prefix, checkpoint_id))
    }

    /// Output directory owned by one checkpoint
    pub fn checkpoint_output_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.output_root.join(checkpoint_id)
    }

    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> ConfigResult<Option<T>> {
    match env_var(name) {
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::BadEnv {
            var: format!("{}{}", ENV_PREFIX, name),
            value,
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SweepConfig::default();
        config.validate().unwrap();
        assert_eq!(config.shard_keys.len(), 16);
        assert_eq!(config.shard_keys[10], "a");
    }

    #[test]
    fn test_sweep_needs_checkpoints() {
        let config = SweepConfig::default();
        assert!(matches!(
            config.validate_for_sweep(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = SweepConfig::from_toml_str(
            r#"
            corpus_dir = "/data/val2014"
            checkpoints = ["1000000", "2000000"]
            run_count = 3
            device = "1"

            [decode]
            fuzzy = true

            [voting]
            strategy = "majority"
            "#,
        )
        .unwrap();

        assert_eq!(config.corpus_dir, PathBuf::from("/data/val2014"));
        assert_eq!(config.checkpoints, vec!["1000000", "2000000"]);
        assert_eq!(config.run_count, 3);
        assert_eq!(config.device.as_deref(), Some("1"));
        assert!(config.decode.fuzzy);
        assert_eq!(config.decode.batch_size, 100);
        assert_eq!(config.voting.strategy, VotingStrategy::Majority);
        assert_eq!(config.voting.max_ngram, 2);
        config.validate_for_sweep().unwrap();
    }

    #[test]
    fn test_rejects_prefix_overlap() {
        let config = SweepConfig {
            shard_keys: vec!["a".into(), "ab".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_keys_and_zero_runs() {
        let dup = SweepConfig {
            shard_keys: vec!["a".into(), "a".into()],
            ..Default::default()
        };
        assert!(dup.validate().is_err());

        let zero = SweepConfig {
            run_count: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let job = SweepConfig {
            job_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(job.validate(), Err(ConfigError::Invalid(ref m)) if m.contains("job_timeout_secs")));

        let eval = SweepConfig {
            eval_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(eval.validate(), Err(ConfigError::Invalid(ref m)) if m.contains("eval_timeout_secs")));
    }

    /// Env is process-global; tests touching it hold this lock
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const ENV_VARS: [&str; 4] = [
        "CAPTION_SWEEP_OUTPUT_ROOT",
        "CAPTION_SWEEP_MAX_PARALLEL",
        "CAPTION_SWEEP_RUN_COUNT",
        "CAPTION_SWEEP_DEVICE",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let mut config = SweepConfig::from_toml_str(
            r#"
            output_root = "/from/file"
            max_parallel = 2
            device = "1"
            "#,
        )
        .unwrap();
        std::env::set_var("CAPTION_SWEEP_OUTPUT_ROOT", "/from/env");
        std::env::set_var("CAPTION_SWEEP_MAX_PARALLEL", "8");
        std::env::set_var("CAPTION_SWEEP_RUN_COUNT", "5");
        std::env::set_var("CAPTION_SWEEP_DEVICE", "none");
        let result = config.apply_env();
        clear_env();

        result.unwrap();
        assert_eq!(config.output_root, PathBuf::from("/from/env"));
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.run_count, 5);
        assert_eq!(config.device, None);
    }

    #[test]
    fn test_env_bad_number() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("CAPTION_SWEEP_MAX_PARALLEL", "abc");
        let result = SweepConfig::load(None);
        clear_env();

        match result {
            Err(ConfigError::BadEnv { var, value }) => {
                assert_eq!(var, "CAPTION_SWEEP_MAX_PARALLEL");
                assert_eq!(value, "abc");
            }
            other => panic!("expected BadEnv, got {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_paths() {
        let config = SweepConfig {
            checkpoint_dir: PathBuf::from("/models/train"),
            output_root: PathBuf::from("/out"),
            ..Default::default()
        };
        assert_eq!(
            config.checkpoint_path("1000000"),
            PathBuf::from("/models/train/model.ckpt-1000000")
        );
        assert_eq!(
            config.checkpoint_output_dir("1000000"),
            PathBuf::from("/out/1000000")
        );
    }
}
