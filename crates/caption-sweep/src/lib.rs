//! Command-line front end for the caption sweep pipeline
//!
//! Each pipeline stage is exposed as its own subcommand, plus `sweep` for the
//! full checkpoint loop. All stages share the same config resolution:
//! defaults, then the TOML file, then `CAPTION_SWEEP_*` variables, then flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use coordination::aggregate;
use coordination::artifact;
use coordination::{EnsembleReducer, SweepConfig, SweepController, VotingProtocol, VotingStrategy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output root (overrides config and CAPTION_SWEEP_OUTPUT_ROOT)
    #[arg(long, global = true)]
    pub output_root: Option<PathBuf>,

    /// Image corpus directory (overrides config and CAPTION_SWEEP_CORPUS_DIR)
    #[arg(long, global = true)]
    pub corpus_dir: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print shard sizes for the corpus
    Plan,

    /// Run every shard of one run for one checkpoint
    Infer {
        #[arg(long)]
        checkpoint: String,
        #[arg(long, default_value_t = 0)]
        run: usize,
    },

    /// Merge one run's shard outputs into captions_run<N>.json
    Aggregate {
        #[arg(long)]
        checkpoint: String,
        #[arg(long, default_value_t = 0)]
        run: usize,
    },

    /// Reduce per-run caption files into one submission
    Vote {
        /// Per-run caption files, in run order
        #[arg(long = "input", required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
        #[arg(long)]
        max_ngram: Option<usize>,
        /// Order by, and require coverage of, the configured corpus
        #[arg(long, default_value_t = false)]
        corpus: bool,
    },

    /// Score one submission with the configured scorer
    Evaluate {
        #[arg(long)]
        submission: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Sweep every configured checkpoint
    Sweep {
        /// Checkpoints to sweep instead of the configured list
        #[arg(long = "checkpoint")]
        checkpoints: Vec<String>,
        /// Runs per checkpoint (overrides config)
        #[arg(long)]
        runs: Option<usize>,
    },
}

/// Voting strategy as spelled on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Exact-string vote count
    Majority,
    /// Mean n-gram F1 against the other runs
    TokenOverlap,
}

impl From<StrategyArg> for VotingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Majority => VotingStrategy::Majority,
            StrategyArg::TokenOverlap => VotingStrategy::TokenOverlap,
        }
    }
}

/// Resolve the effective configuration for `args`
pub fn load_config(args: &Args) -> Result<SweepConfig> {
    let mut config = SweepConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(ref root) = args.output_root {
        config.output_root = root.clone();
    }
    if let Some(ref dir) = args.corpus_dir {
        config.corpus_dir = dir.clone();
    }
    if let Command::Sweep { checkpoints, runs } = &args.command {
        if !checkpoints.is_empty() {
            config.checkpoints = checkpoints.clone();
        }
        if let Some(runs) = runs {
            config.run_count = *runs;
        }
    }
    Ok(config)
}

/// Execute a parsed command line. `Ok(false)` means the command ran but
/// reported failures.
pub async fn run(args: Args) -> Result<bool> {
    let config = load_config(&args)?;
    let controller = SweepController::from_config(config).context("invalid configuration")?;

    match args.command {
        Command::Plan => {
            let plan = controller.plan()?;
            for shard in &plan.shards {
                println!("{:>8}  {}", shard.key, shard.len());
            }
            println!("{:>8}  {}", "total", plan.total_images());
            if !plan.unassigned.is_empty() {
                println!("{:>8}  {}", "skipped", plan.unassigned.len());
            }
            Ok(true)
        }

        Command::Infer { checkpoint, run } => {
            let plan = controller.plan()?;
            let report = controller.infer(&checkpoint, run, &plan).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.is_complete())
        }

        Command::Aggregate { checkpoint, run } => {
            let plan = controller.plan()?;
            let report = controller
                .aggregate(&checkpoint, run, &plan)
                .with_context(|| format!("aggregating run {} of checkpoint {}", run, checkpoint))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }

        Command::Vote {
            inputs,
            output,
            strategy,
            max_ngram,
            corpus,
        } => {
            let voting = &controller.config().voting;
            let reducer = EnsembleReducer::new(VotingProtocol::new(
                strategy.map(Into::into).unwrap_or(voting.strategy),
                max_ngram.unwrap_or(voting.max_ngram),
            ));
            vote_files(&controller, &reducer, &inputs, &output, corpus)
        }

        Command::Evaluate { submission, output } => {
            let report = controller.evaluator().evaluate(&submission, &output).await?;
            for line in &report.summary_lines {
                println!("{}", line);
            }
            Ok(true)
        }

        Command::Sweep { .. } => {
            let report = controller.run_sweep().await?;
            for c in &report.checkpoints {
                let detail = match &c.error {
                    Some(e) => e.clone(),
                    None => c.summary_lines.join(" | "),
                };
                println!("{:>12}  {:<8}  {}", c.checkpoint, c.status.to_string(), detail);
            }
            Ok(!report.any_failed())
        }
    }
}

fn vote_files(
    controller: &SweepController,
    reducer: &EnsembleReducer,
    inputs: &[PathBuf],
    output: &Path,
    corpus: bool,
) -> Result<bool> {
    let runs = inputs
        .iter()
        .enumerate()
        .map(|(i, path)| {
            aggregate::load_run(i, path).with_context(|| format!("reading {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let expected = if corpus {
        Some(controller.plan()?.image_ids())
    } else {
        None
    };

    let report = reducer.reduce(&runs, expected.as_deref())?;
    artifact::write_json_atomic(output, &report.submission)?;
    info!(
        output = %output.display(),
        images = report.submission.len(),
        partial = report.partial.len(),
        duplicates = report.duplicates.len(),
        "Submission written"
    );
    Ok(true)
}
