//! factorkd CLI: inspect the configuration, learning-rate schedule, data
//! split and checkpoints of factor-transfer distillation runs.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use factorkd_core::{ConfigOverrides, Dataset, Pipeline, ScheduleKind};

/// factorkd: staged factor-transfer distillation runs
#[derive(Parser, Debug)]
#[command(name = "factorkd", version, about, long_about = None)]
pub struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (replaces the workspace config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset: CIFAR10 or CIFAR100
    #[arg(long)]
    dataset: Option<Dataset>,

    /// Run name; outputs go to <save_root>/<note>
    #[arg(long)]
    note: Option<String>,

    /// Root directory for run outputs
    #[arg(long)]
    save_root: Option<PathBuf>,

    /// Number of joint-stage epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Training sequence: distillation or baseline
    #[arg(long)]
    pipeline: Option<Pipeline>,

    /// Learning-rate schedule: cosine or step
    #[arg(long)]
    schedule: Option<ScheduleKind>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            total_epochs: self.epochs,
            random_seed: self.seed,
            dataset: self.dataset,
            pipeline: self.pipeline,
            save_root: self.save_root.clone(),
            note: self.note.clone(),
            schedule: self.schedule,
            ..Default::default()
        }
    }
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the joint-stage learning-rate table
    Schedule {
        /// Only show the first N epochs
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Report the seeded train/validation split
    Split {
        /// Training-set size (defaults to the dataset's)
        #[arg(long)]
        len: Option<usize>,
        /// Write split.json, config.json and environment.json to the run directory
        #[arg(long)]
        write: bool,
    },
    /// Inspect checkpoints of the configured run
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default .factorkd/config.toml in the workspace
    Init,
    /// Show the resolved configuration
    Show,
    /// Validate the resolved configuration and print its fingerprint
    Validate,
}

#[derive(clap::Subcommand, Debug)]
pub enum CheckpointAction {
    /// Summarize a checkpoint (defaults to the run's latest)
    Show {
        path: Option<PathBuf>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Summarize the run's best checkpoint
    Best {
        #[arg(long)]
        json: bool,
    },
}

fn default_log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "factorkd", "factorkd")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Human-readable stderr plus JSON lines in `log_dir/log.jsonl`.
fn init_tracing(
    verbose: u8,
    quiet: bool,
    log_dir: &Path,
) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let _ = std::fs::create_dir_all(log_dir);
    let file_appender =
        tracing_appender::rolling::never(log_dir, factorkd_core::training::run::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    // A broken config only fails the commands that need it.
    let config = factorkd_core::load_config(
        Some(&workspace),
        cli.config.as_deref(),
        Some(&cli.overrides()),
    );

    let log_dir = match &config {
        Ok(c) if c.run_dir().is_dir() => c.run_dir(),
        _ => default_log_dir(),
    };
    let _guard = init_tracing(cli.verbose, cli.quiet, &log_dir);

    let ctx = commands::CommandContext { workspace, config };
    commands::handle_command(cli.command, &ctx)
}
