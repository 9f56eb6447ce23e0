//! Subcommand handlers for the factorkd CLI.

use std::path::{Path, PathBuf};

use factorkd_core::config::workspace_config_path;
use factorkd_core::training::reproducibility::SeedManager;
use factorkd_core::training::schedule::{LearningRateSchedule, LrPolicy};
use factorkd_core::training::{Checkpoint, CheckpointStore, RunContext};
use factorkd_core::{SplitIndices, TrainConfig, TrainError};

use crate::{CheckpointAction, Commands, ConfigAction};

/// What every handler may need: the workspace and the resolved config.
pub struct CommandContext {
    pub workspace: PathBuf,
    pub config: Result<TrainConfig, TrainError>,
}

impl CommandContext {
    fn config(&self) -> anyhow::Result<&TrainConfig> {
        self.config
            .as_ref()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }
}

pub fn handle_command(command: Commands, ctx: &CommandContext) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, ctx),
        Commands::Schedule { epochs } => {
            let config = ctx.config()?;
            print!("{}", render_schedule(config, epochs)?);
            Ok(())
        }
        Commands::Split { len, write } => handle_split(ctx.config()?, len, write),
        Commands::Checkpoint { action } => handle_checkpoint(action, ctx.config()?),
    }
}

fn handle_config(action: ConfigAction, ctx: &CommandContext) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(&ctx.workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let toml_str = toml::to_string_pretty(&TrainConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(ctx.config()?)?;
            println!("{}", toml_str);
            Ok(())
        }
        ConfigAction::Validate => {
            let config = ctx.config()?;
            println!("Configuration is valid");
            println!("  dataset:     {}", config.dataset);
            println!("  pipeline:    {}", config.pipeline);
            println!("  run dir:     {}", config.run_dir().display());
            println!("  fingerprint: {}", config.fingerprint()?);
            Ok(())
        }
    }
}

/// The joint-stage LR table, with runs of equal rates collapsed into one
/// `first-last` line.
pub fn render_schedule(config: &TrainConfig, limit: Option<usize>) -> anyhow::Result<String> {
    let policy = LrPolicy::from_config(config)?;
    let last = limit
        .unwrap_or(config.total_epochs)
        .min(policy.last_epoch());

    let mut out = format!(
        "Schedule: {:?} over {} epochs (initial lr {})\n",
        config.schedule.kind, config.total_epochs, config.initial_lr
    );
    let table = policy.table(last);
    let mut i = 0;
    while i < table.len() {
        let (first, lr) = table[i];
        let mut j = i;
        while j + 1 < table.len() && table[j + 1].1 == lr {
            j += 1;
        }
        let range = if j == i {
            format!("{first}")
        } else {
            format!("{first}-{}", table[j].0)
        };
        out.push_str(&format!("  {range:>9}  {lr:.6e}\n"));
        i = j + 1;
    }
    Ok(out)
}

fn handle_split(config: &TrainConfig, len: Option<usize>, write: bool) -> anyhow::Result<()> {
    let len = len.unwrap_or(config.profile().train_samples);
    let split = if write {
        let mut run = RunContext::prepare(config)?;
        let split = run.split(len)?;
        tracing::info!(run_dir = %run.run_dir().display(), "Wrote split indices");
        split
    } else {
        let seed = SeedManager::new(config.random_seed).get_seed("split");
        SplitIndices::new(len, config.data.split_fraction, seed)?
    };
    print!("{}", render_split(&split));
    Ok(())
}

pub fn render_split(split: &SplitIndices) -> String {
    let preview: Vec<String> = split
        .validation()
        .iter()
        .take(8)
        .map(usize::to_string)
        .collect();
    let more = if split.validation().len() > preview.len() {
        ", ..."
    } else {
        ""
    };
    format!(
        "Split of {} samples (seed {}):\n  train:      {}\n  validation: {} [{}{}]\n",
        split.len(),
        split.seed(),
        split.train().len(),
        split.validation().len(),
        preview.join(", "),
        more
    )
}

fn handle_checkpoint(action: CheckpointAction, config: &TrainConfig) -> anyhow::Result<()> {
    let store = CheckpointStore::new(config.run_dir(), &config.checkpoint);
    let (path, json) = match action {
        CheckpointAction::Show { path, json } => {
            (path.unwrap_or_else(|| store.latest_path()), json)
        }
        CheckpointAction::Best { json } => (store.best_path(), json),
    };
    let checkpoint = Checkpoint::read(&path)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&checkpoint_summary(&path, &checkpoint))?
        );
    } else {
        print!("{}", render_checkpoint(&path, &checkpoint));
    }
    Ok(())
}

fn checkpoint_summary(path: &Path, checkpoint: &Checkpoint) -> serde_json::Value {
    let modules: serde_json::Map<String, serde_json::Value> = checkpoint
        .module_states
        .iter()
        .map(|(role, state)| (role.to_string(), serde_json::json!(state.len())))
        .collect();
    serde_json::json!({
        "path": path.display().to_string(),
        "epoch": checkpoint.epoch,
        "prec@1": checkpoint.top1,
        "prec@5": checkpoint.top5,
        "module_bytes": modules,
    })
}

pub fn render_checkpoint(path: &Path, checkpoint: &Checkpoint) -> String {
    let mut out = format!(
        "Checkpoint {}\n  epoch:  {}\n  prec@1: {:.3}\n  prec@5: {:.3}\n  modules:\n",
        path.display(), checkpoint.epoch, checkpoint.top1, checkpoint.top5
    );
    for (role, state) in &checkpoint.module_states {
        out.push_str(&format!(
            "    {:<12} {} bytes\n",
            role.as_str(),
            state.len()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use factorkd_core::training::ModuleState;
    use factorkd_core::{Role, ScheduleKind};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> CommandContext {
        let config = TrainConfig {
            save_root: dir.path().join("results"),
            ..TrainConfig::default()
        };
        CommandContext {
            workspace: dir.path().to_path_buf(),
            config: Ok(config),
        }
    }

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        handle_command(
            Commands::Config {
                action: ConfigAction::Init,
            },
            &ctx,
        )
        .unwrap();

        let content = std::fs::read_to_string(workspace_config_path(dir.path())).unwrap();
        let parsed: TrainConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed, TrainConfig::default());
    }

    #[test]
    fn test_render_step_schedule() {
        let rendered = render_schedule(&TrainConfig::default(), None).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].trim_start().starts_with("1-100"));
        assert!(lines[2].trim_start().starts_with("101-150"));
        assert!(lines[3].trim_start().starts_with("151-200"));
    }

    #[test]
    fn test_render_cosine_schedule_limit() {
        let mut config = TrainConfig::default();
        config.schedule.kind = ScheduleKind::Cosine;
        let rendered = render_schedule(&config, Some(5)).unwrap();
        // Header plus one line per distinct epoch rate.
        assert_eq!(rendered.lines().count(), 6);
    }

    #[test]
    fn test_split_write() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        handle_command(
            Commands::Split {
                len: Some(500),
                write: true,
            },
            &ctx,
        )
        .unwrap();
        let run_dir = dir.path().join("results").join("try");
        assert!(run_dir.join("split.json").exists());
        assert!(run_dir.join("config.json").exists());
    }

    #[test]
    fn test_render_split() {
        let split = SplitIndices::new(20, 0.1, 7).unwrap();
        let rendered = render_split(&split);
        assert!(rendered.contains("train:      18"));
        assert!(rendered.contains("validation: 2 ["));
        assert!(!rendered.contains("..."));
    }

    #[test]
    fn test_checkpoint_show() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let config = ctx.config().unwrap();
        let store = CheckpointStore::new(config.run_dir(), &config.checkpoint);
        let checkpoint = Checkpoint {
            epoch: 12,
            module_states: BTreeMap::from([
                (Role::Student, ModuleState::new(vec![0; 32])),
                (Role::Translator, ModuleState::new(vec![1; 8])),
            ]),
            top1: 71.25,
            top5: 92.5,
        };
        store.save(&checkpoint).unwrap();

        let rendered = render_checkpoint(&store.latest_path(), &checkpoint);
        assert!(rendered.contains("epoch:  12"));
        assert!(rendered.contains("prec@1: 71.250"));
        assert!(rendered.contains("student      32 bytes"));

        let summary = checkpoint_summary(&store.latest_path(), &checkpoint);
        assert_eq!(summary["module_bytes"]["translator"], 8);

        handle_command(
            Commands::Checkpoint {
                action: CheckpointAction::Show {
                    path: None,
                    json: true,
                },
            },
            &ctx,
        )
        .unwrap();
        assert!(
            handle_command(
                Commands::Checkpoint {
                    action: CheckpointAction::Best { json: false },
                },
                &ctx,
            )
            .is_err()
        );
    }

    #[test]
    fn test_broken_config_only_fails_dependent_commands() {
        let dir = TempDir::new().unwrap();
        let ctx = CommandContext {
            workspace: dir.path().to_path_buf(),
            config: Err(TrainError::config("bad")),
        };
        let schedule = handle_command(Commands::Schedule { epochs: None }, &ctx);
        assert!(schedule.is_err());
        handle_command(
            Commands::Config {
                action: ConfigAction::Init,
            },
            &ctx,
        )
        .unwrap();
    }
}
