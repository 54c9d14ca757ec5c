//! udasbs CLI
//!
//! Runs the warm-up and adaptation phases on synthetic domains, or writes a
//! configuration file to start from.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use udasbs::backend::{backend_name, default_device, TrainingBackend};
use udasbs::model::ExperimentConfig;
use udasbs::training::{load_pretrained, run_adaptation, run_pretraining};
use udasbs::utils::logging::{init_logging, LogConfig};
use udasbs::utils::meters::EpochSummary;

/// Multi-granularity teacher/student domain adaptation
#[derive(Parser, Debug)]
#[command(name = "udasbs")]
#[command(version = "0.1.0")]
#[command(about = "Teacher/student domain adaptation with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// JSON experiment configuration (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for checkpoints
    #[arg(short, long, global = true, default_value = "output")]
    output_dir: PathBuf,

    /// Override every seed in the configuration
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Override the epoch count of both phases
    #[arg(short, long, global = true)]
    epochs: Option<usize>,

    /// Use the small smoke-run configuration instead of the defaults
    #[arg(long, global = true, default_value = "false")]
    quick: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervised warm-up on the source domain
    Pretrain,

    /// Teacher/student adaptation on the target domain
    Adapt {
        /// Warm-up checkpoint to start from (path without extension)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Warm-up followed by adaptation
    Run,

    /// Write the effective configuration as JSON
    InitConfig {
        /// Destination file
        #[arg(default_value = "udasbs.json")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    let config = load_config(&cli)?;
    let device = default_device();
    info!("Backend: {}", backend_name());

    match cli.command {
        Commands::Pretrain => {
            print_banner("Warm-up");
            let outcome = run_pretraining::<TrainingBackend>(
                &config,
                Some(cli.output_dir.as_path()),
                &device,
            )?;
            print_summaries("Warm-up", &outcome.summaries);
        }
        Commands::Adapt { checkpoint } => {
            print_banner("Adaptation");
            let warm_start = match checkpoint {
                Some(path) => Some(load_pretrained::<TrainingBackend>(&config, &path, &device)?),
                None => {
                    println!("  {}", "No checkpoint given, starting from scratch".yellow());
                    None
                }
            };
            let outcome = run_adaptation::<TrainingBackend>(
                &config,
                warm_start,
                Some(cli.output_dir.as_path()),
                &device,
            )?;
            print_summaries("Adaptation", &outcome.summaries);
        }
        Commands::Run => {
            print_banner("Warm-up + Adaptation");
            let warm = run_pretraining::<TrainingBackend>(
                &config,
                Some(cli.output_dir.as_path()),
                &device,
            )?;
            print_summaries("Warm-up", &warm.summaries);

            let adapted = run_adaptation::<TrainingBackend>(
                &config,
                Some(warm.model),
                Some(cli.output_dir.as_path()),
                &device,
            )?;
            print_summaries("Adaptation", &adapted.summaries);
        }
        Commands::InitConfig { path } => {
            write_config(&config, &path)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<ExperimentConfig> {
    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)?,
        None if cli.quick => ExperimentConfig::quick(),
        None => ExperimentConfig::default(),
    };

    if let Some(seed) = cli.seed {
        config.source.seed = seed;
        config.target.seed = seed.wrapping_add(1);
        config.pretrain.seed = seed;
        config.adaptation.seed = seed;
    }
    if let Some(epochs) = cli.epochs {
        config.pretrain.epochs = epochs;
        config.adaptation.epochs = epochs;
    }

    config.validate()?;
    Ok(config)
}

fn write_config(config: &ExperimentConfig, path: &Path) -> Result<()> {
    config.save(path)?;
    println!("{} {:?}", "Configuration written to".green(), path);
    Ok(())
}

fn print_banner(title: &str) {
    println!();
    println!("{}", format!("udasbs: {}", title).cyan().bold());
    println!("  Backend: {}", backend_name());
    println!();
}

fn print_summaries(phase: &str, summaries: &[EpochSummary]) {
    println!();
    println!("{}", format!("{} Summary:", phase).green().bold());
    for s in summaries {
        println!(
            "  Epoch {:>3} | Loss_ce {:.3} | Loss_tri {:.3} | Prec {:.2}%",
            s.epoch,
            s.loss_ce,
            s.loss_tri,
            s.precision * 100.0
        );
    }
    println!();
}
