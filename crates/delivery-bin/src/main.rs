//! Delivery tracker binary entry point.
//!
//! Usage:
//!   delivery-tracker simulate [--events N] [--failure-rate F] [--ack-rate A]
//!   delivery-tracker config
//!   delivery-tracker init-config [--force]

mod simulate;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use delivery_config_and_utils::{init_logging, Config, Paths};
use std::path::PathBuf;
use tracing::info;

/// Delivery confirmation tracking for outbound notifications.
#[derive(Parser, Debug)]
#[command(name = "delivery-tracker")]
#[command(about = "Track outbound notification delivery with bounded retries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config and logs. Defaults to ~/.delivery-tracker
    #[arg(long, env = "DELIVERY_BASE_DIR", global = true)]
    base_dir: Option<PathBuf>,

    /// Also write JSONL logs to <base-dir>/logs/delivery-tracker.jsonl
    #[arg(long, global = true)]
    log_file: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Emit simulated events through a flaky notifier and report delivery metrics
    Simulate(simulate::SimulateArgs),
    /// Print the effective configuration
    Config,
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };

    match cli.command {
        Commands::InitConfig { force } => init_config(&paths, force),
        Commands::Config => {
            let config = load_config(&paths, cli.log_level)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Simulate(args) => {
            let config = load_config(&paths, cli.log_level)?;
            let log_file = if cli.log_file {
                paths.ensure_dirs()?;
                Some(paths.log_file())
            } else {
                None
            };
            init_logging(&config.log_level, log_file)?;

            let summary = simulate::run(config.tracker, args).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn load_config(paths: &Paths, log_level: Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::load(paths).context("failed to load configuration")?;
    if let Some(level) = log_level {
        config.log_level = level;
    }
    Ok(config)
}

fn init_config(paths: &Paths, force: bool) -> anyhow::Result<()> {
    let config_path = paths.config_file();
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    Config::default().save(paths)?;
    info!(path = %config_path.display(), "Wrote default configuration");
    println!("{}", config_path.display());
    Ok(())
}
