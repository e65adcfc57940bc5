// lehost: command-line front for the BLE host core
//
// Replays scripted client requests and Link Engine callbacks against the
// simulated engine, and manages the configuration file.

mod config;
mod logging;
mod replay;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "lehost")]
#[command(about = "lehost: BLE host session and state core", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON script against the simulated Link Engine
    Replay { script: PathBuf },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a default config file
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::Config::default_file()?,
    };
    let config = config::Config::load_from(&config_path)?;
    let _log_guard = logging::init(&config, cli.verbose)?;

    tracing::debug!("lehost core {}", lehost_core::VERSION);

    match cli.command {
        Commands::Replay { script } => cmd_replay(&config, &script).await,
        Commands::Config { action } => cmd_config(&config, &config_path, action),
    }
}

async fn cmd_replay(config: &config::Config, script_path: &Path) -> Result<()> {
    let script = replay::load_script(script_path)?;
    println!(
        "{} {} ({} steps)",
        "Replaying".bold(),
        script_path.display().to_string().bright_cyan(),
        script.steps.len()
    );
    println!();

    let report = replay::run(&script, config.host.clone())
        .await
        .context("Replay failed")?;
    replay::print_report(&report);
    Ok(())
}

fn cmd_config(
    config: &config::Config,
    config_path: &Path,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            config::Config::default().save_to(config_path)?;
            println!("  {} Wrote {}", "✓".green(), config_path.display());
        }
    }
    Ok(())
}
