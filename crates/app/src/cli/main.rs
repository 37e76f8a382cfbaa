//! Ethereal Tunes CLI

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ethereal")]
#[command(author, version, about = "Equalizer, compressor and spectrum visualizer", long_about = None)]
struct Cli {
    /// Use this config file instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a test signal through the equalizer and show its spectrum
    Play(commands::play::PlayArgs),

    /// List, save and delete equalizer presets
    Presets(commands::presets::PresetsArgs),

    /// Show or initialise the configuration file
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let manager = commands::config_manager(cli.config)?;

    match cli.command {
        Commands::Play(args) => commands::play::run(&manager, args).await,
        Commands::Presets(args) => commands::presets::run(&manager, args).await,
        Commands::Config(args) => commands::config::run(&manager, args).await,
    }
}
