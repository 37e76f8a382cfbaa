//! `ethereal config`: inspect or create the configuration file

use anyhow::{bail, Context};
use clap::{Args, Subcommand};
use ethereal_core::domain::{ConfigManager, EtherealConfig};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,

    /// Write the factory default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(manager: &ConfigManager, args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show => {
            let config = manager.load().await;
            println!("# {}", manager.config_path().display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("cannot render configuration")?
            );
        }
        ConfigCommand::Init { force } => {
            if manager.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    manager.config_path().display()
                );
            }
            manager.save(&EtherealConfig::factory_default()).await?;
            println!("Wrote {}", manager.config_path().display());
        }
    }
    Ok(())
}
