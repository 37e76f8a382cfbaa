//! `ethereal presets`: manage equalizer presets in the preset store

use super::Session;
use clap::{Args, Subcommand};
use ethereal_core::domain::preset::is_builtin;
use ethereal_core::domain::ConfigManager;

#[derive(Args)]
pub struct PresetsArgs {
    #[command(subcommand)]
    command: PresetsCommand,
}

#[derive(Subcommand)]
enum PresetsCommand {
    /// List built-in and custom presets
    List,

    /// Save band gains (dB, lowest band first) as a custom preset
    Save {
        /// Name for the preset
        name: String,

        /// One gain per band; missing bands are 0 dB, extra values are dropped
        #[arg(required = true, allow_hyphen_values = true)]
        gains: Vec<f32>,
    },

    /// Delete a custom preset
    Delete {
        /// Preset name to delete
        name: String,
    },
}

pub async fn run(manager: &ConfigManager, args: PresetsArgs) -> anyhow::Result<()> {
    let session = Session::open(manager).await?;
    let controller = &session.controller;

    match args.command {
        PresetsCommand::List => {
            let view = controller.view();
            let active = view.active_preset.as_deref();
            for name in controller.preset_names() {
                let marker = if Some(name.as_str()) == active { "*" } else { " " };
                let origin = if is_builtin(&name) { "built-in" } else { "custom" };
                println!("{marker} {name:<20} {origin}");
            }
            if view.persistence_degraded {
                println!("(custom presets could not be read from the store)");
            }
        }
        PresetsCommand::Save { name, gains } => {
            controller.save_custom_preset(&name, gains).await?;
            println!("Saved preset {name:?}");
        }
        PresetsCommand::Delete { name } => {
            controller.delete_custom_preset(&name).await?;
            println!("Deleted preset {name:?}");
        }
    }
    Ok(())
}
