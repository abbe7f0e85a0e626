use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(version)]
#[command(about = "Provision declared cloud instances, render their inventory and hand off to configuration management", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Provider backend (scaleway, mock)
    #[arg(long, global = true, env = "STRATUM_PROVIDER")]
    pub provider: Option<String>,

    /// Directory for the inventory, connect helpers and the action journal
    #[arg(long, global = true, env = "STRATUM_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show what apply would change, without touching anything
    Plan(ManifestArgs),

    /// Converge the provider to the manifest, then probe and configure
    Apply(ApplyArgs),

    /// Remove every declared instance and its dependencies
    Destroy(ManifestArgs),

    /// Rewrite the inventory and connect helpers from observed state
    Render(ManifestArgs),
}

#[derive(Args, Debug)]
pub struct ManifestArgs {
    /// Path to the JSON manifest
    #[arg(short, long, default_value = "stratum.json")]
    pub manifest: PathBuf,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Playbook handed to the configuration run
    #[arg(short, long)]
    pub playbook: Option<PathBuf>,

    /// Concurrent provider calls per tier
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Provision and render only
    #[arg(long)]
    pub skip_configure: bool,

    /// Do not wait for readiness ports
    #[arg(long)]
    pub skip_probe: bool,
}

impl Cli {
    /// Flags win over the environment.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(p) = &self.provider {
            settings.provider = p.trim().to_lowercase();
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = dir.clone();
        }
        if let Commands::Apply(args) = &self.command {
            if let Some(w) = args.workers.filter(|w| *w > 0) {
                settings.workers = w;
            }
        }
    }

    pub fn manifest_path(&self) -> &PathBuf {
        match &self.command {
            Commands::Plan(a) | Commands::Destroy(a) | Commands::Render(a) => &a.manifest,
            Commands::Apply(a) => &a.manifest.manifest,
        }
    }
}
