use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hb_core::config::HoverboardConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod simulate;
mod storage;

use simulate::SimulateArgs;
use storage::{InhibitCommand, RecentTagsCommand, StorageCommand, StoreArgs};

#[derive(Parser)]
#[command(name = "hb")]
#[command(about = "Hoverboard messaging and storage tools", long_about = None)]
struct Cli {
    /// Config file; defaults to <config dir>/hoverboard/config.toml.
    #[arg(long, global = true, env = "HB_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Inspect and edit the durable store
    Storage {
        #[command(flatten)]
        store: StoreArgs,
        #[command(subcommand)]
        action: StorageCommand,
    },
    /// Manage the recent-tag list
    RecentTags {
        #[command(flatten)]
        store: StoreArgs,
        #[command(subcommand)]
        action: RecentTagsCommand,
    },
    /// Manage the inhibited-site list
    Inhibit {
        #[command(flatten)]
        store: StoreArgs,
        #[command(subcommand)]
        action: InhibitCommand,
    },
    /// Show the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Run background, control surface and documents in-process
    Simulate(SimulateArgs),
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config_path = cli.config.clone().or_else(default_config_path);
    let config = match &config_path {
        Some(path) => HoverboardConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HoverboardConfig::default(),
    };

    match cli.command {
        Commands::Storage { store, action } => storage::run_storage(&store, &config, action).await,
        Commands::RecentTags { store, action } => {
            storage::run_recent_tags(&store, &config, action).await
        }
        Commands::Inhibit { store, action } => storage::run_inhibit(&store, &config, action).await,
        Commands::Config { action } => match action {
            ConfigCommand::Show => {
                if let Some(path) = &config_path {
                    eprintln!("# {}", path.display());
                }
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
        },
        Commands::Simulate(args) => simulate::run(&config, args).await,
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hoverboard").join("config.toml"))
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("HB_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
