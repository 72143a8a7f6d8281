//! Podcatch CLI - fetch podcast episodes from the terminal
//!
//! A thin front end over the download engine: queue episodes, watch them
//! download, and inspect the local library.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Podcatch - podcast episode downloader
#[derive(Parser)]
#[command(name = "podcatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config directory for Podcatch
    #[arg(long, env = "PODCATCH_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a single episode
    Fetch {
        /// Media URL of the episode
        url: String,

        /// Feed (show) title, used as the directory name
        #[arg(short, long)]
        feed: String,

        /// Episode title, used as the file name
        #[arg(short, long)]
        title: String,

        /// Episode id; defaults to the URL
        #[arg(long)]
        id: Option<String>,
    },

    /// Download every episode listed in a JSON file
    Batch {
        /// Path to a JSON array of episodes
        file: PathBuf,
    },

    /// List downloaded episodes
    List,

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,

    /// Print the config directory
    Path,

    /// Set the download directory
    SetDir {
        /// New download root
        dir: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,podcatch_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine config directory
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => podcatch_core::default_config_dir()?,
    };
    tracing::debug!("Using config directory {:?}", config_dir);

    // Initialize core
    let core = podcatch_core::PodcatchCore::new(config_dir).await?;

    // Execute command
    let result = match cli.command {
        Commands::Fetch {
            url,
            feed,
            title,
            id,
        } => commands::fetch(&core, url, feed, title, id, cli.output).await,

        Commands::Batch { file } => commands::batch(&core, file, cli.output).await,

        Commands::List => commands::list(&core, cli.output).await,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await,
    };

    core.downloads.shutdown().await;
    result
}
