//! bucketlift uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Resumable multipart uploads to S3-compatible object storage.
#[derive(Debug, Parser)]
#[command(name = "bucketlift", version, about)]
struct Cli {
    /// Configuration file (defaults to the per-user config).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a file.
    Upload {
        file: PathBuf,
        /// Destination key (defaults to the file name).
        #[arg(long)]
        key: Option<String>,
        /// Delete the file once the upload completes or is aborted.
        #[arg(long)]
        delete_source: bool,
    },
    /// Continue an interrupted upload from its checkpoint.
    Resume {
        snapshot: PathBuf,
        file: PathBuf,
        #[arg(long)]
        delete_source: bool,
    },
    /// Release the store-side upload named by a checkpoint.
    Abort { snapshot: PathBuf },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bucketlift=debug")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting bucketlift");

    let config = config::Config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Upload {
                file,
                key,
                delete_source,
            } => app::upload(&config, &file, key, delete_source).await,
            Command::Resume {
                snapshot,
                file,
                delete_source,
            } => app::resume(&config, &snapshot, &file, delete_source).await,
            Command::Abort { snapshot } => app::abort(&config, &snapshot).await,
        }
    })
}
