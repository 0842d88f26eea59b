//! chunkmerge agent: drives the upload coordinator from the command line.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chunkmerge_protocol::ChunkMetadata;
use chunkmerge_transfer::{MergeRegistry, MergeTarget};
use chunkmerge_upload_server::{UploadCoordinator, UploadError, merge_status};

use config::AgentConfig;

#[derive(Parser)]
#[command(author, version, about = "chunkmerge agent", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/chunkmerge/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `storageRoot` from the config file
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store one chunk from a captured multipart request body
    Receive {
        /// Content-Type header of the captured request
        #[arg(long)]
        content_type: String,
        #[arg(long)]
        part_number: u32,
        #[arg(long)]
        chunks: u32,
        /// Buffer size hint in bytes
        #[arg(long)]
        size: Option<u32>,
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long, default_value_t = 0)]
        end: u64,
        /// Announced size of the whole file
        #[arg(long, default_value_t = 0)]
        total: u64,
        #[arg(long, default_value = "")]
        file_name: String,
        /// File holding the raw multipart body
        body: PathBuf,
    },
    /// Merge the stored chunks of a logical file now
    Merge {
        logical: String,
        /// Expected number of chunks (checked when requireComplete is set)
        #[arg(long)]
        chunks: Option<u32>,
        /// Announced size of the merged file
        #[arg(long)]
        total: Option<u64>,
    },
    /// List logical files with chunks waiting on disk
    Status,
    /// Drop every stored chunk of a logical file
    Purge { logical: String },
    /// Print the effective configuration
    Config {
        /// Also save it, overrides included, to the config file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chunkmerge=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut cfg = match cli.config {
        Some(path) => AgentConfig::load_from(path)?,
        None => AgentConfig::load()?,
    };
    if let Some(root) = cli.storage_root {
        cfg.storage_root = root;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling merges");
                cancel.cancel();
            }
        });
    }

    let coordinator =
        UploadCoordinator::with_cancel(cfg.coordinator(), Arc::new(MergeRegistry::new()), cancel);

    match cli.command {
        Commands::Receive {
            content_type,
            part_number,
            chunks,
            size,
            start,
            end,
            total,
            file_name,
            body,
        } => {
            let meta = ChunkMetadata {
                file_name,
                part_number,
                chunks,
                size: size.unwrap_or(cfg.default_buffer_size),
                start,
                end,
                total,
            };
            let file = tokio::fs::File::open(&body)
                .await
                .with_context(|| format!("failed to open {}", body.display()))?;

            let ack = reported(
                coordinator
                    .on_chunk_received(meta, Some(&content_type), ReaderStream::new(file))
                    .await,
            )?;
            // Background merges must finish before the process exits.
            coordinator.drain().await;
            print_json(&ack)?;
        }
        Commands::Merge {
            logical,
            chunks,
            total,
        } => {
            let mut target = MergeTarget::new(logical);
            if let Some(chunks) = chunks {
                target = target.with_expected_chunks(chunks);
            }
            if let Some(total) = total {
                target = target.with_expected_total(total);
            }
            let outcome = reported(coordinator.merge(target).await)?;
            print_json(&merge_status(outcome))?;
        }
        Commands::Status => {
            let pending = reported(coordinator.pending().await)?;
            print_json(&pending)?;
        }
        Commands::Purge { logical } => {
            let removed = reported(coordinator.cancel_upload(&logical).await)?;
            print_json(&serde_json::json!({ "fileName": logical, "removed": removed }))?;
        }
        Commands::Config { write } => {
            if write {
                cfg.save()?;
                tracing::info!(path = %cfg.file_path().display(), "configuration written");
            }
            print_json(&serde_json::json!({
                "path": cfg.file_path().display().to_string(),
                "chunkDir": cfg.chunk_dir().display().to_string(),
                "config": cfg,
            }))?;
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

/// Prints the error body to stdout before handing the error to `main`.
fn reported<T>(result: Result<T, UploadError>) -> anyhow::Result<T> {
    result.map_err(|e| {
        if let Err(print_err) = print_json(&e.to_response()) {
            tracing::error!("failed to print error response: {print_err}");
        }
        anyhow::Error::new(e)
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
