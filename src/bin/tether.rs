//! tether CLI: watcher inspection and file metadata.
//!
//! `tether watch` runs the path watcher and event debouncer against a
//! directory and prints the normalized events, which is the quickest way to
//! see what the engine would treat as an external change. `tether stat`
//! prints FileOps metadata for a file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether::fileops::{FileOps, ReadOptions};
use tether::watch::{
    event_debouncer_task, spawn_path_watcher, EventFilter, InternalWriteTags, WatchRegistration,
    DEFAULT_TAG_EXPIRY_MS,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Inspect the tether sync engine's view of the filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch a directory and print normalized, debounced events
    Watch {
        /// Directory to watch recursively
        path: PathBuf,

        /// Glob pattern relative to the root (default: everything)
        #[arg(long)]
        pattern: Option<String>,

        /// Glob patterns to ignore (can be specified multiple times)
        #[arg(long)]
        ignore: Vec<String>,

        /// Debounce window in milliseconds (0 disables coalescing)
        #[arg(long, default_value_t = 100)]
        debounce_ms: u64,
    },

    /// Print file metadata
    Stat {
        /// File to inspect
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Watch {
            path,
            pattern,
            ignore,
            debounce_ms,
        } => watch(path, pattern, ignore, debounce_ms).await,
        Command::Stat { path } => stat(path).await,
    }
}

async fn watch(
    path: PathBuf,
    pattern: Option<String>,
    ignore: Vec<String>,
    debounce_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let registration = WatchRegistration {
        root: path,
        pattern,
        ignore,
        events: EventFilter::default(),
        debounce: Duration::from_millis(debounce_ms),
    };

    let tags = Arc::new(InternalWriteTags::new(Duration::from_millis(
        DEFAULT_TAG_EXPIRY_MS,
    )));
    let (raw_tx, raw_rx) = mpsc::channel(256);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let (failure_tx, mut failure_rx) = mpsc::channel(4);

    let _watcher = spawn_path_watcher(registration.clone(), raw_tx, failure_tx)?;
    tokio::spawn(event_debouncer_task(
        registration.debounce,
        tags,
        raw_rx,
        event_tx,
    ));

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                println!("{:<8} {}", event.change, event.path);
            }
            failure = failure_rx.recv() => {
                if let Some(failure) = failure {
                    eprintln!("watch failed for {}: {}", failure.root.display(), failure.error);
                }
                break;
            }
        }
    }
    Ok(())
}

async fn stat(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let ops = FileOps::default();
    let content = ops.read(&path, &ReadOptions::default()).await?;
    println!("{}", serde_json::to_string_pretty(&content.metadata)?);
    Ok(())
}
