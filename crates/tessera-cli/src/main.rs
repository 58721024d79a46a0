//! Tessera CLI
//!
//! Peer-to-peer folder synchronization daemon

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use tessera_core::node::{Node, SyncEvent};
use tessera_crypto::{DeviceKey, FolderId};
use tessera_files::{ChangeEvent, ChunkStore, FolderIndexer, IgnoreList};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use config::{Config, expand_home};
use progress::{Spinner, TransferBar, describe, format_bytes};

/// Tessera - keep folders in sync between your devices, no server needed
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync daemon until Ctrl-C
    Daemon {
        /// Override the listen address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new device identity
    Keygen {
        /// Output file (defaults to the configured identity file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// Print this device's peer id
    Id,

    /// Derive a folder id from a shared secret, or make a random one
    FolderId {
        /// Secret shared by every device of the folder
        secret: Option<String>,
    },

    /// Index a directory without syncing it and print a summary
    Scan {
        /// Directory to index
        path: PathBuf,

        /// List every file
        #[arg(short, long)]
        list: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    config.validate()?;

    match cli.command {
        Commands::Daemon { bind } => run_daemon(bind, &config).await?,
        Commands::Keygen { output, force } => generate_identity(output, force, &config)?,
        Commands::Id => show_id(&config)?,
        Commands::FolderId { secret } => folder_id(secret.as_deref()),
        Commands::Scan { path, list } => scan(path, list, &config).await?,
    }

    Ok(())
}

/// Run daemon mode
async fn run_daemon(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let mut node_config = config.to_node_config()?;
    if let Some(bind) = bind {
        node_config.listen_addr = bind
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?;
    }
    let identity = DeviceKey::load_or_generate(&node_config.identity_file)
        .with_context(|| format!("identity file {}", node_config.identity_file.display()))?;

    let folders = node_config.folders.len();
    let node = Node::start(node_config, identity).await?;
    let mut events = node.subscribe();

    println!("Tessera Daemon");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Peer id: {}", node.peer_id());
    println!("Listen: {}", node.listen_addr());
    println!("Folders: {folders}");
    println!("\nPress Ctrl+C to stop");

    let mut bars: HashMap<FolderId, TransferBar> = HashMap::new();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(SyncEvent::TransferProgress { folder_id, completed, remaining, bytes }) => {
                    bars.entry(folder_id)
                        .or_insert_with(|| TransferBar::new(&folder_id.short()))
                        .update(completed, remaining, bytes);
                    if remaining == 0 {
                        bars.remove(&folder_id);
                    }
                }
                Ok(event) => {
                    if let Some(line) = describe(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("missed {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    println!("\nShutting down...");
    node.shutdown().await;
    Ok(())
}

/// Generate a new identity keypair
fn generate_identity(output: Option<PathBuf>, force: bool, config: &Config) -> anyhow::Result<()> {
    let path = output.map_or_else(|| config.identity_file(), |p| expand_home(&p));
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }

    let key = DeviceKey::generate(&mut rand_core::OsRng);
    key.save(&path)
        .with_context(|| format!("writing {}", path.display()))?;

    println!("Peer id: {}", key.peer_id());
    println!("Private key saved to: {}", path.display());
    println!("\nKeep this file secure! It is this device's identity.");
    Ok(())
}

fn show_id(config: &Config) -> anyhow::Result<()> {
    let path = config.identity_file();
    let key = DeviceKey::load(&path)
        .with_context(|| format!("no identity at {} (run `tessera keygen`)", path.display()))?;
    println!("{}", key.peer_id());
    Ok(())
}

fn folder_id(secret: Option<&str>) {
    let id = match secret {
        Some(secret) => FolderId::from_secret(secret),
        None => {
            let mut bytes = [0u8; 32];
            rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut bytes);
            FolderId::from_bytes(bytes)
        }
    };
    println!("{}", id.to_hex());
}

/// Index a directory into a throwaway chunk store
async fn scan(path: PathBuf, list: bool, config: &Config) -> anyhow::Result<()> {
    let root = std::fs::canonicalize(expand_home(&path))
        .with_context(|| format!("cannot open {}", path.display()))?;
    let chunker = config.to_node_config()?.chunker;
    let scratch = tempfile::tempdir()?;
    let spinner = Spinner::new(&format!("indexing {}", root.display()));

    let scan_root = root.clone();
    let store_dir = scratch.path().join("chunks");
    let report = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let store = ChunkStore::open(store_dir)?;
        let ignore = IgnoreList::load(&scan_root, &[])?;
        let indexer = FolderIndexer::new(&scan_root, chunker, ignore)?;
        Ok(indexer.scan(&BTreeMap::new(), &store)?)
    })
    .await??;
    spinner.finish_with_message(format!("indexed {}", root.display()));

    let mut files = 0usize;
    let mut bytes = 0u64;
    let mut chunks = 0usize;
    let mut unique = HashSet::new();
    for event in &report.events {
        if let ChangeEvent::Created(manifest) = event {
            files += 1;
            bytes += manifest.size;
            chunks += manifest.chunks.len();
            unique.extend(manifest.digests());
            if list {
                println!(
                    "{}  {:>10}  {}",
                    manifest.root.short(),
                    format_bytes(manifest.size),
                    manifest.path
                );
            }
        }
    }

    println!();
    println!("Files: {files}");
    println!("Size: {}", format_bytes(bytes));
    println!("Chunks: {chunks} ({} unique)", unique.len());
    println!("Hashed: {}", format_bytes(report.bytes_hashed));
    for (path, reason) in &report.skipped {
        println!("Skipped {path}: {reason}");
    }
    Ok(())
}
