//! dirsync CLI
//!
//! Thin wrapper around dirsync-core for running a hub or a peer.
//!
//! ## Usage
//!
//! ```bash
//! # Serve /srv/project to peers on port 5151
//! dirsync hub --root /srv/project --host 0.0.0.0 --password s3cret
//!
//! # Mirror the hub into ./project and keep it in sync
//! dirsync peer --root ./project --host hub.lan --password s3cret
//!
//! # Show the configuration a command would run with
//! dirsync --config ./dirsync.toml config
//! ```
//!
//! Without `--config`, `~/.dirsync/config.toml` is used when it exists.
//! Flags override values from the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dirsync_core::config::CONFIG_FILE;
use dirsync_core::{ClientSession, Hub, LocalWatcher, SyncConfig};
use tracing::info;

/// dirsync - directory tree mirroring over TCP
#[derive(Parser)]
#[command(name = "dirsync")]
#[command(version = "0.1.0")]
#[command(about = "Keep a directory tree identical across machines")]
#[command(
    long_about = "One hub holds the authoritative tree. Peers download a snapshot on connect and then exchange every change through the hub."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: ~/.dirsync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub: serve snapshots and relay changes between peers
    Hub(Overrides),

    /// Run a peer: mirror the hub and push local changes to it
    Peer(Overrides),

    /// Print the effective configuration as TOML
    Config(Overrides),
}

/// Command-line values that take precedence over the config file
#[derive(Args, Default)]
struct Overrides {
    /// Directory to synchronize
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Address to bind (hub) or connect to (peer)
    #[arg(long)]
    host: Option<String>,

    /// TCP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared secret checked when a peer connects
    #[arg(long)]
    password: Option<String>,

    /// Additional ignored path segment (repeatable)
    #[arg(long = "ignore")]
    ignored: Vec<String>,
}

impl Overrides {
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        config.ignored.extend(self.ignored);
        config
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default config file (~/.dirsync/config.toml)
fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dirsync")
        .join(CONFIG_FILE)
}

fn load_config(explicit: Option<&Path>) -> Result<SyncConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                return Ok(SyncConfig::default());
            }
            path
        }
    };
    SyncConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn run_hub(config: SyncConfig) -> Result<()> {
    let hub = Hub::bind(&config)
        .await
        .with_context(|| format!("Failed to start hub on {}", config.address()))?;
    println!("Hub listening on {}", hub.local_addr()?);
    println!("Serving {}", hub.tree().root().display());

    let (_watcher, events) = LocalWatcher::start(hub.tree().root())?;
    let watching = hub.clone();
    tokio::spawn(async move { watching.watch_local(events).await });

    tokio::select! {
        result = hub.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Received shutdown signal...");
        }
    }

    hub.shutdown().await;
    Ok(())
}

async fn run_peer(config: SyncConfig) -> Result<()> {
    let session = ClientSession::connect(&config)
        .await
        .with_context(|| format!("Failed to join hub at {}", config.address()))?;
    println!("Connected to {}", config.address());
    println!("Mirroring into {}", session.tree().root().display());

    let (_watcher, events) = LocalWatcher::start(session.tree().root())?;
    let stop = session.cancellation_token();
    let running = session.run(Some(events));
    tokio::pin!(running);

    tokio::select! {
        result = &mut running => result?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Received shutdown signal...");
            stop.cancel();
            running.await?;
        }
    }

    info!("Peer stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Hub(overrides) => run_hub(overrides.apply(config)).await,
        Commands::Peer(overrides) => run_peer(overrides.apply(config)).await,
        Commands::Config(overrides) => {
            print!("{}", overrides.apply(config).to_toml()?);
            Ok(())
        }
    }
}
