//! Command line interface for the catalog core. Supports initializing the
//! event store, ingesting event files, rebuilding indexes, and running the
//! catalog queries (apps, stacks, details, release history) against the
//! store and the configured relays.

mod cache;
mod catalog;
mod config;
mod event;
mod models;
mod relay;
mod resolve;
mod sink;
mod store;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use serde_json::json;

use cache::CachedCatalog;
use catalog::CatalogService;
use config::Settings;
use relay::RelayPool;
use sink::Sink;
use store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "catstr",
    author,
    version,
    about = "App catalog browser over Nostr relays"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Ingest one or more event files (single event or array per file).
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Rebuild indexes and latest pointers from existing events.
    Reindex,
    /// List apps ranked by their latest release.
    Apps {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Cursor from a previous page.
        #[arg(long)]
        until: Option<u64>,
    },
    /// List app stacks with members and creators resolved.
    Stacks {
        #[arg(long, default_value_t = 12)]
        limit: usize,
        /// Cursor from a previous page.
        #[arg(long)]
        until: Option<u64>,
        /// Restrict to these curator pubkeys.
        #[arg(long)]
        author: Vec<String>,
    },
    /// Show a single app by address.
    App { pubkey: String, identifier: String },
    /// Show a single stack by address, fully resolved.
    Stack { pubkey: String, identifier: String },
    /// Release history for an app, newest first.
    Releases {
        pubkey: String,
        identifier: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Print only the newest release, matched by derived identifier.
        #[arg(long)]
        latest: bool,
    },
    /// Everything published by one author: apps and stacks.
    Author {
        pubkey: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            let store = Store::new(cfg.store_root.clone());
            store.init()?;
        }
        Commands::Ingest { files } => {
            let store = Store::new(cfg.store_root.clone());
            store.init()?;
            for f in files {
                let data = fs::read_to_string(&f)?;
                let events: Vec<event::Event> = match serde_json::from_str(&data) {
                    Ok(events) => events,
                    Err(_) => vec![serde_json::from_str(&data)?],
                };
                store.put(&events)?;
            }
        }
        Commands::Reindex => {
            let store = Store::new(cfg.store_root.clone());
            store.reindex()?;
        }
        command => {
            let store = Store::open(cfg.store_root.clone())?;
            let pool = RelayPool::new(cfg.tor_socks.clone());
            let service = Arc::new(CatalogService::new(
                store.clone(),
                pool,
                cfg.relays_catalog.clone(),
                cfg.relays_profile.clone(),
                cfg.platform.clone(),
            ));
            let sink = Sink::spawn(store);
            let catalog = CachedCatalog::new(service, sink.clone());
            match command {
                Commands::Apps { limit, until } => {
                    let listing = catalog.apps(limit, until).await?;
                    println!("{}", serde_json::to_string_pretty(&*listing)?);
                }
                Commands::Stacks {
                    limit,
                    until,
                    author,
                } => {
                    let authors = if author.is_empty() {
                        None
                    } else {
                        Some(author)
                    };
                    let page = catalog.stacks(limit, until, authors).await?;
                    println!("{}", serde_json::to_string_pretty(&*page)?);
                }
                Commands::App { pubkey, identifier } => {
                    let app = catalog.app(&pubkey, &identifier).await?;
                    println!("{}", serde_json::to_string_pretty(&app)?);
                }
                Commands::Stack { pubkey, identifier } => {
                    let detail = catalog.stack(&pubkey, &identifier).await?;
                    println!("{}", serde_json::to_string_pretty(&*detail)?);
                }
                Commands::Releases {
                    pubkey,
                    identifier,
                    limit,
                    latest,
                } => {
                    if latest {
                        let release = catalog.latest_release(&pubkey, &identifier).await?;
                        println!("{}", serde_json::to_string_pretty(&release)?);
                    } else {
                        let releases = catalog.releases(&pubkey, &identifier, limit).await?;
                        println!("{}", serde_json::to_string_pretty(&releases)?);
                    }
                }
                Commands::Author { pubkey, limit } => {
                    let apps = catalog.apps_by_author(&pubkey, limit)?;
                    let stacks = catalog.stacks_by_author(&pubkey, limit)?;
                    let out = json!({ "apps": apps, "stacks": stacks });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                _ => unreachable!(),
            }
            // One-shot process: make sure queued seed events hit disk.
            sink.flush().await;
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("catstr-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("RELAYS_CATALOG=\n");
    content.push_str("RELAYS_PROFILE=\n");
    content.push_str("PLATFORM_TAG=\n");
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
