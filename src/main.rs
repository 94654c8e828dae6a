//! Command-line front end for the asset store

use std::collections::BTreeMap;
use std::future::Future;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use assetstore::{
    AssetChanged, AssetKey, ChangeKind, LocalDiskStore, SharedConfig, StoreConfig, StoreError,
};

#[derive(Parser)]
#[command(name = "assetstore", version, about = "Keyed on-disk store for generated assets")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding one subdirectory per key
    #[arg(long, global = true)]
    physical_path: Option<PathBuf>,

    /// URL path prefix assets are published under
    #[arg(long, global = true)]
    virtual_path: Option<String>,

    /// Scheme and host prefix of absolute asset URLs
    #[arg(long, global = true)]
    content_host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store content under a URL (reads stdin when no input file is given)
    Save {
        url: String,
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Store content under a new key and print its URL
    Put {
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Write the content stored under a URL to stdout
    Cat { url: String },
    /// List stored keys and their URLs
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print add/delete notifications until interrupted
    Watch {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), StoreError> {
    let config = load_config(&cli)?;
    let store = LocalDiskStore::new(Arc::new(SharedConfig::new(config)));

    match cli.command {
        Command::Save { url, input } => {
            let content = read_input(input)?;
            store.save(&content, &url)?;
            eprintln!("{} {} ({} bytes)", "saved".green(), url, content.len());
        }
        Command::Put { input } => {
            let content = read_input(input)?;
            let url = store.url_for(&AssetKey::new());
            store.save(&content, &url)?;
            println!("{}", url);
        }
        Command::Cat { url } => {
            let mut stream = store.open_read_stream(&url)?;
            let mut stdout = io::stdout().lock();
            io::copy(&mut stream, &mut stdout).map_err(|e| output_error(&url, e))?;
            stdout.flush().map_err(|e| output_error(&url, e))?;
        }
        Command::List { json } => {
            let entries: BTreeMap<_, _> = store.list_stored_entries()?.into_iter().collect();
            if json {
                match serde_json::to_string_pretty(&entries) {
                    Ok(rendered) => println!("{}", rendered),
                    Err(e) => tracing::error!("Failed to serialize entries: {}", e),
                }
            } else {
                for (key, url) in &entries {
                    println!("{}  {}", key.to_string().dimmed(), url);
                }
            }
        }
        Command::Watch { json } => watch(&store, json).await,
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<StoreConfig, StoreError> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };
    if let Some(path) = &cli.physical_path {
        config.physical_path = path.clone();
    }
    if let Some(virtual_path) = &cli.virtual_path {
        config.virtual_path = virtual_path.clone();
    }
    if let Some(host) = &cli.content_host {
        config.content_host = Some(host.clone());
    }
    config.validate()?;
    if !config.is_configured() {
        return Err(StoreError::InvalidConfig {
            message: "no physical path; pass --physical-path or set physical_path in --config"
                .to_string(),
        });
    }
    Ok(config)
}

fn read_input(input: Option<PathBuf>) -> Result<Vec<u8>, StoreError> {
    match input {
        Some(path) => std::fs::read(&path).map_err(|e| StoreError::read(&path, e)),
        None => {
            let mut content = Vec::new();
            io::stdin()
                .read_to_end(&mut content)
                .map_err(|e| output_error("<stdin>", e))?;
            Ok(content)
        }
    }
}

fn output_error(what: &str, source: io::Error) -> StoreError {
    StoreError::StorageFailure {
        path: what.to_string(),
        source,
    }
}

async fn watch(store: &LocalDiskStore, json: bool) {
    let mut rx = store.subscribe();
    match store.watcher().watched_root() {
        Some(root) => eprintln!("Watching {} (Ctrl+C to stop)", root.display()),
        None => eprintln!(
            "{} physical path is not watchable; no notifications will arrive",
            "warning:".yellow().bold()
        ),
    }

    let handled = print_changes_until(&mut rx, tokio::signal::ctrl_c(), json).await;
    tracing::info!("Stopped watching after {} notifications", handled);
}

/// Print notifications until `shutdown` resolves or the feed closes. Returns
/// how many notifications were printed.
async fn print_changes_until<F: Future>(
    rx: &mut broadcast::Receiver<AssetChanged>,
    shutdown: F,
    json: bool,
) -> usize {
    tokio::pin!(shutdown);
    let mut handled = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = rx.recv() => match received {
                Ok(change) => {
                    print_change(&change, json);
                    handled += 1;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} notifications", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    handled
}

fn print_change(change: &AssetChanged, json: bool) {
    if json {
        match serde_json::to_string(change) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!("Failed to serialize notification: {}", e),
        }
        return;
    }

    match change.kind {
        ChangeKind::Added => println!(
            "{} {}  {}",
            "+".green().bold(),
            change.key,
            change.url.as_deref().unwrap_or_default()
        ),
        ChangeKind::Deleted => println!("{} {}", "-".red().bold(), change.key),
    }
}
