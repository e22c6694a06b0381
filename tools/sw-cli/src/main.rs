//! Command-line driver for the JourneyGo offline cache.
//!
//! Provides commands for:
//! - Installing and activating the app shell against a live origin
//! - Routing single requests through the cache manager, online or offline
//! - Inspecting the persisted stores
//!
//! ## Usage
//!
//! ```bash
//! # Install the app shell served by a local dev server
//! sw-cli --origin http://localhost:5173/ install
//!
//! # Load a page with the network switched off
//! sw-cli fetch /trips?id=4 --navigate --offline
//!
//! # List stores and what they hold
//! sw-cli caches --entries
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use http::Method;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use journeygo_cache::{CacheStorage, SqliteCacheStorage};
use journeygo_common::{init_logging, LogConfig, LogFormat};
use journeygo_net::{Destination, Fetcher, HttpFetcher, LoaderConfig, OfflineFetcher, Request};
use journeygo_sw::{ServiceWorker, SwConfig, SwEvent};

#[derive(Parser)]
#[command(name = "sw-cli")]
#[command(about = "Drive the JourneyGo offline cache from the command line")]
struct Cli {
    /// SQLite file holding the stores
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON cache manager configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Application origin, overriding the configuration
    #[arg(long, global = true)]
    origin: Option<Url>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the app shell into the current version and activate it
    Install,

    /// Route one request through the cache manager
    Fetch {
        /// Path or absolute URL, resolved against the origin
        target: String,
        /// Request destination (style, script, font, image, manifest, ...)
        #[arg(short, long, default_value = "empty")]
        destination: Destination,
        /// Send as a top-level navigation
        #[arg(long)]
        navigate: bool,
        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: Method,
        /// Run without any network access
        #[arg(long)]
        offline: bool,
        /// Print the response body
        #[arg(long)]
        body: bool,
    },

    /// List stores in the database
    Caches {
        /// Also list every entry
        #[arg(long)]
        entries: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))?;

    let config = load_config(cli.config.as_deref(), cli.origin.clone())?;
    let db = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let storage = Arc::new(open_storage(&db)?);

    match cli.command {
        Commands::Install => install(config, storage).await,
        Commands::Fetch {
            target,
            destination,
            navigate,
            method,
            offline,
            body,
        } => {
            let request = build_request(&config, &target, destination, navigate, method)?;
            fetch(config, storage, request, offline, body).await
        }
        Commands::Caches { entries } => list_caches(storage.as_ref(), entries).await,
    }
}

fn load_config(path: Option<&Path>, origin: Option<Url>) -> anyhow::Result<SwConfig> {
    let mut config = match path {
        Some(path) => SwConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SwConfig::default(),
    };
    if let Some(origin) = origin {
        config.origin = origin;
    }
    config.validate()?;
    Ok(config)
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::cache_dir().context("no cache directory on this platform")?;
    Ok(base.join("journeygo").join("caches.db"))
}

fn open_storage(path: &Path) -> anyhow::Result<SqliteCacheStorage> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    debug!(path = %path.display(), "Opening cache database");
    SqliteCacheStorage::open(path).with_context(|| format!("opening {}", path.display()))
}

fn build_request(
    config: &SwConfig,
    target: &str,
    destination: Destination,
    navigate: bool,
    method: Method,
) -> anyhow::Result<Request> {
    let url = config.resolve(target)?;
    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url).destination(destination)
    };
    Ok(request.method(method))
}

fn new_worker(
    config: SwConfig,
    storage: Arc<SqliteCacheStorage>,
    offline: bool,
) -> anyhow::Result<ServiceWorker> {
    let fetcher: Arc<dyn Fetcher> = if offline {
        Arc::new(OfflineFetcher)
    } else {
        Arc::new(HttpFetcher::new(LoaderConfig::for_origin(config.origin.clone()))?)
    };

    let (worker, events) = ServiceWorker::new(config, fetcher, storage);
    tokio::spawn(log_events(events));
    Ok(worker)
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SwEvent>) {
    while let Some(event) = events.recv().await {
        debug!(event = ?event, "Cache manager event");
    }
}

async fn install(config: SwConfig, storage: Arc<SqliteCacheStorage>) -> anyhow::Result<()> {
    let version = config.cache_version.clone();
    let worker = new_worker(config, storage.clone(), false)?;

    worker.install().await?;
    worker.activate().await?;

    let entries = storage.open(&version).await?.keys().await?.len();
    println!("Installed {} ({} entries)", version, entries);
    Ok(())
}

async fn fetch(
    config: SwConfig,
    storage: Arc<SqliteCacheStorage>,
    request: Request,
    offline: bool,
    print_body: bool,
) -> anyhow::Result<()> {
    let worker = new_worker(config, storage, offline)?;
    if offline {
        if !worker.restore().await? {
            bail!("nothing installed for this version; run `sw-cli install` first");
        }
    } else {
        worker.ensure_active().await?;
    }

    let target = request.url.clone();
    let outcome = worker.handle_fetch(request).await;

    // Flush background writes before the runtime shuts down.
    let written = worker.wait_for_pending_writes().await;
    debug!(written, "Background writes finished");

    let Some(response) = outcome? else {
        println!("{} not intercepted; the page would go to the network", target);
        return Ok(());
    };

    println!(
        "{} {} ({:?}, {})",
        response.status,
        response.url,
        response.response_type,
        if response.from_cache { "cache" } else { "network" }
    );
    if print_body {
        println!("{}", response.text().await?);
    }
    info!(url = %target, "Fetch complete");
    Ok(())
}

async fn list_caches(storage: &SqliteCacheStorage, show_entries: bool) -> anyhow::Result<()> {
    let names = storage.keys().await?;
    if names.is_empty() {
        println!("No caches");
        return Ok(());
    }

    for name in names {
        let keys = storage.open(&name).await?.keys().await?;
        println!("{} ({} entries)", name, keys.len());
        if show_entries {
            for key in keys {
                println!("  {} {}", key.method, key.url);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "sw-cli",
            "-vv",
            "fetch",
            "/photos/1.jpg",
            "--destination",
            "image",
            "--offline",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Fetch {
                destination,
                offline,
                method,
                navigate,
                ..
            } => {
                assert_eq!(destination, Destination::Image);
                assert!(offline);
                assert!(!navigate);
                assert_eq!(method, Method::GET);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_build_navigation_request() {
        let config = SwConfig::for_origin(Url::parse("https://journeygo.test/").unwrap());
        let request = build_request(&config, "/trips?id=4", Destination::Empty, true, Method::GET)
            .unwrap();

        assert!(request.is_navigation());
        assert_eq!(request.url.as_str(), "https://journeygo.test/trips?id=4");
    }

    #[test]
    fn test_load_config_applies_origin() {
        let origin = Url::parse("https://staging.journeygo.test/").unwrap();
        let config = load_config(None, Some(origin.clone())).unwrap();
        assert_eq!(config.origin, origin);
        assert_eq!(config.cache_version, "journeygo-cache-v2");
    }
}
