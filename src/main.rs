mod client;
mod config;
mod lifecycle;
mod links;
mod network;
mod offline;
mod prefetch;
mod response;
mod router;
mod server;
mod store;
#[cfg(test)]
mod testutil;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swcache_protocol::{
    CachePathRequest, Command, ConfigureRuntimeCachingRequest, InstallRequest,
    RemoveOldCachesRequest, RuntimeCachingOptions,
};

use crate::client::ControlClient;

/// Build version: CI sets SWCACHE_VERSION from the git tag, local builds use Cargo.toml.
pub const VERSION: &str = match option_env!("SWCACHE_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// swcache: runtime caching and prefetch proxy for storefront PWAs.
///
/// `swcache serve` runs the caching proxy in front of the origin. Every other
/// subcommand talks to a running proxy over its control endpoint.
#[derive(Parser)]
#[command(name = "swcache", version = VERSION, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the caching proxy
    Serve,

    /// Prefetch a path into the runtime cache
    Prefetch {
        /// Same-origin path, e.g. /s/shoes
        path: String,

        /// API build version (default: the daemon's configured version)
        #[arg(long)]
        api_version: Option<String>,

        /// Also prefetch the links the page marks for prefetching
        #[arg(long)]
        links: bool,
    },

    /// Cancel every in-flight prefetch, keeping them for resume
    Abort,

    /// Re-issue prefetches cancelled by abort
    Resume,

    /// Delete every cache except the precache
    Clear,

    /// Delete caches that do not belong to an API version
    RemoveOldCaches {
        /// The current API build version
        api_version: String,
    },

    /// Change the runtime cache expiration policy
    Configure {
        /// Only apply to this cache (default: every cache)
        #[arg(long)]
        cache_name: Option<String>,

        /// Keep at most this many entries per cache
        #[arg(long)]
        max_entries: Option<u32>,

        /// Drop entries older than this (e.g. 7d, 24h, 30m, 3600)
        #[arg(long)]
        max_age: Option<String>,
    },

    /// Run install: drop stale caches, refill the precache, warm open clients
    Install {
        /// URLs of open page clients
        clients: Vec<String>,
    },

    /// Show daemon and cache status
    Status {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // SWCACHE_LOG (not RUST_LOG) so global settings stay out of the proxy's logs.
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("SWCACHE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("swcache=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::load()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if let Commands::Serve = cli.command {
        return rt.block_on(server::serve(config));
    }

    rt.block_on(run_client(&config, cli.command))
}

async fn run_client(config: &config::Config, command: Commands) -> Result<()> {
    let ctl = ControlClient::new(config.listen)?;
    let cmd = match command {
        Commands::Serve => unreachable!(),
        Commands::Status { json } => {
            let status = ctl.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                client::print_status(&status);
            }
            return Ok(());
        }
        Commands::Prefetch {
            path,
            api_version,
            links,
        } => Command::CachePath(CachePathRequest {
            path,
            api_version,
            cache_links: links,
        }),
        Commands::Abort => Command::AbortPrefetches,
        Commands::Resume => Command::ResumePrefetches,
        Commands::Clear => Command::ClearCache,
        Commands::RemoveOldCaches { api_version } => {
            Command::RemoveOldCaches(RemoveOldCachesRequest { api_version })
        }
        Commands::Configure {
            cache_name,
            max_entries,
            max_age,
        } => {
            let max_age_seconds = max_age
                .as_deref()
                .map(|s| {
                    client::parse_duration_secs(s)
                        .with_context(|| format!("invalid --max-age {s:?}"))
                })
                .transpose()?;
            Command::ConfigureRuntimeCaching(ConfigureRuntimeCachingRequest {
                options: RuntimeCachingOptions {
                    cache_name,
                    max_entries,
                    max_age_seconds,
                },
            })
        }
        Commands::Install { clients } => Command::Install(InstallRequest { clients }),
    };

    let ack = ctl.send(&cmd).await?;
    eprintln!("{}: ok", ack.action.as_deref().unwrap_or(cmd.action()));
    Ok(())
}
