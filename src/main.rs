use anyhow::Result;
use clap::{Parser, ValueEnum};

use docsrs_cache_mcp::config::{self, ServerConfig, StorageMode};
use docsrs_cache_mcp::server;

#[derive(Parser, Debug)]
#[command(version, about = "Rust API Documentation MCP Server")]
struct Cli {
    /// Type of server to run
    #[arg(short, long, value_enum, default_value_t = ServerType::Sse)]
    server_type: ServerType,

    /// Address for the SSE server
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// How long fetched documentation stays fresh
    #[arg(
        long,
        env = "DOCS_CACHE_TTL_MS",
        default_value_t = config::DEFAULT_CACHE_TTL_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    cache_ttl_ms: u64,

    /// Maximum number of cached documentation pages
    #[arg(
        long,
        env = "DOCS_MAX_CACHE_ENTRIES",
        default_value_t = config::DEFAULT_MAX_CACHE_ENTRIES as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_cache_entries: u64,

    /// Upper bound on one upstream lookup
    #[arg(
        long,
        env = "DOCS_REQUEST_TIMEOUT_MS",
        default_value_t = config::DEFAULT_REQUEST_TIMEOUT_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    request_timeout_ms: u64,

    /// Durable cache file, or ":memory:" to keep the cache in memory only
    #[arg(long, env = "DOCS_CACHE_PATH", default_value = config::MEMORY_SENTINEL)]
    cache_path: StorageMode,

    /// Base URL of the documentation host
    #[arg(long, env = "DOCS_URL", default_value = config::DEFAULT_DOCS_URL)]
    docs_url: String,

    /// Base URL of the crate registry API
    #[arg(long, env = "DOCS_REGISTRY_URL", default_value = config::DEFAULT_REGISTRY_URL)]
    registry_url: String,

    /// Attempts per upstream request on transient failures
    #[arg(
        long,
        env = "DOCS_MAX_FETCH_ATTEMPTS",
        default_value_t = config::DEFAULT_MAX_FETCH_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..=config::MAX_FETCH_ATTEMPTS as i64)
    )]
    max_fetch_attempts: u32,

    /// Interval of the expired-entry sweep, 0 disables it
    #[arg(
        long,
        env = "DOCS_SWEEP_INTERVAL_MS",
        default_value_t = config::DEFAULT_SWEEP_INTERVAL_MS
    )]
    sweep_interval_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ServerType {
    /// Start an SSE server
    Sse,
    /// Start a stdio server
    Stdio,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            cache_ttl_ms: self.cache_ttl_ms,
            max_cache_entries: self.max_cache_entries as usize,
            request_timeout_ms: self.request_timeout_ms,
            storage: self.cache_path.clone(),
            docs_base_url: self.docs_url.clone(),
            registry_base_url: self.registry_url.clone(),
            max_fetch_attempts: self.max_fetch_attempts,
            sweep_interval_ms: self.sweep_interval_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.server_config();
    config.validate()?;

    match cli.server_type {
        ServerType::Sse => {
            eprintln!("Starting SSE server on {}", cli.address);
            server::start_sse_server(&cli.address, config).await?;
        }
        ServerType::Stdio => {
            server::start_stdio_server(config).await?;
        }
    }

    Ok(())
}
