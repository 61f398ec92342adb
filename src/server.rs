use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::ServiceExt;
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::stdio;
use tokio::task::JoinHandle;
use tracing_subscriber::{self, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::{Cache, CacheStore};
use crate::config::ServerConfig;
use crate::coordinator::RequestCoordinator;
use crate::docs_parser::DocsRsClient;
use crate::mcp::DocsHandler;

/// Composition root: the cache, fetcher and coordinator shared by every
/// session of one server process.
pub struct App {
    pub cache: Arc<CacheStore>,
    pub handler: DocsHandler,
    sweeper: Option<JoinHandle<()>>,
}

impl App {
    pub async fn build(config: &ServerConfig) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheStore::open(config).await);
        let fetcher = Arc::new(DocsRsClient::new(config)?);
        let coordinator = RequestCoordinator::new(cache.clone(), fetcher, config.request_timeout());
        let sweeper = config
            .sweep_interval()
            .map(|interval| spawn_expiry_sweep(cache.clone(), interval));

        tracing::info!(
            "Documentation cache ready: ttl={}ms capacity={} storage={}",
            config.cache_ttl_ms,
            config.max_cache_entries,
            if cache.is_durable() { config.storage.to_string() } else { "memory".to_string() }
        );

        Ok(Self {
            cache,
            handler: DocsHandler::new(Arc::new(coordinator)),
            sweeper,
        })
    }

    pub async fn shutdown(self) {
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
        let stats = self.cache.stats().await;
        tracing::info!("Shutting down with cache stats {:?}", stats);
    }
}

/// Periodically drops expired entries so memory is reclaimed even when
/// nothing reads them.
pub fn spawn_expiry_sweep(cache: Arc<CacheStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = cache.purge_expired().await;
            if purged > 0 {
                tracing::debug!("Expiry sweep removed {} entries", purged);
            }
        }
    })
}

// start sse server
pub async fn start_sse_server(addr: &str, config: ServerConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".to_string().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = App::build(&config).await?;
    let handler = app.handler.clone();
    let ct = SseServer::serve(addr.parse()?)
        .await?
        .with_service(move || handler.clone());
    tracing::info!("SSE server listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    ct.cancel();
    app.shutdown().await;
    Ok(())
}

// start stdio server
pub async fn start_stdio_server(config: ServerConfig) -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting MCP server");

    let app = App::build(&config).await?;
    let service = app.handler.clone().serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    service.waiting().await?;
    app.shutdown().await;
    Ok(())
}
