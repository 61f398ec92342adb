use std::sync::Arc;
use std::time::Duration;

use docsrs_cache_mcp::cache::{Cache, CacheStore};
use docsrs_cache_mcp::clock::ManualClock;
use docsrs_cache_mcp::config::{ServerConfig, StorageMode};
use docsrs_cache_mcp::coordinator::RequestCoordinator;
use docsrs_cache_mcp::docs_parser::DocsRsClient;
use docsrs_cache_mcp::error::DocError;
use docsrs_cache_mcp::key::CacheKey;
use docsrs_cache_mcp::mcp::DocsHandler;
use docsrs_cache_mcp::server::App;
use mockito::{Mock, Server, ServerGuard};
use serde_json::json;
use tempfile::tempdir;

fn page(name: &str) -> String {
    format!(
        r#"<html><body><section id="main-content">
            <h1>Crate {name}</h1>
            <details class="toggle top-doc">
                <div class="docblock"><p>The {name} crate.</p></div>
            </details>
            <a href="struct.Thing.html">Thing</a>
        </section></body></html>"#
    )
}

async fn mock_crate(server: &mut ServerGuard, name: &str, hits: usize) -> (Mock, Mock) {
    let registry = server
        .mock("GET", format!("/api/v1/crates/{name}").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"crate": {
                "name": name,
                "max_version": "1.0.0",
                "max_stable_version": "1.0.0",
                "description": format!("{name} description"),
                "repository": null,
                "homepage": null
            }})
            .to_string(),
        )
        .expect(hits)
        .create_async()
        .await;
    let docs = server
        .mock("GET", format!("/{name}/1.0.0/{name}/index.html").as_str())
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(page(name))
        .expect(hits)
        .create_async()
        .await;
    (registry, docs)
}

fn config_for(server: &ServerGuard) -> ServerConfig {
    ServerConfig {
        docs_base_url: server.url(),
        registry_base_url: server.url(),
        request_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn coordinator(cache: Arc<CacheStore>, config: &ServerConfig) -> RequestCoordinator {
    let fetcher = DocsRsClient::new(config)
        .unwrap()
        .with_retry_backoff(Duration::from_millis(1));
    RequestCoordinator::new(cache, Arc::new(fetcher), config.request_timeout())
}

fn key(name: &str) -> CacheKey {
    CacheKey::new(name, None, None).unwrap()
}

#[tokio::test]
async fn test_capacity_two_evicts_least_recently_used() {
    let mut server = Server::new_async().await;
    let mut mocks = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        mocks.push(mock_crate(&mut server, name, 1).await);
    }
    let config = ServerConfig {
        cache_ttl_ms: 1_000,
        max_cache_entries: 2,
        ..config_for(&server)
    };
    let clock = ManualClock::new(0);
    let cache = Arc::new(CacheStore::in_memory_with_clock(&config, Arc::new(clock)));
    let coordinator = coordinator(cache.clone(), &config);

    for name in ["alpha", "beta", "gamma"] {
        coordinator.resolve(&key(name)).await.unwrap();
    }

    assert_eq!(cache.len().await, 2);
    assert!(!cache.contains_key(&key("alpha")).await);
    assert!(cache.contains_key(&key("beta")).await);
    assert!(cache.contains_key(&key("gamma")).await);
}

#[tokio::test]
async fn test_reading_entry_protects_it_from_eviction() {
    let mut server = Server::new_async().await;
    let mut mocks = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        mocks.push(mock_crate(&mut server, name, 1).await);
    }
    let config = ServerConfig {
        cache_ttl_ms: 1_000,
        max_cache_entries: 2,
        ..config_for(&server)
    };
    let clock = ManualClock::new(0);
    let cache = Arc::new(CacheStore::in_memory_with_clock(&config, Arc::new(clock)));
    let coordinator = coordinator(cache.clone(), &config);

    coordinator.resolve(&key("alpha")).await.unwrap();
    coordinator.resolve(&key("beta")).await.unwrap();
    coordinator.resolve(&key("beta")).await.unwrap();
    coordinator.resolve(&key("gamma")).await.unwrap();

    assert_eq!(cache.keys().await, vec![key("gamma"), key("beta")]);
}

#[tokio::test]
async fn test_concurrent_lookups_fetch_once() {
    let mut server = Server::new_async().await;
    let (registry, docs) = mock_crate(&mut server, "serde", 1).await;
    let config = config_for(&server);
    let cache = Arc::new(CacheStore::in_memory(&config));
    let coordinator = Arc::new(coordinator(cache, &config));

    let lookups: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.resolve(&key("serde")).await })
        })
        .collect();
    for lookup in futures::future::join_all(lookups).await {
        let record = lookup.unwrap().unwrap();
        assert_eq!(record.package.version, "1.0.0");
        assert_eq!(record.description.as_deref(), Some("The serde crate."));
    }

    registry.assert_async().await;
    docs.assert_async().await;
}

#[tokio::test]
async fn test_crate_name_spellings_share_one_fetch() {
    let mut server = Server::new_async().await;
    let (registry, docs) = mock_crate(&mut server, "serde_json", 1).await;
    let config = config_for(&server);
    let cache = Arc::new(CacheStore::in_memory(&config));
    let coordinator = coordinator(cache.clone(), &config);

    let dashed = CacheKey::new("serde-json", None, None).unwrap();
    let underscored = CacheKey::new("Serde_JSON", None, Some("serde_json")).unwrap();
    let (a, b) = tokio::join!(
        coordinator.resolve(&dashed),
        coordinator.resolve(&underscored)
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(cache.len().await, 1);

    registry.assert_async().await;
    docs.assert_async().await;
}

#[tokio::test]
async fn test_upstream_failure_is_not_cached() {
    let mut server = Server::new_async().await;
    let registry = server
        .mock("GET", "/api/v1/crates/serde")
        .with_status(502)
        .expect(4)
        .create_async()
        .await;
    let config = ServerConfig {
        max_fetch_attempts: 2,
        ..config_for(&server)
    };
    let cache = Arc::new(CacheStore::in_memory(&config));
    let coordinator = coordinator(cache.clone(), &config);

    for _ in 0..2 {
        let err = coordinator.resolve(&key("serde")).await.unwrap_err();
        assert!(matches!(err, DocError::UpstreamUnavailable(_)));
        assert_eq!(coordinator.in_flight_count().await, 0);
    }
    assert!(cache.is_empty().await);
    registry.assert_async().await;
}

#[tokio::test]
async fn test_durable_record_survives_restart() {
    let mut server = Server::new_async().await;
    let (registry, docs) = mock_crate(&mut server, "serde", 1).await;
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        storage: StorageMode::Durable(dir.path().join("docs.db")),
        ..config_for(&server)
    };

    let original = {
        let cache = Arc::new(CacheStore::open(&config).await);
        assert!(cache.is_durable());
        coordinator(cache, &config).resolve(&key("serde")).await.unwrap()
    };

    let cache = Arc::new(CacheStore::open(&config).await);
    let restored = coordinator(cache, &config).resolve(&key("serde")).await.unwrap();

    assert_eq!(*restored, *original);
    registry.assert_async().await;
    docs.assert_async().await;
}

#[tokio::test]
async fn test_corrupted_durable_file_starts_in_memory() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("docs.db");
    std::fs::write(&path, vec![0x5a_u8; 4096]).unwrap();
    let config = ServerConfig {
        storage: StorageMode::Durable(path),
        sweep_interval_ms: 0,
        ..Default::default()
    };

    let app = App::build(&config).await.unwrap();
    assert!(!app.cache.is_durable());
    assert!(matches!(app.cache.startup_error(), Some(DocError::CacheCorrupt(_))));
    assert!(app.cache.is_empty().await);
    app.shutdown().await;
}

#[tokio::test]
async fn test_handler_reports_timeout() {
    let mut server = Server::new_async().await;
    let _slow = server
        .mock("GET", "/api/v1/crates/slow")
        .with_chunked_body(|writer| {
            std::thread::sleep(Duration::from_millis(500));
            writer.write_all(b"{}")
        })
        .create_async()
        .await;
    let config = ServerConfig {
        request_timeout_ms: 100,
        ..config_for(&server)
    };
    let cache = Arc::new(CacheStore::in_memory(&config));
    let handler = DocsHandler::new(Arc::new(coordinator(cache, &config)));

    let result = handler
        .handle(serde_json::from_value(json!({"package": "slow"})).unwrap())
        .await;
    assert_eq!(result.is_error, Some(true));
    let payload: serde_json::Value =
        serde_json::from_str(&result.content[0].as_text().unwrap().text).unwrap();
    assert_eq!(payload["error"]["kind"], "Timeout");
}

#[tokio::test]
async fn test_sse_server() {
    use rmcp::model::{CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation};
    use rmcp::transport::SseTransport;
    use rmcp::transport::sse_server::SseServer;
    use rmcp::ServiceExt;

    let mut upstream = Server::new_async().await;
    let _mocks = mock_crate(&mut upstream, "rand", 1).await;
    let config = ServerConfig {
        sweep_interval_ms: 0,
        ..config_for(&upstream)
    };
    let app = App::build(&config).await.unwrap();

    // SseServer does not report its bound address, so pick a free port first.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let handler = app.handler.clone();
    let ct = SseServer::serve(addr)
        .await
        .unwrap()
        .with_service(move || handler.clone());

    let transport = SseTransport::start(&format!("http://{}/sse", addr))
        .await
        .unwrap();
    let client_info = ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "test sse client".to_string(),
            version: "0.0.1".to_string(),
        },
    };
    let client = client_info.serve(transport).await.unwrap();

    let result = client
        .call_tool(CallToolRequestParam {
            name: "fetch_document".into(),
            arguments: json!({"crate_name": "rand"}).as_object().cloned(),
        })
        .await
        .unwrap();

    ct.cancel();
    app.shutdown().await;

    assert!(!result.content.is_empty());
    assert!(result
        .content
        .iter()
        .any(|c| c.as_text().unwrap().text.contains("The rand crate.")));
}
