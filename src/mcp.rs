//! MCP surface of the documentation server.
//!
//! [`DocsHandler`] turns `fetch_document` tool calls into cache keys, resolves
//! them through the [`RequestCoordinator`] and renders either the
//! documentation or a structured error payload. It holds no state of its own.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use docsrs_cache_mcp::cache::CacheStore;
//! use docsrs_cache_mcp::config::ServerConfig;
//! use docsrs_cache_mcp::coordinator::RequestCoordinator;
//! use docsrs_cache_mcp::docs_parser::DocsRsClient;
//! use docsrs_cache_mcp::mcp::DocsHandler;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let cache = Arc::new(CacheStore::open(&config).await);
//!     let fetcher = Arc::new(DocsRsClient::new(&config)?);
//!     let coordinator = RequestCoordinator::new(cache, fetcher, config.request_timeout());
//!     let handler = DocsHandler::new(Arc::new(coordinator));
//!     Ok(())
//! }
//! ```

use std::fmt::Write as _;
use std::sync::Arc;

use itertools::Itertools;
use rmcp::model::{CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities};
use rmcp::{Error as McpError, ServerHandler, model::ServerInfo, schemars, tool};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::coordinator::RequestCoordinator;
use crate::docs_parser::DocumentationRecord;
use crate::error::DocError;
use crate::key::CacheKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchDocumentParams {
    #[serde(alias = "crate_name")]
    #[schemars(description = "name of crate, e.g. serde")]
    pub package: String,

    #[serde(default)]
    #[schemars(description = "version of crate, e.g. 1.0.0. If not specified, the latest version will be used.")]
    pub version: Option<String>,

    #[serde(default, alias = "path", alias = "item_path")]
    #[schemars(description = "item to document, either a path such as 'sync::Mutex' or a docs.rs page such as 'tokio/time/fn.sleep.html'. If not specified, the crate root is returned.")]
    pub item_path: Option<String>,

    #[serde(default)]
    #[schemars(description = "output format: markdown (default), text or json")]
    pub format: Option<OutputFormat>,
}

#[derive(Clone)]
pub struct DocsHandler {
    coordinator: Arc<RequestCoordinator>,
}

#[tool(tool_box)]
impl DocsHandler {
    pub fn new(coordinator: Arc<RequestCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Resolves one tool call into a success or error result. Failures are
    /// reported inside the result and never abort the session.
    pub async fn handle(&self, params: FetchDocumentParams) -> CallToolResult {
        let key = match CacheKey::new(
            &params.package,
            params.version.as_deref(),
            params.item_path.as_deref(),
        ) {
            Ok(key) => key,
            Err(err) => return error_result(&err),
        };

        match self.coordinator.resolve(&key).await {
            Ok(record) => CallToolResult::success(vec![Content::text(render(
                &record,
                params.format.unwrap_or_default(),
            ))]),
            Err(err) => {
                tracing::warn!("Lookup for {} failed: {}", key, err);
                error_result(&err)
            }
        }
    }

    #[tool(description = "Fetch Rust documentation for a crate or one of its items from docs.rs")]
    async fn fetch_document(
        &self,
        #[tool(aggr)] params: FetchDocumentParams,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.handle(params).await)
    }

    #[tool(description = "Report documentation cache counters")]
    async fn cache_stats(&self) -> Result<CallToolResult, McpError> {
        let stats = self.coordinator.cache().stats().await;
        Ok(CallToolResult::success(vec![Content::text(json!(stats).to_string())]))
    }
}

#[tool(tool_box)]
impl ServerHandler for DocsHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server provides access to Rust documentation from docs.rs. \
                Use the 'fetch_document' tool with a package name, an optional version \
                and an optional item path such as 'sync::Mutex'. \
                Results are cached for a bounded time.".to_string()
            ),
        }
    }
}

/// Protocol-level error payload: `{"error": {"kind": ..., "message": ...}}`.
pub fn error_payload(err: &DocError) -> serde_json::Value {
    json!({
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
        }
    })
}

fn error_result(err: &DocError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(error_payload(err).to_string())])
}

pub fn render(record: &DocumentationRecord, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(record).unwrap_or_else(|e| {
            let err = DocError::ParseError(format!("cannot serialize record: {e}"));
            error_payload(&err).to_string()
        }),
        OutputFormat::Text => format!(
            "{} ({} {})\n\n{}",
            record.title, record.package.name, record.package.version, record.content
        ),
        OutputFormat::Markdown => render_markdown(record),
    }
}

fn render_markdown(record: &DocumentationRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", record.title);
    let _ = writeln!(out, "Package: `{}` {}", record.package.name, record.package.version);
    if let Some(summary) = &record.package.description {
        let _ = writeln!(out, "Summary: {summary}");
    }
    let _ = writeln!(out, "Source: <{}>\n", record.source_url);

    if let Some(signature) = &record.signature {
        let _ = writeln!(out, "```rust\n{signature}\n```\n");
    }
    if let Some(description) = &record.description {
        let _ = writeln!(out, "{description}\n");
    }
    let _ = writeln!(out, "## Contents\n\n{}", record.content);

    if !record.cross_references.is_empty() {
        let links = record
            .cross_references
            .iter()
            .map(|r| format!("- [{}]({})", r.label, r.url))
            .join("\n");
        let _ = write!(out, "\n## See also\n\n{links}\n");
    }
    out
}
