//! Rust Documentation MCP Service
//!
//! This crate provides a Model Context Protocol (MCP) service for fetching and
//! caching Rust documentation from docs.rs, so tool-calling agents can look up
//! library APIs on demand.
//!
//! # Features
//!
//! - Fetch documentation pages from docs.rs and package metadata from crates.io
//! - Resolve "latest" to the newest stable release
//! - TTL-bounded, entry-count-bounded LRU cache with optional SQLite backing
//! - At most one upstream fetch per documentation page at any time
//!
//! # Modules
//!
//! - [`cache`]: TTL + LRU cache store
//! - [`storage`]: durable single-file backing for the cache
//! - [`coordinator`]: deduplication of concurrent lookups
//! - [`docs_parser`]: interface with docs.rs and documentation parsing
//! - [`mcp`]: MCP tool handler and response rendering
//! - [`server`]: SSE and stdio transports

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod docs_parser;
pub mod error;
pub mod key;
pub mod mcp;
pub mod server;
pub mod storage;

pub use cache::{Cache, CacheEntry, CacheStore};
pub use config::{ServerConfig, StorageMode};
pub use coordinator::RequestCoordinator;
pub use docs_parser::{DocFetcher, DocsRsClient, DocumentationRecord};
pub use error::{DocError, ErrorKind};
pub use key::CacheKey;
pub use mcp::DocsHandler;
