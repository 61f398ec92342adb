use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use reqwest::{Client, Response, StatusCode, header::ACCEPT};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ServerConfig;
use crate::error::DocError;
use crate::key::CacheKey;

const MAX_CROSS_REFERENCES: usize = 200;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Package metadata as reported by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    /// Concrete version the documentation was rendered from.
    pub version: String,
    pub description: Option<String>,
    pub repository: Option<String>,
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrossReference {
    pub label: String,
    pub url: String,
}

/// Canonical parsed documentation page. Opaque to the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentationRecord {
    pub package: PackageInfo,
    pub item_path: String,
    pub title: String,
    pub signature: Option<String>,
    pub description: Option<String>,
    pub content: String,
    pub cross_references: Vec<CrossReference>,
    pub source_url: String,
}

impl DocumentationRecord {
    /// Approximate in-memory footprint in bytes.
    pub fn size_hint(&self) -> usize {
        self.content.len()
            + self.title.len()
            + self.signature.as_ref().map_or(0, String::len)
            + self.description.as_ref().map_or(0, String::len)
            + self
                .cross_references
                .iter()
                .map(|r| r.label.len() + r.url.len())
                .sum::<usize>()
    }
}

/// Source of documentation records for cache misses.
#[async_trait]
pub trait DocFetcher: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> Result<DocumentationRecord, DocError>;
}

#[derive(Debug, Deserialize)]
struct CrateResponse {
    #[serde(rename = "crate")]
    krate: CrateData,
}

#[derive(Debug, Deserialize)]
struct CrateData {
    name: String,
    max_version: String,
    max_stable_version: Option<String>,
    description: Option<String>,
    repository: Option<String>,
    homepage: Option<String>,
}

impl CrateData {
    fn latest_version(&self) -> &str {
        self.max_stable_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.max_version)
    }
}

/// Parts of a rustdoc page extracted by [`parse_rustdoc_page`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub signature: Option<String>,
    pub description: Option<String>,
    pub content: String,
    pub cross_references: Vec<CrossReference>,
}

/// Fetches documentation pages from docs.rs and package metadata from the
/// crates.io registry API.
#[derive(Debug, Clone)]
pub struct DocsRsClient {
    client: Client,
    docs_base: Url,
    registry_base: Url,
    max_attempts: u32,
    retry_backoff: Duration,
    timeout_ms: u64,
}

impl DocsRsClient {
    pub fn new(config: &ServerConfig) -> Result<Self, DocError> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                DocError::UpstreamUnavailable(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            docs_base: Url::parse(&config.docs_base_url)?,
            registry_base: Url::parse(&config.registry_base_url)?,
            max_attempts: config.max_fetch_attempts.max(1),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            timeout_ms: config.request_timeout_ms,
        })
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Looks up package metadata; the returned version is the registry's
    /// latest stable release.
    pub async fn fetch_package_info(&self, package: &str) -> Result<PackageInfo, DocError> {
        let url = join_segments(&self.registry_base, ["api", "v1", "crates", package])?;
        let response = self.get_with_retry(url, "application/json").await?;
        let body = self.read_body(response).await?;
        let parsed: CrateResponse = serde_json::from_str(&body).map_err(|e| {
            DocError::ParseError(format!(
                "unexpected registry response for '{package}': {e}"
            ))
        })?;

        let krate = parsed.krate;
        Ok(PackageInfo {
            version: krate.latest_version().to_string(),
            name: krate.name,
            description: krate.description.map(|d| d.trim().to_string()),
            repository: krate.repository,
            homepage: krate.homepage,
        })
    }

    /// Maps the key's item path onto a docs.rs page path below `{crate}/{version}/`.
    async fn resolve_page_path(
        &self,
        key: &CacheKey,
        crate_name: &str,
        version: &str,
    ) -> Result<String, DocError> {
        // Rustdoc directory of the crate; the registry name may use dashes.
        let ident = crate_name.replace('-', "_");
        let item = key.item_path();

        if item.is_empty() {
            return Ok(format!("{ident}/index.html"));
        }
        if item.ends_with(".html") || item.ends_with('/') {
            return Ok(item.to_string());
        }

        let index_url = join_segments(
            &self.docs_base,
            [crate_name, version, ident.as_str(), "all.html"],
        )?;
        let response = self.get_with_retry(index_url, "text/html").await?;
        let html = self.read_body(response).await?;
        if let Some(href) = find_item_in_index(&html, item)? {
            return Ok(format!("{ident}/{href}"));
        }

        // all.html does not list modules; fall back to the module index page.
        Ok(format!("{ident}/{}/index.html", item.split("::").join("/")))
    }

    async fn get_with_retry(&self, url: Url, accept: &str) -> Result<Response, DocError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.client.get(url.clone()).header(ACCEPT, accept).send().await;

            let transient = match &outcome {
                Ok(response) => is_transient_status(response.status()),
                Err(e) => !e.is_timeout() && (e.is_connect() || e.is_request()),
            };
            if !transient || attempt >= self.max_attempts {
                return self.classify(outcome, &url);
            }

            let delay = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
            tracing::warn!(%url, attempt, ?delay, "Transient upstream failure, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    fn classify(
        &self,
        outcome: Result<Response, reqwest::Error>,
        url: &Url,
    ) -> Result<Response, DocError> {
        match outcome {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response)
                if matches!(
                    response.status(),
                    StatusCode::NOT_FOUND | StatusCode::GONE
                ) =>
            {
                Err(DocError::NotFound(url.to_string()))
            }
            Ok(response) => Err(DocError::UpstreamUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            ))),
            Err(e) if e.is_timeout() => Err(DocError::Timeout(self.timeout_ms)),
            Err(e) => Err(DocError::UpstreamUnavailable(format!("{url}: {e}"))),
        }
    }

    async fn read_body(&self, response: Response) -> Result<String, DocError> {
        let url = response.url().clone();
        response.text().await.map_err(|e| {
            if e.is_timeout() {
                DocError::Timeout(self.timeout_ms)
            } else {
                DocError::UpstreamUnavailable(format!("{url}: {e}"))
            }
        })
    }
}

#[async_trait]
impl DocFetcher for DocsRsClient {
    async fn fetch(&self, key: &CacheKey) -> Result<DocumentationRecord, DocError> {
        let mut package = self.fetch_package_info(key.package()).await?;
        let version = if key.is_latest() {
            package.version.clone()
        } else {
            key.version().to_string()
        };

        let page_path = self.resolve_page_path(key, &package.name, &version).await?;
        let mut url = join_segments(&self.docs_base, [package.name.as_str(), version.as_str()])?;
        extend_path(&mut url, page_path.split('/'))?;

        tracing::info!("Fetching documentation from: {}", url);
        let response = self.get_with_retry(url, "text/html").await?;
        let final_url = response.url().clone();
        let html = self.read_body(response).await?;

        // docs.rs redirects semver requirements to the concrete release.
        package.version = version_from_url(&final_url).unwrap_or(version);

        let page = parse_rustdoc_page(&html, &final_url)?;
        Ok(DocumentationRecord {
            title: page.title.unwrap_or_else(|| {
                format!("{} {}", package.name, key.item_path())
                    .trim()
                    .to_string()
            }),
            package,
            item_path: key.item_path().to_string(),
            signature: page.signature,
            description: page.description,
            content: page.content,
            cross_references: page.cross_references,
            source_url: final_url.to_string(),
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
    )
}

fn join_segments<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, DocError> {
    let mut url = base.clone();
    extend_path(&mut url, segments)?;
    Ok(url)
}

fn extend_path<'a>(
    url: &mut Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<(), DocError> {
    if url.cannot_be_a_base() {
        return Err(DocError::InvalidKey(format!("'{url}' cannot be a base URL")));
    }
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    Ok(())
}

/// Concrete version from a docs.rs page URL (`/{crate}/{version}/...`).
fn version_from_url(url: &Url) -> Option<String> {
    let version = url.path_segments()?.nth(1)?;
    version
        .starts_with(|c: char| c.is_ascii_digit())
        .then(|| version.to_string())
}

fn selector(css: &str) -> Result<Selector, DocError> {
    Selector::parse(css).map_err(|e| DocError::ParseError(format!("invalid selector '{css}': {e}")))
}

/// Element text with runs of whitespace collapsed. Text nodes are joined as
/// written so inline markup inside code (`Vec<T>`, `a::b`) stays intact.
fn collapsed_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().split_whitespace().join(" ")
}

/// Finds the relative page link of `item` (e.g. `time::sleep`) in a
/// rustdoc `all.html` item index.
pub fn find_item_in_index(html: &str, item: &str) -> Result<Option<String>, DocError> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;
    Ok(document
        .select(&links)
        .find(|a| collapsed_text(*a) == item)
        .and_then(|a| a.value().attr("href"))
        .map(|href| href.trim_start_matches("./").to_string()))
}

/// Extracts title, signature, description, cross-references and body text
/// from a rendered rustdoc page.
pub fn parse_rustdoc_page(html: &str, page_url: &Url) -> Result<ParsedPage, DocError> {
    let document = Html::parse_document(html);

    let container_selector = selector("#main-content, #rustdoc_body_wrapper")?;
    let container = document.select(&container_selector).next().ok_or_else(|| {
        DocError::ParseError(format!("{page_url} has no rustdoc content container"))
    })?;

    let title = container
        .select(&selector("h1")?)
        .next()
        .map(|h1| collapsed_text(h1).trim_end_matches("Copy item path").trim().to_string())
        .filter(|t| !t.is_empty());

    let signature = container
        .select(&selector("pre.item-decl, .item-decl pre, pre.rust.fn")?)
        .next()
        .map(|pre| pre.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    let description = container
        .select(&selector("details.top-doc .docblock, .docblock")?)
        .next()
        .map(collapsed_text)
        .filter(|d| !d.is_empty());

    let mut seen = HashSet::new();
    let cross_references = container
        .select(&selector("a[href]")?)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            if href.starts_with('#') || href.starts_with("javascript:") {
                return None;
            }
            let mut target = page_url.join(href).ok()?;
            target.set_fragment(None);
            let is_doc_page = target.path().ends_with(".html") || target.path().ends_with('/');
            if target.host_str() != page_url.host_str()
                || !is_doc_page
                || target.path().contains("/src/")
            {
                return None;
            }
            let label = collapsed_text(a);
            if label.is_empty() || target == *page_url || !seen.insert(target.to_string()) {
                return None;
            }
            Some(CrossReference {
                label,
                url: target.to_string(),
            })
        })
        .take(MAX_CROSS_REFERENCES)
        .collect();

    Ok(ParsedPage {
        title,
        signature,
        description,
        content: collapsed_text(container),
        cross_references,
    })
}
