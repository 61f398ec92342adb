use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DocError;

/// Version requirement substituted when the caller gives none.
pub const LATEST: &str = "latest";

const MAX_PACKAGE_LEN: usize = 64;
const MAX_VERSION_LEN: usize = 64;
const MAX_PATH_LEN: usize = 256;

/// Normalized identity of a documentation lookup.
///
/// Two requests naming the same page produce equal keys. The package name is
/// case-folded with `-` folded into `_`, as the registry treats both spellings
/// as one crate. A missing or wildcard version becomes [`LATEST`]. Leading
/// separators and a redundant `{crate}::` prefix are stripped from the item path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    package: String,
    version: String,
    item_path: String,
}

impl CacheKey {
    pub fn new(
        package: &str,
        version: Option<&str>,
        item_path: Option<&str>,
    ) -> Result<Self, DocError> {
        let package = normalize_package(package)?;
        let item_path = normalize_path(&package, item_path.unwrap_or_default())?;
        Ok(Self {
            package,
            version: normalize_version(version.unwrap_or_default())?,
            item_path,
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn item_path(&self) -> &str {
        &self.item_path
    }

    pub fn is_latest(&self) -> bool {
        self.version == LATEST
    }

    /// Flat string form used as the durable store's primary key.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package, self.version)?;
        if !self.item_path.is_empty() {
            write!(f, "::{}", self.item_path)?;
        }
        Ok(())
    }
}

fn normalize_package(raw: &str) -> Result<String, DocError> {
    let name = raw.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(DocError::InvalidKey("package name is empty".to_string()));
    }
    if name.len() > MAX_PACKAGE_LEN {
        return Err(DocError::InvalidKey(format!(
            "package name longer than {MAX_PACKAGE_LEN} characters"
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(DocError::InvalidKey(format!(
            "package name '{name}' must start with a letter"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(DocError::InvalidKey(format!(
            "package name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(name.replace('-', "_"))
}

fn normalize_version(raw: &str) -> Result<String, DocError> {
    let version = raw.trim();
    if version.is_empty() || version == "*" || version.eq_ignore_ascii_case(LATEST) {
        return Ok(LATEST.to_string());
    }
    if version.len() > MAX_VERSION_LEN {
        return Err(DocError::InvalidKey(format!(
            "version longer than {MAX_VERSION_LEN} characters"
        )));
    }
    let allowed = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '^' | '~' | '=' | '*')
    };
    if let Some(bad) = version.chars().find(|c| !allowed(*c)) {
        return Err(DocError::InvalidKey(format!(
            "version '{version}' contains invalid character '{bad}'"
        )));
    }
    Ok(version.to_string())
}

/// `package` must already be normalized; it doubles as the crate identifier.
fn normalize_path(package: &str, raw: &str) -> Result<String, DocError> {
    let path = raw.trim().trim_start_matches('/').trim_start_matches("::");
    if path.len() > MAX_PATH_LEN {
        return Err(DocError::InvalidKey(format!(
            "item path longer than {MAX_PATH_LEN} characters"
        )));
    }
    if path.split(['/', ':']).any(|segment| segment == "..") {
        return Err(DocError::InvalidKey(format!(
            "item path '{path}' escapes the crate"
        )));
    }
    if let Some(bad) = path
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '?' | '#' | '\\' | '%'))
    {
        return Err(DocError::InvalidKey(format!(
            "item path '{path}' contains invalid character {bad:?}"
        )));
    }
    if path.ends_with(".html") || path.ends_with('/') {
        return Ok(path.to_string());
    }

    let item = path.trim_end_matches("::");
    let item = match item.strip_prefix(package) {
        Some("") => "",
        Some(rest) => rest.strip_prefix("::").unwrap_or(item),
        None => item,
    };
    Ok(item.to_string())
}
