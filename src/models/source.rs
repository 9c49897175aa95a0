//! Source configuration.
//!
//! A source describes one upstream feed or page. The configuration is
//! read-only to every component after load; it changes only between
//! collection runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// Kind of upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Rss,
    Web,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Rss => write!(f, "rss"),
            SourceType::Web => write!(f, "web"),
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_interval() -> u64 {
    3600
}
fn default_max_items() -> usize {
    100
}
fn default_retry_count() -> u32 {
    3
}
fn default_timeout() -> u64 {
    30
}

/// Configuration for a single source.
///
/// `name` is the unique key; `selectors` maps a field name (`title`,
/// `content`, `date`, `author`) to an ordered fallback chain of CSS
/// selectors and is only meaningful for web sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Collection interval in seconds, minimum 60.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub selectors: HashMap<String, Vec<String>>,
    /// Key into the user-agent registry, or a literal UA string.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items_per_run: usize,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl SourceConfig {
    /// Validate invariants that make a source usable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AtlasError::config("source name must not be empty"));
        }
        if self.url.trim().is_empty() {
            return Err(AtlasError::config(format!(
                "source '{}' has no url",
                self.name
            )));
        }
        url::Url::parse(&self.url)
            .map_err(|e| AtlasError::config(format!("source '{}': invalid url: {e}", self.name)))?;
        if self.interval < 60 {
            return Err(AtlasError::config(format!(
                "source '{}': interval {}s is below the 60s minimum",
                self.name, self.interval
            )));
        }
        Ok(())
    }

    /// Domain of the source URL, used as the rate-limit key.
    pub fn domain(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    /// Selector fallback chain for a field, empty if none configured.
    pub fn selector_chain(&self, field: &str) -> &[String] {
        self.selectors.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Parse a YAML source list: a top-level `sources:` sequence.
///
/// Duplicate names and per-source invariant violations are fatal.
pub fn parse_source_list(yaml: &str) -> Result<Vec<SourceConfig>> {
    #[derive(Deserialize)]
    struct SourceFile {
        sources: Vec<SourceConfig>,
    }

    let file: SourceFile = serde_yaml::from_str(yaml)?;
    let mut seen = std::collections::HashSet::new();
    for source in &file.sources {
        source.validate()?;
        if !seen.insert(source.name.clone()) {
            return Err(AtlasError::config(format!(
                "duplicate source name '{}'",
                source.name
            )));
        }
    }
    Ok(file.sources)
}
