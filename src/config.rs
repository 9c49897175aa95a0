//! Frozen configuration for the collection and processing core.
//!
//! The embedder (CLI, service wrapper) is responsible for discovering
//! and loading configuration files; the core receives one immutable
//! [`AtlasConfig`] value at startup and never reloads it mid-run.
//! The YAML source-list format is the only file format the core parses
//! itself, via [`crate::models::source::parse_source_list`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::collectors::http_client::HttpConfig;
use crate::collectors::rate_limiter::RatePolicy;
use crate::error::Result;
use crate::llm::client::LlmConfig;
use crate::llm::controller::ControllerConfig;
use crate::models::SourceConfig;
use crate::processors::dedup::DedupConfig;
use crate::processors::validator::ValidatorConfig;
use crate::scheduler::queue::QueueConfig;

const DEFAULT_USER_AGENT: &str = "Atlas/0.3 (personal aggregation)";

/// Real browser user agents for the `impersonate` alias.
const IMPERSONATE_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
];

/// Top-level immutable configuration value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasConfig {
    /// Base data directory; state files default to paths under it.
    pub data_dir: PathBuf,
    /// StatusManager snapshot file.
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    /// Optional persisted cron job registry.
    #[serde(default)]
    pub cron_file: Option<PathBuf>,
    /// Named user-agent registry; sources reference entries by key.
    #[serde(default)]
    pub user_agents: HashMap<String, String>,
    #[serde(default)]
    pub http: HttpConfig,
    /// Default per-domain admission policy.
    #[serde(default)]
    pub rate_limit: RatePolicy,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlas-data"),
            status_file: None,
            cron_file: None,
            user_agents: HashMap::new(),
            http: HttpConfig::default(),
            rate_limit: RatePolicy::default(),
            dedup: DedupConfig::default(),
            validator: ValidatorConfig::default(),
            queue: QueueConfig::default(),
            llm: LlmConfig::default(),
            controller: ControllerConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl AtlasConfig {
    /// Validate the whole configuration; any failure is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.name.as_str()) {
                return Err(crate::error::AtlasError::config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }
        Ok(())
    }

    /// Effective StatusManager snapshot path.
    pub fn status_path(&self) -> PathBuf {
        self.status_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("task_status.json"))
    }

    /// Effective HTTP cache directory.
    pub fn http_cache_dir(&self) -> PathBuf {
        self.http
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("http_cache"))
    }

    /// Resolve a source's user-agent reference.
    ///
    /// `None` yields the default agent; `impersonate` picks a browser
    /// agent; a registry key resolves through the registry; anything
    /// else is treated as a literal string.
    pub fn resolve_user_agent(&self, reference: Option<&str>) -> String {
        match reference {
            None => DEFAULT_USER_AGENT.to_string(),
            Some("impersonate") => {
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as usize)
                    .unwrap_or(0);
                IMPERSONATE_USER_AGENTS[nanos % IMPERSONATE_USER_AGENTS.len()].to_string()
            }
            Some(key) => self
                .user_agents
                .get(key)
                .cloned()
                .unwrap_or_else(|| key.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_user_agent_default() {
        let config = AtlasConfig::default();
        assert!(config.resolve_user_agent(None).contains("Atlas"));
    }

    #[test]
    fn test_resolve_user_agent_impersonate() {
        let config = AtlasConfig::default();
        let ua = config.resolve_user_agent(Some("impersonate"));
        assert!(ua.contains("Mozilla"));
        assert!(!ua.contains("Atlas"));
    }

    #[test]
    fn test_resolve_user_agent_registry_and_literal() {
        let mut config = AtlasConfig::default();
        config
            .user_agents
            .insert("bot".to_string(), "MyBot/2.0".to_string());
        assert_eq!(config.resolve_user_agent(Some("bot")), "MyBot/2.0");
        assert_eq!(config.resolve_user_agent(Some("Custom/1.0")), "Custom/1.0");
    }

    #[test]
    fn test_default_paths_derived_from_data_dir() {
        let config = AtlasConfig::default();
        assert!(config.status_path().ends_with("task_status.json"));
        assert!(config.http_cache_dir().ends_with("http_cache"));
    }

    #[test]
    fn test_duplicate_sources_fatal() {
        let mut config = AtlasConfig::default();
        let yaml = r#"
sources:
  - {name: a, type: rss, url: "https://x.test/feed"}
"#;
        let sources = crate::models::source::parse_source_list(yaml).unwrap();
        config.sources = sources.clone();
        config.sources.extend(sources);
        assert!(config.validate().is_err());
    }
}
