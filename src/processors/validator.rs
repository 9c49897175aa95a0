//! Multi-level document validation.
//!
//! A document is accepted iff validation produces no error-level
//! findings. Warnings and infos ride along as diagnostics. Custom
//! rules are pure functions registered by the embedder.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{RawDocument, SourceType};

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Error,
    Warning,
    Info,
}

/// One validation diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub level: Level,
    pub code: String,
    pub message: String,
}

impl Finding {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn info(code: &str, message: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn default_min_content() -> usize {
    50
}
fn default_max_content() -> usize {
    500_000
}
fn default_max_future_days() -> i64 {
    2
}

/// Validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_min_content")]
    pub min_content_length: usize,
    #[serde(default = "default_max_content")]
    pub max_content_length: usize,
    /// How far ahead of now a publish date may plausibly be.
    #[serde(default = "default_max_future_days")]
    pub max_future_days: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_content_length: default_min_content(),
            max_content_length: default_max_content(),
            max_future_days: default_max_future_days(),
        }
    }
}

/// A custom rule: pure function of the document and its canonical text.
pub type Rule = Box<dyn Fn(&RawDocument, &str) -> Vec<Finding> + Send + Sync>;

/// Structural and content checks over a raw document plus its
/// normalized content.
pub struct Validator {
    config: ValidatorConfig,
    custom_rules: Vec<Rule>,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            custom_rules: Vec::new(),
        }
    }

    /// Register an additional rule.
    pub fn add_rule(&mut self, rule: Rule) {
        self.custom_rules.push(rule);
    }

    /// Run every rule; the findings list is the full diagnosis.
    pub fn validate(&self, doc: &RawDocument, content: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        if doc.title.trim().is_empty() {
            findings.push(Finding::error("empty_title", "document has no title"));
        }

        let length = content.chars().count();
        if length < self.config.min_content_length {
            findings.push(Finding::error(
                "content_too_short",
                format!(
                    "content length {length} below minimum {}",
                    self.config.min_content_length
                ),
            ));
        } else if length > self.config.max_content_length {
            findings.push(Finding::error(
                "content_too_long",
                format!(
                    "content length {length} above maximum {}",
                    self.config.max_content_length
                ),
            ));
        }

        if url::Url::parse(&doc.source_url).is_err() {
            findings.push(Finding::error(
                "bad_url",
                format!("source_url is not a valid URL: {}", doc.source_url),
            ));
        }

        if let Some(published) = doc.published_at {
            let horizon = Utc::now() + Duration::days(self.config.max_future_days);
            if published > horizon {
                findings.push(Finding::error(
                    "future_date",
                    format!("published_at {published} is in the far future"),
                ));
            }
        } else {
            findings.push(Finding::info("no_publish_date", "publish date unknown"));
        }

        // Required metadata per source type.
        match doc.source_type {
            SourceType::Rss => {
                if !doc.raw_metadata.contains_key("entry_id") {
                    findings.push(Finding::error(
                        "missing_metadata",
                        "rss document missing entry_id",
                    ));
                }
            }
            SourceType::Web => {}
        }

        for rule in &self.custom_rules {
            findings.extend(rule(doc, content));
        }

        findings
    }

    /// Accepted iff no error-level finding.
    pub fn is_accepted(findings: &[Finding]) -> bool {
        findings.iter().all(|f| f.level != Level::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> RawDocument {
        let mut doc = RawDocument::new(
            "src",
            "https://x.test/post",
            SourceType::Rss,
            "rss/2",
            "A Title",
            "body",
        );
        doc.raw_metadata.insert("entry_id".into(), json!("e1"));
        doc.published_at = Some(Utc::now() - Duration::hours(1));
        doc
    }

    fn content(len: usize) -> String {
        "x".repeat(len)
    }

    #[test]
    fn test_valid_document_accepted() {
        let validator = Validator::new(ValidatorConfig::default());
        let findings = validator.validate(&doc(), &content(100));
        assert!(Validator::is_accepted(&findings), "{findings:?}");
    }

    #[test]
    fn test_empty_title_rejected() {
        let validator = Validator::new(ValidatorConfig::default());
        let mut d = doc();
        d.title = "   ".into();
        let findings = validator.validate(&d, &content(100));
        assert!(!Validator::is_accepted(&findings));
        assert!(findings.iter().any(|f| f.code == "empty_title"));
    }

    #[test]
    fn test_content_length_bounds() {
        let validator = Validator::new(ValidatorConfig {
            min_content_length: 10,
            max_content_length: 20,
            ..ValidatorConfig::default()
        });
        assert!(!Validator::is_accepted(
            &validator.validate(&doc(), &content(5))
        ));
        assert!(Validator::is_accepted(
            &validator.validate(&doc(), &content(15))
        ));
        assert!(!Validator::is_accepted(
            &validator.validate(&doc(), &content(25))
        ));
    }

    #[test]
    fn test_far_future_date_rejected() {
        let validator = Validator::new(ValidatorConfig::default());
        let mut d = doc();
        d.published_at = Some(Utc::now() + Duration::days(30));
        let findings = validator.validate(&d, &content(100));
        assert!(findings.iter().any(|f| f.code == "future_date"));
    }

    #[test]
    fn test_missing_date_is_only_info() {
        let validator = Validator::new(ValidatorConfig::default());
        let mut d = doc();
        d.published_at = None;
        let findings = validator.validate(&d, &content(100));
        assert!(Validator::is_accepted(&findings));
        assert!(findings.iter().any(|f| f.code == "no_publish_date"));
    }

    #[test]
    fn test_rss_requires_entry_id() {
        let validator = Validator::new(ValidatorConfig::default());
        let mut d = doc();
        d.raw_metadata.remove("entry_id");
        let findings = validator.validate(&d, &content(100));
        assert!(findings.iter().any(|f| f.code == "missing_metadata"));
    }

    #[test]
    fn test_custom_rule_runs() {
        let mut validator = Validator::new(ValidatorConfig::default());
        validator.add_rule(Box::new(|doc, _content| {
            if doc.title.contains("SPAM") {
                vec![Finding::error("spam_title", "title looks like spam")]
            } else {
                vec![]
            }
        }));
        let mut d = doc();
        d.title = "SPAM OFFER".into();
        let findings = validator.validate(&d, &content(100));
        assert!(findings.iter().any(|f| f.code == "spam_title"));
    }
}
