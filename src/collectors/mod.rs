//! Source collectors.
//!
//! A collector turns one [`SourceConfig`] into a batch of raw
//! documents. Implementations are plain values behind the [`Collector`]
//! trait; a registry maps source types to the adapter that handles
//! them. Fetching goes through the shared [`HttpClient`], which in turn
//! asks the per-domain [`rate_limiter::RateLimiter`] for admission.

pub mod http_cache;
pub mod http_client;
pub mod rate_limiter;
pub mod rss;
pub mod web;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::models::{RawDocument, SourceConfig, SourceType};

pub use http_client::HttpClient;
pub use rate_limiter::RateLimiter;

/// Shared dependencies handed to every collector invocation.
pub struct CollectorContext {
    pub http: HttpClient,
    pub cancel: CancelToken,
}

/// A source-type-specific fetch adapter.
///
/// `collect` must be idempotent with respect to source state:
/// re-running against an unchanged source yields documents with
/// identical content hashes.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(
        &self,
        source: &SourceConfig,
        ctx: &CollectorContext,
    ) -> Result<Vec<RawDocument>>;

    /// Version string stamped on produced documents so reprocessing is
    /// identifiable.
    fn version(&self) -> &'static str;

    fn accepts(&self, source_type: SourceType) -> bool;
}

/// Maps source types to their adapter.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in RSS and web adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(rss::RssCollector::new()));
        registry.register(Arc::new(web::WebCollector::new()));
        registry
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.push(collector);
    }

    /// First registered collector accepting the type.
    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn Collector>> {
        self.collectors
            .iter()
            .find(|c| c.accepts(source_type))
            .cloned()
    }
}

/// Parse a date string in the formats sources actually emit: RFC 3339,
/// RFC 2822, numeric epoch (seconds or milliseconds), and a handful of
/// locale-common patterns. Naive timestamps are assumed UTC.
pub(crate) fn parse_date_flexible(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(epoch) = value.parse::<i64>() {
        // Heuristic split between seconds and milliseconds.
        let (secs, millis) = if epoch.abs() >= 100_000_000_000 {
            (epoch / 1000, (epoch % 1000) as u32)
        } else {
            (epoch, 0)
        };
        if let Some(dt) = Utc.timestamp_opt(secs, millis * 1_000_000).single() {
            return Some(dt);
        }
    }

    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
        "%d.%m.%Y %H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%B %d, %Y", "%d %b %Y"];
    for format in DATE_FORMATS {
        if let Ok(naive) = NaiveDate::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive.and_hms_opt(0, 0, 0)?));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_dispatch() {
        let registry = CollectorRegistry::with_defaults();
        assert_eq!(registry.get(SourceType::Rss).unwrap().version(), "rss/2");
        assert_eq!(registry.get(SourceType::Web).unwrap().version(), "web/2");
    }

    #[test]
    fn test_parse_date_rfc3339() {
        let dt = parse_date_flexible("2026-03-01T12:30:00Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-03-01T12:30:00+00:00");
    }

    #[test]
    fn test_parse_date_rfc2822() {
        assert!(parse_date_flexible("Sun, 01 Mar 2026 12:30:00 GMT").is_some());
    }

    #[test]
    fn test_parse_date_epoch() {
        let secs = parse_date_flexible("1767225600").unwrap();
        let millis = parse_date_flexible("1767225600000").unwrap();
        assert_eq!(secs, millis);
    }

    #[test]
    fn test_parse_date_common_patterns() {
        assert!(parse_date_flexible("2026-03-01 08:15:00").is_some());
        assert!(parse_date_flexible("2026-03-01").is_some());
        assert!(parse_date_flexible("March 1, 2026").is_some());
    }

    #[test]
    fn test_parse_date_garbage() {
        assert!(parse_date_flexible("yesterday-ish").is_none());
        assert!(parse_date_flexible("").is_none());
    }
}
