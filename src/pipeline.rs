//! Collection-run composition.
//!
//! One run for one source: collect raw documents, extract and
//! normalize their content, validate, deduplicate, and store. Stage
//! failures follow the pipeline error policy: a fetch or feed parse
//! failure aborts the run, per-document validation and dedup failures
//! mark that document failed and never poison the rest of the batch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::collectors::{CollectorContext, CollectorRegistry, HttpClient};
use crate::error::{AtlasError, Result};
use crate::models::{ProcessedDocument, ProcessingStatus, RawDocument, SourceConfig};
use crate::processors::dedup::Deduplicator;
use crate::processors::normalizer;
use crate::processors::parser::{extract_text, ExtractOptions};
use crate::processors::validator::Validator;
use crate::storage::Storage;

const PROCESSOR_VERSION: &str = "pipeline/2";

/// Per-run counters, one value per source run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    pub source_id: String,
    pub fetched: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// The assembled content pipeline.
pub struct Pipeline {
    registry: CollectorRegistry,
    http: HttpClient,
    storage: Arc<dyn Storage>,
    validator: Validator,
    dedup: tokio::sync::Mutex<Deduplicator>,
    extract_options: ExtractOptions,
}

impl Pipeline {
    pub fn new(
        registry: CollectorRegistry,
        http: HttpClient,
        storage: Arc<dyn Storage>,
        validator: Validator,
        dedup: Deduplicator,
    ) -> Self {
        Self {
            registry,
            http,
            storage,
            validator,
            dedup: tokio::sync::Mutex::new(dedup),
            extract_options: ExtractOptions::default(),
        }
    }

    pub fn with_extract_options(mut self, options: ExtractOptions) -> Self {
        self.extract_options = options;
        self
    }

    /// Warm the dedup index from already-stored documents so groups
    /// persist across process restarts.
    pub async fn warm_dedup_index(&self) -> Result<usize> {
        let existing = self.storage.list_processed().await?;
        let mut dedup = self.dedup.lock().await;
        for doc in &existing {
            dedup.observe_existing(doc);
        }
        Ok(existing.len())
    }

    /// Run one collection cycle for a source.
    pub async fn run_source(
        &self,
        source: &SourceConfig,
        cancel: &CancelToken,
    ) -> Result<CollectionStats> {
        let collector = self
            .registry
            .get(source.source_type)
            .ok_or_else(|| {
                AtlasError::config(format!(
                    "no collector registered for source type '{}'",
                    source.source_type
                ))
            })?;

        let ctx = CollectorContext {
            http: self.http.clone(),
            cancel: cancel.clone(),
        };

        let raw_docs = collector.collect(source, &ctx).await?;
        let mut stats = CollectionStats {
            source_id: source.name.clone(),
            fetched: raw_docs.len(),
            ..CollectionStats::default()
        };

        for mut raw in raw_docs {
            if cancel.is_cancelled() {
                return Err(AtlasError::Cancelled);
            }
            self.storage.put_raw(&raw).await?;
            raw.advance_status(ProcessingStatus::Processing);

            match self.process_one(&mut raw).await {
                Ok(Some(processed)) => {
                    if processed.is_duplicate {
                        stats.duplicates += 1;
                    } else {
                        stats.accepted += 1;
                    }
                    self.storage.put_processed(&processed).await?;
                    raw.advance_status(ProcessingStatus::Processed);
                }
                Ok(None) => {
                    stats.rejected += 1;
                    raw.advance_status(ProcessingStatus::Failed);
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(source = %source.name, doc = %raw.id, error = %e, "document failed");
                    raw.processing_error = Some(e.to_string());
                    raw.advance_status(ProcessingStatus::Failed);
                }
            }
            raw.processing_attempts += 1;
            self.storage.put_raw(&raw).await?;
        }

        info!(
            source = %source.name,
            fetched = stats.fetched,
            accepted = stats.accepted,
            duplicates = stats.duplicates,
            rejected = stats.rejected,
            failed = stats.failed,
            "collection run finished"
        );
        Ok(stats)
    }

    /// Extract, normalize, validate, and dedup a single document.
    ///
    /// `Ok(None)` means validation rejected it (the document is
    /// retained as failed for inspection).
    async fn process_one(&self, raw: &mut RawDocument) -> Result<Option<ProcessedDocument>> {
        let extracted = extract_text(&raw.raw_content, &self.extract_options);
        let normalized = normalizer::normalize(&extracted);
        raw.language = Some(normalized.signals.language.to_string());

        let findings = self.validator.validate(raw, &normalized.text);
        if !Validator::is_accepted(&findings) {
            let summary: Vec<String> = findings
                .iter()
                .filter(|f| f.level == crate::processors::validator::Level::Error)
                .map(|f| f.code.clone())
                .collect();
            raw.processing_error = Some(format!("validation: {}", summary.join(",")));
            return Ok(None);
        }

        let outcome = {
            let mut dedup = self.dedup.lock().await;
            dedup.check(&normalized.text).await?
        };

        let mut processed = ProcessedDocument::from_raw(raw, normalized.text, PROCESSOR_VERSION);
        processed.quality_score = normalized.quality_score;
        if let Some(categories) = raw
            .raw_metadata
            .get("categories")
            .and_then(|v| v.as_array())
        {
            processed.categories = categories
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
        Deduplicator::apply(&outcome, &mut processed);
        Ok(Some(processed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::http_client::HttpConfig;
    use crate::collectors::rate_limiter::{RateLimiter, RatePolicy};
    use crate::processors::dedup::DedupConfig;
    use crate::processors::validator::ValidatorConfig;
    use crate::storage::MemoryStorage;

    // Pipeline stages are covered unit-by-unit in their own modules;
    // the end-to-end path runs in tests/pipeline.rs against canned
    // collector output.

    #[tokio::test]
    async fn test_unknown_source_type_is_config_error() {
        let registry = CollectorRegistry::new(); // nothing registered
        let storage = Arc::new(MemoryStorage::new());
        let http = HttpClient::new(
            HttpConfig {
                cache_enabled: false,
                ..HttpConfig::default()
            },
            "test-agent",
            RateLimiter::new(RatePolicy::default()),
        )
        .unwrap();
        let pipeline = Pipeline::new(
            registry,
            http,
            storage,
            Validator::new(ValidatorConfig::default()),
            Deduplicator::new(DedupConfig::default()),
        );

        let yaml = r#"
sources:
  - {name: s, type: rss, url: "https://x.test/feed"}
"#;
        let source = crate::models::source::parse_source_list(yaml)
            .unwrap()
            .remove(0);
        let result = pipeline.run_source(&source, &CancelToken::never()).await;
        assert!(matches!(result, Err(AtlasError::Config(_))));
    }
}
