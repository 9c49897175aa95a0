//! Document records produced by collection and processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::SourceType;

/// Processing lifecycle of a raw document.
///
/// Advances monotonically: pending → processing → (processed | failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl ProcessingStatus {
    /// Whether moving to `next` is a legal forward transition.
    pub fn can_advance_to(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Processed) | (Processing, Failed)
        )
    }
}

/// A document as captured from the source, immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: Uuid,
    /// Foreign key to `SourceConfig.name`.
    pub source_id: String,
    pub source_url: String,
    pub source_type: SourceType,
    pub collected_at: DateTime<Utc>,
    pub collector_version: String,
    pub raw_content: String,
    /// Opaque key→value map; JSON object shape throughout the system.
    pub raw_metadata: Map<String, Value>,
    /// SHA-256 of the canonical content, computed once at capture.
    pub content_hash: String,
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub language: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_attempts: u32,
    pub processing_error: Option<String>,
}

impl RawDocument {
    /// Create a new pending document, computing the content hash over
    /// the canonicalized `title + link + content` triple.
    pub fn new(
        source_id: impl Into<String>,
        source_url: impl Into<String>,
        source_type: SourceType,
        collector_version: impl Into<String>,
        title: impl Into<String>,
        raw_content: impl Into<String>,
    ) -> Self {
        let source_url = source_url.into();
        let title = title.into();
        let raw_content = raw_content.into();
        let content_hash = content_hash_for(&title, &source_url, &raw_content);

        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            source_url,
            source_type,
            collected_at: Utc::now(),
            collector_version: collector_version.into(),
            raw_content,
            raw_metadata: Map::new(),
            content_hash,
            title,
            author: None,
            published_at: None,
            language: None,
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            processing_error: None,
        }
    }

    /// Advance the processing status; illegal transitions are ignored
    /// so the status stays monotone.
    pub fn advance_status(&mut self, next: ProcessingStatus) -> bool {
        if self.processing_status.can_advance_to(next) {
            self.processing_status = next;
            true
        } else {
            false
        }
    }
}

/// Canonical content hash: SHA-256 over trimmed, whitespace-collapsed
/// `title\nlink\ncontent`.
pub fn content_hash_for(title: &str, link: &str, content: &str) -> String {
    let canonical = format!(
        "{}\n{}\n{}",
        collapse_ws(title),
        link.trim(),
        collapse_ws(content)
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The normalized, enriched form of a raw document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub id: Uuid,
    /// 1:1 link back to the raw record.
    pub raw_document_id: Uuid,
    pub title: String,
    pub summary: Option<String>,
    pub content: String,
    pub structured_content: Map<String, Value>,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
    pub categories: Vec<String>,
    pub processed_at: DateTime<Utc>,
    pub processor_version: String,
    pub similarity_group_id: Option<Uuid>,
    /// Similarity to the matched group representative, 0..1.
    pub similarity_score: f64,
    pub is_duplicate: bool,
    /// Content hash carried over from the raw document.
    pub content_hash: String,
    pub quality_score: f64,
    pub relevance_score: f64,
    /// Set when deduplication ran on the TF-IDF fallback because the
    /// LLM path was unavailable.
    pub dedup_degraded: bool,
}

impl ProcessedDocument {
    pub fn from_raw(raw: &RawDocument, content: String, processor_version: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_document_id: raw.id,
            title: raw.title.clone(),
            summary: None,
            content,
            structured_content: Map::new(),
            entities: Vec::new(),
            keywords: Vec::new(),
            categories: Vec::new(),
            processed_at: Utc::now(),
            processor_version: processor_version.to_string(),
            similarity_group_id: None,
            similarity_score: 0.0,
            is_duplicate: false,
            content_hash: raw.content_hash.clone(),
            quality_score: 0.0,
            relevance_score: 0.0,
            dedup_degraded: false,
        }
    }

    /// Check the duplicate-marking invariant: a duplicate must carry a
    /// group and a score at or above the given threshold.
    pub fn duplicate_invariant_holds(&self, threshold: f64) -> bool {
        if self.is_duplicate {
            self.similarity_group_id.is_some() && self.similarity_score >= threshold
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable_under_whitespace() {
        let a = content_hash_for("Hello  World", "https://x.test/a", "body   text");
        let b = content_hash_for("Hello World", "https://x.test/a", "body text");
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_hash_differs_on_link() {
        let a = content_hash_for("t", "https://x.test/a", "c");
        let b = content_hash_for("t", "https://x.test/b", "c");
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_monotonic() {
        let mut doc = RawDocument::new(
            "src",
            "https://x.test/a",
            SourceType::Rss,
            "rss/1",
            "t",
            "c",
        );
        assert!(doc.advance_status(ProcessingStatus::Processing));
        assert!(doc.advance_status(ProcessingStatus::Processed));
        // Terminal: no further transitions.
        assert!(!doc.advance_status(ProcessingStatus::Processing));
        assert!(!doc.advance_status(ProcessingStatus::Failed));
    }

    #[test]
    fn test_duplicate_invariant() {
        let raw = RawDocument::new(
            "src",
            "https://x.test/a",
            SourceType::Rss,
            "rss/1",
            "t",
            "c",
        );
        let mut doc = ProcessedDocument::from_raw(&raw, "c".into(), "proc/1");
        assert!(doc.duplicate_invariant_holds(0.85));

        doc.is_duplicate = true;
        assert!(!doc.duplicate_invariant_holds(0.85));

        doc.similarity_group_id = Some(Uuid::new_v4());
        doc.similarity_score = 0.9;
        assert!(doc.duplicate_invariant_holds(0.85));
    }
}
