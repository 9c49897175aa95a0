//! End-to-end pipeline scenarios.
//!
//! Collectors are driven from canned feed bodies so the full
//! parse → normalize → validate → dedup → store path runs without a
//! network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use atlas::cancel::CancelToken;
use atlas::collectors::http_client::{HttpClient, HttpConfig};
use atlas::collectors::rate_limiter::{RateLimiter, RatePolicy, RateStrategy};
use atlas::collectors::rss::parse_feed;
use atlas::collectors::web::parse_page;
use atlas::collectors::{Collector, CollectorContext, CollectorRegistry};
use atlas::error::Result;
use atlas::models::{ProcessingStatus, RawDocument, SourceConfig, SourceType};
use atlas::pipeline::Pipeline;
use atlas::processors::dedup::{DedupConfig, Deduplicator};
use atlas::processors::validator::{Validator, ValidatorConfig};
use atlas::storage::{MemoryStorage, Storage};

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <link>http://x.test/</link>
    <item>
      <title>A</title>
      <link>http://x.test/posts/a</link>
      <description>Alpha body with enough words to clear the validator threshold easily.</description>
      <pubDate>Sun, 01 Mar 2026 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>B</title>
      <link>http://x.test/posts/b</link>
      <description>Beta body, a different text entirely, also comfortably long enough.</description>
    </item>
    <item>
      <title>C</title>
      <link>http://x.test/posts/c</link>
      <description>Gamma body, the third distinct article in this little feed fixture.</description>
    </item>
  </channel>
</rss>"#;

/// Serves a canned feed body through the real RSS parsing path.
struct CannedFeed {
    body: &'static str,
}

#[async_trait]
impl Collector for CannedFeed {
    async fn collect(
        &self,
        source: &SourceConfig,
        _ctx: &CollectorContext,
    ) -> Result<Vec<RawDocument>> {
        parse_feed(source, self.body.as_bytes())
    }

    fn version(&self) -> &'static str {
        "rss/2"
    }

    fn accepts(&self, source_type: SourceType) -> bool {
        source_type == SourceType::Rss
    }
}

/// Serves a canned HTML page through the real selector path.
struct CannedPage {
    html: &'static str,
}

#[async_trait]
impl Collector for CannedPage {
    async fn collect(
        &self,
        source: &SourceConfig,
        _ctx: &CollectorContext,
    ) -> Result<Vec<RawDocument>> {
        Ok(parse_page(source, self.html).into_iter().collect())
    }

    fn version(&self) -> &'static str {
        "web/2"
    }

    fn accepts(&self, source_type: SourceType) -> bool {
        source_type == SourceType::Web
    }
}

fn rss_source(name: &str) -> SourceConfig {
    let yaml = format!(
        r#"
sources:
  - {{name: {name}, type: rss, url: "http://x.test/feed", interval: 3600}}
"#
    );
    atlas::models::source::parse_source_list(&yaml)
        .unwrap()
        .remove(0)
}

fn test_http() -> HttpClient {
    HttpClient::new(
        HttpConfig {
            cache_enabled: false,
            ..HttpConfig::default()
        },
        "atlas-test",
        RateLimiter::new(RatePolicy::default()),
    )
    .unwrap()
}

fn pipeline_with(collector: Arc<dyn Collector>, storage: Arc<dyn Storage>) -> Pipeline {
    let mut registry = CollectorRegistry::new();
    registry.register(collector);
    Pipeline::new(
        registry,
        test_http(),
        storage,
        Validator::new(ValidatorConfig {
            min_content_length: 10,
            ..ValidatorConfig::default()
        }),
        Deduplicator::new(DedupConfig::default()),
    )
}

#[tokio::test]
async fn rss_happy_path_produces_three_accepted_documents() {
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = pipeline_with(Arc::new(CannedFeed { body: FEED }), storage.clone());
    let source = rss_source("ex");

    let stats = pipeline
        .run_source(&source, &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(stats.rejected, 0);

    let raw = storage.iter_raw("ex", None, None).await.unwrap();
    assert_eq!(raw.len(), 3);
    let mut titles: Vec<String> = raw.iter().map(|d| d.title.clone()).collect();
    titles.sort();
    assert_eq!(titles, vec!["A", "B", "C"]);
    assert!(raw
        .iter()
        .all(|d| d.processing_status == ProcessingStatus::Processed));

    let processed = storage.list_processed().await.unwrap();
    assert_eq!(processed.len(), 3);
    assert!(processed.iter().all(|d| !d.is_duplicate));
    assert!(processed.iter().all(|d| d.similarity_group_id.is_some()));
}

#[tokio::test]
async fn unchanged_feed_marks_second_cycle_as_duplicates() {
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = pipeline_with(Arc::new(CannedFeed { body: FEED }), storage.clone());
    let source = rss_source("ex");

    let first = pipeline
        .run_source(&source, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(first.accepted, 3);

    let second = pipeline
        .run_source(&source, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(second.duplicates, 3);
    assert_eq!(second.accepted, 0);

    // Same content hash always lands in the same similarity group,
    // with full-confidence scores on the repeat.
    let processed = storage.list_processed().await.unwrap();
    assert_eq!(processed.len(), 6);
    let mut groups_by_hash: HashMap<String, Vec<uuid::Uuid>> = HashMap::new();
    for doc in &processed {
        groups_by_hash
            .entry(doc.content_hash.clone())
            .or_default()
            .push(doc.similarity_group_id.unwrap());
    }
    for (hash, groups) in groups_by_hash {
        assert_eq!(groups.len(), 2, "hash {hash} seen twice");
        assert_eq!(groups[0], groups[1], "hash {hash} split across groups");
    }
    for dup in processed.iter().filter(|d| d.is_duplicate) {
        assert_eq!(dup.similarity_score, 1.0);
        assert!(dup.duplicate_invariant_holds(0.85));
    }
}

#[tokio::test]
async fn collector_idempotence_same_hashes_across_runs() {
    let source = rss_source("ex");
    let first = parse_feed(&source, FEED.as_bytes()).unwrap();
    let second = parse_feed(&source, FEED.as_bytes()).unwrap();
    let hashes = |docs: &[RawDocument]| -> Vec<String> {
        docs.iter().map(|d| d.content_hash.clone()).collect()
    };
    assert_eq!(hashes(&first), hashes(&second));
}

#[tokio::test]
async fn web_page_source_flows_through_pipeline() {
    const PAGE: &str = r#"<!doctype html><html><head><title>Page</title></head>
<body><h1>Release Notes</h1>
<article>The long-awaited release ships with a number of fixes and a new importer.</article>
</body></html>"#;

    let yaml = r#"
sources:
  - name: blog
    type: web
    url: "http://x.test/blog"
    selectors:
      title: ["h1"]
      content: ["article"]
"#;
    let source = atlas::models::source::parse_source_list(yaml)
        .unwrap()
        .remove(0);

    let storage = Arc::new(MemoryStorage::new());
    let pipeline = pipeline_with(Arc::new(CannedPage { html: PAGE }), storage.clone());

    let stats = pipeline
        .run_source(&source, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.accepted, 1);

    let processed = storage.list_processed().await.unwrap();
    assert_eq!(processed[0].title, "Release Notes");
    assert!(processed[0].content.contains("new importer"));
}

#[tokio::test]
async fn empty_content_entries_are_rejected_not_accepted() {
    const THIN_FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title>
  <item><title>Hollow</title><link>http://x.test/h</link><description></description></item>
  <item><title>Full</title><link>http://x.test/f</link><description>Plenty of content in this one, well above any threshold.</description></item>
</channel></rss>"#;

    let storage = Arc::new(MemoryStorage::new());
    let pipeline = pipeline_with(Arc::new(CannedFeed { body: THIN_FEED }), storage.clone());
    let stats = pipeline
        .run_source(&rss_source("thin"), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.rejected, 1);

    let raw = storage.iter_raw("thin", None, None).await.unwrap();
    let hollow = raw.iter().find(|d| d.title == "Hollow").unwrap();
    assert_eq!(hollow.processing_status, ProcessingStatus::Failed);
    assert!(hollow.processing_error.as_deref().unwrap().contains("validation"));
}

// Two collection tasks sharing one domain at 1 request / 60 s: the
// first admission is immediate, the second waits a full period.
#[tokio::test(start_paused = true)]
async fn shared_domain_rate_limit_spaces_concurrent_fetches() {
    let limiter = RateLimiter::new(RatePolicy {
        strategy: RateStrategy::SlidingWindow,
        requests_per_second: 1.0 / 60.0,
        window_secs: 60.0,
        burst_size: 1,
        adaptive: false,
        ..RatePolicy::default()
    });

    let started = tokio::time::Instant::now();
    let first = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .acquire("x.test", true, Duration::from_secs(120), &CancelToken::never())
                .await
                .unwrap();
            tokio::time::Instant::now()
        })
    };
    let second = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .acquire("x.test", true, Duration::from_secs(120), &CancelToken::never())
                .await
                .unwrap();
            tokio::time::Instant::now()
        })
    };

    tokio::time::advance(Duration::from_secs(61)).await;
    let t_first = first.await.unwrap();
    let t_second = second.await.unwrap();

    let (early, late) = if t_first <= t_second {
        (t_first, t_second)
    } else {
        (t_second, t_first)
    };
    assert!(early.duration_since(started) < Duration::from_secs(1));
    assert!(late.duration_since(started) >= Duration::from_secs(60));
}
