//! RSS/Atom/RDF feed adapter.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::http_client::HttpMethod;
use super::{Collector, CollectorContext};
use crate::error::{AtlasError, Result};
use crate::models::{RawDocument, SourceConfig, SourceType};

const VERSION: &str = "rss/2";

/// Feed adapter: one fetch yields one raw document per feed entry.
pub struct RssCollector;

impl RssCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RssCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for RssCollector {
    async fn collect(
        &self,
        source: &SourceConfig,
        ctx: &CollectorContext,
    ) -> Result<Vec<RawDocument>> {
        let response = ctx
            .http
            .request(
                HttpMethod::Get,
                &source.url,
                &Default::default(),
                None,
                Some(std::time::Duration::from_secs(source.timeout)),
                &ctx.cancel,
            )
            .await
            .map_err(|e| AtlasError::collector(&source.name, e))?;

        if !response.is_success() {
            return Err(AtlasError::collector(
                &source.name,
                format!("feed fetch returned HTTP {}", response.status),
            ));
        }

        parse_feed(source, &response.body)
    }

    fn version(&self) -> &'static str {
        VERSION
    }

    fn accepts(&self, source_type: SourceType) -> bool {
        source_type == SourceType::Rss
    }
}

/// Parse a fetched feed body into raw documents.
///
/// All-or-nothing with respect to the fetch: a malformed feed fails the
/// whole call rather than yielding a partial batch.
pub fn parse_feed(source: &SourceConfig, body: &[u8]) -> Result<Vec<RawDocument>> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| AtlasError::collector(&source.name, format!("feed parse: {e}")))?;

    // Relative entry links resolve against the feed's own link, falling
    // back to the fetch URL.
    let base = feed
        .links
        .first()
        .and_then(|l| Url::parse(&l.href).ok())
        .or_else(|| Url::parse(&source.url).ok());

    let mut documents = Vec::new();
    let mut seen_links: HashSet<String> = HashSet::new();

    for entry in feed.entries.into_iter() {
        if documents.len() >= source.max_items_per_run {
            debug!(
                source = %source.name,
                cap = source.max_items_per_run,
                "max_items_per_run reached, truncating feed"
            );
            break;
        }

        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .unwrap_or_default();

        let link = entry
            .links
            .first()
            .map(|l| resolve_link(base.as_ref(), &l.href))
            .unwrap_or_default();

        // Duplicate links within one feed collapse to the first.
        if !link.is_empty() && !seen_links.insert(link.clone()) {
            continue;
        }

        // Content priority: full content, then description/summary
        // (feed-rs folds RSS description into the entry summary).
        let content = entry
            .content
            .as_ref()
            .and_then(|c| c.body.clone())
            .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))
            .unwrap_or_default();

        let published = entry.published.or(entry.updated);
        let author = entry.authors.first().map(|a| a.name.clone());
        let categories: Vec<String> = entry
            .categories
            .iter()
            .map(|c| c.label.clone().unwrap_or_else(|| c.term.clone()))
            .filter(|c| !c.is_empty())
            .collect();

        let enclosures: Vec<Value> = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|c| {
                c.url.as_ref().map(|u| {
                    json!({
                        "url": u.to_string(),
                        "mime": c.content_type.as_ref().map(|m| m.to_string()),
                        "width": c.width,
                        "height": c.height,
                    })
                })
            })
            .collect();

        let mut doc = RawDocument::new(
            &source.name,
            if link.is_empty() { &source.url } else { &link },
            SourceType::Rss,
            VERSION,
            title,
            content,
        );
        doc.author = author;
        doc.published_at = published;
        doc.raw_metadata.insert("entry_id".into(), json!(entry.id));
        if !categories.is_empty() {
            doc.raw_metadata
                .insert("categories".into(), json!(categories));
        }
        if !enclosures.is_empty() {
            doc.raw_metadata
                .insert("enclosures".into(), json!(enclosures));
        }
        if let Some(feed_title) = feed.title.as_ref() {
            doc.raw_metadata
                .insert("feed_title".into(), json!(feed_title.content));
        }

        documents.push(doc);
    }

    if documents.is_empty() {
        warn!(source = %source.name, "feed contained no usable entries");
    }
    Ok(documents)
}

/// Resolve a possibly-relative entry link against the feed base.
fn resolve_link(base: Option<&Url>, href: &str) -> String {
    if Url::parse(href).is_ok() {
        return href.to_string();
    }
    match base {
        Some(base) => base
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string()),
        None => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rss_source() -> SourceConfig {
        let yaml = r#"
sources:
  - {name: ex, type: rss, url: "http://x.test/feed"}
"#;
        crate::models::source::parse_source_list(yaml)
            .unwrap()
            .remove(0)
    }

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <link>http://x.test/</link>
    <item>
      <title>A</title>
      <link>/posts/a</link>
      <description>First post body</description>
      <pubDate>Sun, 01 Mar 2026 10:00:00 GMT</pubDate>
      <author>alice@example.com (Alice)</author>
      <category>tech</category>
    </item>
    <item>
      <title>B</title>
      <link>http://x.test/posts/b</link>
      <description>Second post body</description>
    </item>
    <item>
      <title>C</title>
      <link>http://x.test/posts/c</link>
      <description>Third post body</description>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_feed_happy_path() {
        let docs = parse_feed(&rss_source(), FEED.as_bytes()).unwrap();
        assert_eq!(docs.len(), 3);

        let titles: Vec<&str> = docs.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
        assert_eq!(docs[0].source_url, "http://x.test/posts/a");
        assert!(docs[0].published_at.is_some());
        assert!(docs[1].published_at.is_none());
        assert_eq!(docs[0].collector_version, "rss/2");
        assert_eq!(
            docs[0].raw_metadata.get("feed_title").unwrap(),
            "Example Feed"
        );
    }

    #[test]
    fn test_parse_feed_idempotent_hashes() {
        let first = parse_feed(&rss_source(), FEED.as_bytes()).unwrap();
        let second = parse_feed(&rss_source(), FEED.as_bytes()).unwrap();
        let hashes = |docs: &[RawDocument]| {
            docs.iter()
                .map(|d| d.content_hash.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(hashes(&first), hashes(&second));
    }

    #[test]
    fn test_duplicate_links_collapsed() {
        let feed = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title>
  <item><title>First</title><link>http://x.test/same</link><description>one</description></item>
  <item><title>Second</title><link>http://x.test/same</link><description>two</description></item>
</channel></rss>"#;
        let docs = parse_feed(&rss_source(), feed.as_bytes()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "First");
    }

    #[test]
    fn test_max_items_cap() {
        let mut source = rss_source();
        source.max_items_per_run = 2;
        let docs = parse_feed(&source, FEED.as_bytes()).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_malformed_feed_fails_whole_fetch() {
        let result = parse_feed(&rss_source(), b"this is not xml at all");
        assert!(matches!(
            result,
            Err(AtlasError::Collector { .. })
        ));
    }

    #[test]
    fn test_resolve_link_relative_joined() {
        let base = Url::parse("https://x.test/blog/").unwrap();
        assert_eq!(
            resolve_link(Some(&base), "/posts/1"),
            "https://x.test/posts/1"
        );
        assert_eq!(
            resolve_link(Some(&base), "https://other.test/post"),
            "https://other.test/post"
        );
        assert_eq!(resolve_link(None, "/posts/1"), "/posts/1");
    }
}
