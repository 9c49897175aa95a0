//! Static web page adapter.
//!
//! Extraction is selector-driven: each field has an ordered chain of
//! CSS selectors (per-source configuration first, then built-in
//! fallbacks) and the first non-empty match wins. The page is parsed
//! once; all selectors run against that DOM.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tracing::warn;

use super::http_client::HttpMethod;
use super::{parse_date_flexible, Collector, CollectorContext};
use crate::error::{AtlasError, Result};
use crate::models::{RawDocument, SourceConfig, SourceType};

const VERSION: &str = "web/2";

const TITLE_FALLBACKS: &[&str] = &["h1", "title"];
const CONTENT_FALLBACKS: &[&str] = &["article", "main", "body"];
const DATE_FALLBACKS: &[&str] = &[
    "time[datetime]",
    "meta[property=\"article:published_time\"]",
    "meta[name=\"date\"]",
    "meta[name=\"pubdate\"]",
    ".date",
    ".publish-date",
];
const AUTHOR_FALLBACKS: &[&str] = &[
    "meta[name=\"author\"]",
    "meta[property=\"article:author\"]",
    ".author",
    ".byline",
];

/// Page adapter: one fetch yields at most one raw document.
pub struct WebCollector;

impl WebCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for WebCollector {
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
                format!("page fetch returned HTTP {}", response.status),
            ));
        }

        let html = response.text();
        Ok(parse_page(source, &html).into_iter().collect())
    }

    fn version(&self) -> &'static str {
        VERSION
    }

    fn accepts(&self, source_type: SourceType) -> bool {
        source_type == SourceType::Web
    }
}

/// Extract a raw document from a fetched page.
///
/// Returns `None` (with a warning) when neither a title nor content
/// matches any selector in the chains.
pub fn parse_page(source: &SourceConfig, html: &str) -> Option<RawDocument> {
    let document = Html::parse_document(html);

    let title = select_first(&document, source.selector_chain("title"), TITLE_FALLBACKS);
    let content = select_first(&document, source.selector_chain("content"), CONTENT_FALLBACKS);

    let (title, content) = match (title, content) {
        (Some(t), Some(c)) => (t, c),
        _ => {
            warn!(
                source = %source.name,
                url = %source.url,
                "no selector matched, page skipped"
            );
            return None;
        }
    };

    let date = select_first(&document, source.selector_chain("date"), DATE_FALLBACKS)
        .and_then(|v| parse_date_flexible(&v));
    let author = select_first(&document, source.selector_chain("author"), AUTHOR_FALLBACKS);

    let mut doc = RawDocument::new(
        &source.name,
        &source.url,
        SourceType::Web,
        VERSION,
        title,
        content,
    );
    doc.published_at = date;
    doc.author = author;
    if let Some(category) = &source.category {
        doc.raw_metadata.insert("category".into(), json!(category));
    }
    Some(doc)
}

/// Run the configured chain then the built-in fallbacks; first
/// non-empty extraction wins. Invalid selector strings are skipped with
/// a warning rather than failing the page.
fn select_first(document: &Html, configured: &[String], fallbacks: &[&str]) -> Option<String> {
    let chain = configured
        .iter()
        .map(String::as_str)
        .chain(fallbacks.iter().copied());

    for selector_str in chain {
        let selector = match Selector::parse(selector_str) {
            Ok(s) => s,
            Err(_) => {
                warn!(selector = selector_str, "invalid CSS selector skipped");
                continue;
            }
        };
        if let Some(element) = document.select(&selector).next() {
            let value = extract_value(element);
            if !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Meta tags carry their value in `content`, `<time>` in `datetime`;
/// everything else contributes its text.
fn extract_value(element: ElementRef) -> String {
    let value = element.value();
    if value.name() == "meta" {
        return value.attr("content").unwrap_or_default().to_string();
    }
    if let Some(datetime) = value.attr("datetime") {
        return datetime.to_string();
    }
    element.text().collect::<Vec<_>>().join(" ")
}
