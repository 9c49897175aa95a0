//! HTML to canonical text extraction.
//!
//! Scripts, styles, and comments are dropped; block-level elements
//! become newline separations; entity decoding comes with the DOM
//! parse. Whitespace runs collapse to a single space while paragraph
//! breaks survive as single blank lines.

use ego_tree::NodeRef;
use scraper::{Html, Node};
use serde::{Deserialize, Serialize};

/// Extraction options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractOptions {
    /// Render anchors as `text (url)` instead of bare text.
    #[serde(default)]
    pub preserve_links: bool,
}

/// Tags whose subtree never contributes text.
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "head", "iframe"];

/// Tags that separate blocks of text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "header", "footer", "aside", "main", "h1", "h2", "h3", "h4",
    "h5", "h6", "ul", "ol", "li", "table", "tr", "blockquote", "pre", "br", "hr", "figure",
    "figcaption",
];

/// Extract readable text from an HTML document.
pub fn extract_text(html: &str, options: &ExtractOptions) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    walk(document.tree.root(), options, &mut out);
    tidy_whitespace(&out)
}

fn walk(node: NodeRef<'_, Node>, options: &ExtractOptions, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(&text),
        Node::Element(element) => {
            let name = element.name();
            if SKIPPED_TAGS.contains(&name) {
                return;
            }
            let is_block = BLOCK_TAGS.contains(&name);
            if is_block {
                out.push('\n');
            }

            if name == "a" && options.preserve_links {
                if let Some(href) = element.attr("href") {
                    let mut inner = String::new();
                    for child in node.children() {
                        walk(child, options, &mut inner);
                    }
                    let text = inner.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !text.is_empty() {
                        out.push_str(&text);
                        out.push_str(" (");
                        out.push_str(href);
                        out.push(')');
                    }
                    if is_block {
                        out.push('\n');
                    }
                    return;
                }
            }

            for child in node.children() {
                walk(child, options, out);
            }
            if is_block {
                out.push('\n');
            }
        }
        // Comments, doctype, processing instructions: dropped, but
        // their children (document root) still need walking.
        _ => {
            for child in node.children() {
                walk(child, options, out);
            }
        }
    }
}

/// Collapse intra-line whitespace runs to one space and newline runs to
/// at most one blank line; trim the result.
fn tidy_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        lines.push(collapsed);
    }

    let mut out = String::new();
    let mut blank_run = 0usize;
    for line in lines {
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_and_styles_stripped() {
        let html = r#"<html><head><style>p{color:red}</style></head>
<body><script>alert(1)</script><p>Visible text</p></body></html>"#;
        let text = extract_text(html, &ExtractOptions::default());
        assert_eq!(text, "Visible text");
    }

    #[test]
    fn test_comments_stripped() {
        let html = "<body><!-- hidden --><p>kept</p></body>";
        assert_eq!(extract_text(html, &ExtractOptions::default()), "kept");
    }

    #[test]
    fn test_block_elements_separate_paragraphs() {
        let html = "<body><p>first</p><p>second</p></body>";
        let text = extract_text(html, &ExtractOptions::default());
        assert_eq!(text, "first\n\nsecond");
    }

    #[test]
    fn test_inline_elements_do_not_break() {
        let html = "<p>one <b>two</b> three</p>";
        assert_eq!(extract_text(html, &ExtractOptions::default()), "one two three");
    }

    #[test]
    fn test_entities_decoded() {
        let html = "<p>fish &amp; chips &lt;now&gt;</p>";
        assert_eq!(
            extract_text(html, &ExtractOptions::default()),
            "fish & chips <now>"
        );
    }

    #[test]
    fn test_whitespace_runs_collapse() {
        let html = "<p>a     b\t\tc</p>";
        assert_eq!(extract_text(html, &ExtractOptions::default()), "a b c");
    }

    #[test]
    fn test_links_preserved_when_enabled() {
        let html = r#"<p>see <a href="https://x.test/doc">the docs</a> here</p>"#;
        let plain = extract_text(html, &ExtractOptions::default());
        assert_eq!(plain, "see the docs here");

        let options = ExtractOptions {
            preserve_links: true,
        };
        let linked = extract_text(html, &options);
        assert_eq!(linked, "see the docs (https://x.test/doc) here");
    }

    #[test]
    fn test_deterministic() {
        let html = "<body><h1>Title</h1><p>Body &copy; text</p></body>";
        let a = extract_text(html, &ExtractOptions::default());
        let b = extract_text(html, &ExtractOptions::default());
        assert_eq!(a, b);
    }
}
