use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

lazy_static! {
    static ref TEXT_URL: Regex =
        Regex::new(r#"(?i)\bhttps?://[^\s<>"'`\)\]\}]+"#).expect("valid url regex");
    static ref ANCHOR: Regex =
        Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a\s*>"#)
            .expect("valid anchor regex");
    static ref SCRIPT_STYLE: Regex =
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("valid regex");
    static ref BLOCK_BREAK: Regex =
        Regex::new(r"(?i)<\s*(br|/p|/div|/tr|/li|/h[1-6])\b[^>]*>").expect("valid regex");
    static ref TAG: Regex = Regex::new(r"(?s)<[^>]*>").expect("valid tag regex");
    static ref NUMERIC_ENTITY: Regex =
        Regex::new(r"&#([xX][0-9a-fA-F]+|[0-9]+);").expect("valid entity regex");
    static ref SPACE_RUN: Regex = Regex::new(r"[ \t\u{a0}]+").expect("valid regex");
    static ref BLANK_LINES: Regex = Regex::new(r"\n\s*\n+").expect("valid regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlSource {
    Text,
    Html,
}

/// A link found in the message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedUrl {
    pub url: String,
    pub host: Option<String>,
    /// Visible anchor text for HTML links
    pub anchor_text: Option<String>,
    pub source: UrlSource,
}

impl ExtractedUrl {
    pub fn new(url: &str, anchor_text: Option<String>, source: UrlSource) -> Self {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()));
        Self {
            url: url.to_string(),
            host,
            anchor_text: anchor_text.filter(|t| !t.is_empty()),
            source,
        }
    }
}

/// Replace the handful of entities that matter for text analysis
pub fn decode_html_entities(text: &str) -> String {
    let named = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");

    let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(|c| c.to_string())
            .unwrap_or_default()
    });

    // &amp; last so "&amp;lt;" stays literal
    numeric.replace("&amp;", "&")
}

/// Render HTML to plain text for lexical analysis
pub fn html_to_text(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE.replace_all(html, " ");
    let with_breaks = BLOCK_BREAK.replace_all(&without_scripts, "\n");
    let stripped = TAG.replace_all(&with_breaks, " ");
    let decoded = decode_html_entities(&stripped);
    let collapsed = SPACE_RUN.replace_all(&decoded, " ");

    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    BLANK_LINES
        .replace_all(lines.join("\n").trim(), "\n")
        .into_owned()
}

fn clean_text_url(raw: &str) -> &str {
    raw.trim_end_matches(['.', ',', ';', ':', '!', '?', '\''])
}

/// Extract http(s) links from the text body and from HTML anchors.
/// Anchors come first so their display text is kept; duplicates are dropped.
pub fn extract_urls(text: &str, html: Option<&str>) -> Vec<ExtractedUrl> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    if let Some(html) = html {
        for caps in ANCHOR.captures_iter(html) {
            let href = decode_html_entities(caps[1].trim());
            let lower = href.to_lowercase();
            if !(lower.starts_with("http://") || lower.starts_with("https://")) {
                continue;
            }
            if seen.insert(href.clone()) {
                let anchor = html_to_text(&caps[2]);
                urls.push(ExtractedUrl::new(&href, Some(anchor), UrlSource::Html));
            }
        }
    }

    // Anchor display text is not a link target, so scan the HTML without anchors
    let html_text = html
        .map(|h| html_to_text(&ANCHOR.replace_all(h, " ")))
        .unwrap_or_default();
    for source in [text, html_text.as_str()] {
        for m in TEXT_URL.find_iter(source) {
            let url = clean_text_url(m.as_str());
            if seen.insert(url.to_string()) {
                urls.push(ExtractedUrl::new(url, None, UrlSource::Text));
            }
        }
    }

    urls
}
