//! Email model shared by every analyzer, built either from a raw RFC 5322
//! message or from a JSON submission.

mod links;
pub mod mime;

pub use links::{decode_html_entities, extract_urls, html_to_text, ExtractedUrl, UrlSource};
pub use mime::decode_header_value;

use crate::domain_utils::DomainUtils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("message is empty")]
    Empty,
    #[error("no RFC 5322 headers found")]
    NoHeaders,
    #[error("submission has no usable sender address")]
    MissingSender,
}

/// Ordered header list; repeated fields (Received, Authentication-Results) are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value of a header, case-insensitive
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub display_name: Option<String>,
    pub email: String,
}

impl Address {
    /// Parse `Name <user@host>` or a bare address
    pub fn parse(value: &str) -> Option<Self> {
        let decoded = decode_header_value(value);
        let value = decoded.trim();

        if let (Some(start), Some(end)) = (value.rfind('<'), value.rfind('>')) {
            if start < end {
                let email = value[start + 1..end].trim();
                if email.contains('@') && !email.starts_with('@') {
                    let name = value[..start].trim().trim_matches('"').trim();
                    return Some(Self {
                        display_name: (!name.is_empty()).then(|| name.to_string()),
                        email: email.to_lowercase(),
                    });
                }
            }
        }

        value
            .split_whitespace()
            .map(|token| token.trim_matches(['<', '>', '"', '(', ')', ',', ';']))
            .find(|token| token.contains('@') && !token.starts_with('@'))
            .map(|token| Self {
                display_name: None,
                email: token.to_lowercase(),
            })
    }

    /// Parse a comma-separated address list, respecting quotes and brackets
    pub fn parse_list(value: &str) -> Vec<Self> {
        let mut items = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;

        for c in value.chars() {
            match c {
                '"' => in_quotes = !in_quotes,
                '<' if !in_quotes => in_angle = true,
                '>' if !in_quotes => in_angle = false,
                ',' if !in_quotes && !in_angle => {
                    items.push(std::mem::take(&mut current));
                    continue;
                }
                _ => {}
            }
            current.push(c);
        }
        items.push(current);

        items.iter().filter_map(|item| Self::parse(item)).collect()
    }

    pub fn domain(&self) -> Option<String> {
        DomainUtils::extract_domain(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<usize>,
}

/// One header value or several (JSON submissions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

/// Email metadata and body as submitted to the analysis API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSubmission {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: String,
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub to: Vec<String>,
    pub headers: BTreeMap<String, HeaderValue>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Normalized message handed to the analyzers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    pub subject: String,
    pub from: Option<Address>,
    pub reply_to: Option<Address>,
    pub return_path: Option<Address>,
    pub to: Vec<Address>,
    pub headers: Headers,
    pub body_text: String,
    pub body_html: Option<String>,
    pub urls: Vec<ExtractedUrl>,
    pub attachments: Vec<Attachment>,
    pub size: usize,
}

impl ParsedEmail {
    /// Parse a raw RFC 5322 message (CRLF or LF line endings)
    pub fn from_raw(raw: &str) -> Result<Self, ParseError> {
        let normalized = raw.replace("\r\n", "\n");
        if normalized.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let (header_block, body) = mime::split_message(&normalized);
        let headers = mime::parse_header_block(header_block);
        if headers.is_empty() {
            return Err(ParseError::NoHeaders);
        }

        let mut parts = Vec::new();
        mime::collect_parts(&headers, body, &mut parts);

        let mut text = String::new();
        let mut html = String::new();
        let mut attachments = Vec::new();

        for part in parts {
            if part.is_attachment {
                attachments.push(Attachment {
                    filename: part.filename.unwrap_or_else(|| "unnamed".to_string()),
                    content_type: Some(part.content_type),
                    size: Some(part.size),
                });
                continue;
            }
            match (part.content_type.as_str(), part.text) {
                ("text/html", Some(content)) => {
                    html.push_str(&content);
                    html.push('\n');
                }
                (_, Some(content)) => {
                    text.push_str(&content);
                    text.push('\n');
                }
                _ => {}
            }
        }

        let html = (!html.trim().is_empty()).then(|| html.trim().to_string());
        let email = Self::assemble(
            headers.get("message-id").map(str::to_string),
            headers.get("subject").map(decode_header_value),
            headers.get("from").and_then(Address::parse),
            headers.get("reply-to").and_then(Address::parse),
            headers.get("return-path").and_then(Address::parse),
            headers
                .get_all("to")
                .flat_map(Address::parse_list)
                .collect(),
            headers.clone(),
            text.trim().to_string(),
            html,
            attachments,
            raw.len(),
        );

        log::debug!(
            "Parsed message {:?}: {} headers, {} urls, {} attachments",
            email.message_id,
            email.headers.len(),
            email.urls.len(),
            email.attachments.len()
        );
        Ok(email)
    }

    /// Build from a JSON submission. Header fields given explicitly are mirrored
    /// into the header list so header-based analysis sees the same data.
    pub fn from_submission(submission: EmailSubmission) -> Result<Self, ParseError> {
        let from = Address::parse(&submission.from).ok_or(ParseError::MissingSender)?;

        let mut headers = Headers::new();
        for (name, value) in &submission.headers {
            match value {
                HeaderValue::One(v) => headers.push(name.clone(), v.clone()),
                HeaderValue::Many(values) => {
                    for v in values {
                        headers.push(name.clone(), v.clone());
                    }
                }
            }
        }

        let mirrored = [
            ("From", Some(submission.from.clone())),
            ("Subject", submission.subject.clone()),
            ("Reply-To", submission.reply_to.clone()),
            ("Return-Path", submission.return_path.clone()),
            ("Message-ID", submission.message_id.clone()),
            (
                "To",
                (!submission.to.is_empty()).then(|| submission.to.join(", ")),
            ),
        ];
        for (name, value) in mirrored {
            if let Some(value) = value {
                if !headers.contains(name) {
                    headers.push(name, value);
                }
            }
        }

        let size = submission.body_text.as_ref().map_or(0, String::len)
            + submission.body_html.as_ref().map_or(0, String::len);

        Ok(Self::assemble(
            submission.message_id,
            submission.subject,
            Some(from),
            submission.reply_to.as_deref().and_then(Address::parse),
            submission.return_path.as_deref().and_then(Address::parse),
            submission
                .to
                .iter()
                .flat_map(|to| Address::parse_list(to))
                .collect(),
            headers,
            submission.body_text.unwrap_or_default(),
            submission.body_html.filter(|h| !h.trim().is_empty()),
            submission.attachments,
            size,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        message_id: Option<String>,
        subject: Option<String>,
        from: Option<Address>,
        reply_to: Option<Address>,
        return_path: Option<Address>,
        to: Vec<Address>,
        headers: Headers,
        text: String,
        html: Option<String>,
        attachments: Vec<Attachment>,
        size: usize,
    ) -> Self {
        let urls = extract_urls(&text, html.as_deref());
        let body_text = match (&html, text.trim().is_empty()) {
            (Some(html), true) => html_to_text(html),
            _ => text,
        };

        Self {
            message_id,
            subject: subject.unwrap_or_default(),
            from,
            reply_to,
            return_path,
            to,
            headers,
            body_text,
            body_html: html,
            urls,
            attachments,
            size,
        }
    }

    /// Domain of the From address, falling back to Return-Path
    pub fn sender_domain(&self) -> Option<String> {
        self.from
            .as_ref()
            .and_then(Address::domain)
            .or_else(|| self.return_path.as_ref().and_then(Address::domain))
    }

    /// Subject and visible body text, the input of lexical analysis
    pub fn text_for_analysis(&self) -> String {
        format!("{}\n{}", self.subject, self.body_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "From: \"PayPal Service\" <service@paypa1-secure.com>\r\n\
Reply-To: refunds@gmail.com\r\n\
To: alice@example.org, \"Bob, Jr\" <bob@example.org>\r\n\
Subject: =?UTF-8?B?VXJnZW50OiB2ZXJpZnk=?= your account\r\n\
Message-ID: <abc@paypa1-secure.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
Your account is suspended. Verify at https://paypa1-secure.com/login =\r\n\
today.\r\n\
--b1\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Your account is suspended.</p><a href=\"https://paypa1-secure.com/login\">https://paypal.com</a>\r\n\
--b1--\r\n";

    #[test]
    fn test_header_lookup_outlives_name() {
        let mut headers = Headers::new();
        headers.push("Received", "from a");
        headers.push("Subject", "Quarterly report");
        headers.push("received", "from b");

        let subject = {
            let name = String::from("SUBJECT");
            headers.get(&name)
        };
        assert_eq!(subject, Some("Quarterly report"));
        assert_eq!(headers.get_all("RECEIVED").collect::<Vec<_>>(), vec!["from a", "from b"]);
        assert!(headers.contains("received"));
        assert_eq!(headers.get("X-Missing"), None);
    }

    #[test]
    fn test_parse_raw_message() {
        let email = ParsedEmail::from_raw(RAW).unwrap();

        assert_eq!(email.subject, "Urgent: verify your account");
        let from = email.from.as_ref().unwrap();
        assert_eq!(from.email, "service@paypa1-secure.com");
        assert_eq!(from.display_name.as_deref(), Some("PayPal Service"));
        assert_eq!(email.reply_to.as_ref().unwrap().email, "refunds@gmail.com");
        assert_eq!(email.to.len(), 2);
        assert_eq!(email.to[1].display_name.as_deref(), Some("Bob, Jr"));
        assert_eq!(email.sender_domain().as_deref(), Some("paypa1-secure.com"));

        assert!(email.body_text.contains("login today."));
        assert!(email.body_html.as_ref().unwrap().contains("<a href"));

        // The anchor link and the text link are the same URL
        assert_eq!(email.urls.len(), 1);
        assert_eq!(email.urls[0].anchor_text.as_deref(), Some("https://paypal.com"));
    }

    #[test]
    fn test_html_only_message_gets_text_body() {
        let raw = "From: a@b.com\nContent-Type: text/html\n\n<div>Hello <b>there</b></div>";
        let email = ParsedEmail::from_raw(raw).unwrap();
        assert_eq!(email.body_text, "Hello there");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ParsedEmail::from_raw("  \n "), Err(ParseError::Empty));
        assert_eq!(
            ParsedEmail::from_raw("just some words without headers"),
            Err(ParseError::NoHeaders)
        );
        // Empty body is fine
        assert!(ParsedEmail::from_raw("From: a@b.com\nSubject: hi\n").is_ok());
    }

    #[test]
    fn test_submission_mirrors_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Authentication-Results".to_string(),
            HeaderValue::Many(vec!["mx; spf=fail".into(), "mx2; dkim=pass".into()]),
        );
        let submission = EmailSubmission {
            subject: Some("Invoice".into()),
            from: "Billing <billing@vendor.com>".into(),
            to: vec!["ap@example.org".into()],
            headers,
            body_html: Some("<p>See https://vendor.com/invoice</p>".into()),
            ..Default::default()
        };

        let email = ParsedEmail::from_submission(submission).unwrap();
        assert_eq!(email.headers.get_all("authentication-results").count(), 2);
        assert_eq!(email.headers.get("from"), Some("Billing <billing@vendor.com>"));
        assert_eq!(email.body_text, "See https://vendor.com/invoice");
        assert_eq!(email.urls.len(), 1);
    }

    #[test]
    fn test_submission_requires_sender() {
        let submission = EmailSubmission {
            from: "not an address".into(),
            ..Default::default()
        };
        assert_eq!(
            ParsedEmail::from_submission(submission),
            Err(ParseError::MissingSender)
        );
    }

    #[test]
    fn test_display_name_with_embedded_address() {
        let addr = Address::parse("\"support@paypal.com\" <x@evil.net>").unwrap();
        assert_eq!(addr.email, "x@evil.net");
        assert_eq!(addr.display_name.as_deref(), Some("support@paypal.com"));
        assert!(Address::parse("<>").is_none());
    }
}
