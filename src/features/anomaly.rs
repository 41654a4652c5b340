use super::{FeatureExtractor, FeatureScore};
use crate::domain_utils::DomainUtils;
use crate::email::{html_to_text, Attachment, ParsedEmail};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

lazy_static! {
    static ref HIDDEN_STYLE: Regex = Regex::new(
        r"(?i)(display\s*:\s*none|visibility\s*:\s*hidden|font-size\s*:\s*0(px|pt|em)?\s*[;'\x22]|opacity\s*:\s*0\s*[;'\x22])"
    )
    .expect("valid hidden style regex");
    static ref LURE_NAME: Regex = Regex::new(
        r"(?i)(invoice|payment|receipt|statement|remittance|urgent|scan|fax|voicemail|document|order|shipping|delivery|swift)"
    )
    .expect("valid lure regex");
}

/// Extensions that can hide behind a trailing executable one
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "jpg", "jpeg", "png", "gif", "txt",
    "rtf", "csv",
];

/// Extension to the content type it should be declared with
const EXPECTED_CONTENT_TYPES: &[(&str, &str)] = &[
    ("pdf", "application/pdf"),
    ("jpg", "image/"),
    ("jpeg", "image/"),
    ("png", "image/"),
    ("gif", "image/"),
    ("txt", "text/plain"),
    ("zip", "application/"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Domains whose lookalikes are flagged
    pub protected_domains: Vec<String>,
    pub brand_keywords: Vec<String>,
    pub disposable_domains: Vec<String>,
    pub free_mail_domains: Vec<String>,
    /// TLDs where a protected brand's own name is treated as a lookalike
    pub suspicious_tlds: Vec<String>,
    pub dangerous_extensions: Vec<String>,
    pub macro_extensions: Vec<String>,
    pub similarity_threshold: f64,
    pub max_links: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            protected_domains: strings(&[
                "paypal.com", "amazon.com", "microsoft.com", "apple.com", "google.com",
                "facebook.com", "netflix.com", "linkedin.com", "chase.com", "wellsfargo.com",
                "bankofamerica.com", "dhl.com", "fedex.com", "docusign.com", "dropbox.com",
            ]),
            brand_keywords: strings(&[
                "paypal", "amazon", "microsoft", "apple", "google", "facebook", "netflix",
                "linkedin", "chase", "docusign", "dropbox", "office365", "outlook",
            ]),
            disposable_domains: strings(&[
                "mailinator.com", "guerrillamail.com", "10minutemail.com", "tempmail.com",
                "temp-mail.org", "yopmail.com", "trashmail.com", "sharklasers.com",
                "getnada.com", "dispostable.com", "throwawaymail.com", "maildrop.cc",
            ]),
            free_mail_domains: strings(&[
                "gmail.com", "yahoo.com", "outlook.com", "hotmail.com", "aol.com",
                "icloud.com", "protonmail.com", "gmx.com", "mail.com", "yandex.com", "live.com",
            ]),
            suspicious_tlds: strings(&[
                "tk", "ml", "ga", "cf", "gq", "xyz", "top", "click", "zip", "country", "kim",
                "work", "link", "review", "loan", "buzz", "rest",
            ]),
            dangerous_extensions: strings(&[
                "exe", "scr", "bat", "cmd", "com", "pif", "vbs", "js", "jar", "msi", "ps1", "hta",
                "wsf", "lnk", "iso", "img",
            ]),
            macro_extensions: strings(&["docm", "xlsm", "pptm", "dotm", "xlam"]),
            similarity_threshold: 0.8,
            max_links: 20,
        }
    }
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyConfig::default())
    }
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    /// Undo common character substitutions (0→o, 1→l, rn→m, vv→w)
    fn deconfuse(label: &str) -> String {
        label
            .replace('0', "o")
            .replace('1', "l")
            .replace("rn", "m")
            .replace("vv", "w")
    }

    /// Protected domain imitated by `domain`, if any
    pub fn lookalike_of(&self, domain: &str) -> Option<String> {
        let root = DomainUtils::registrable_domain(domain);
        if self
            .config
            .protected_domains
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&root))
        {
            return None;
        }

        let label = DomainUtils::primary_label(&root);
        let deconfused = Self::deconfuse(&label);
        let throwaway_tld = DomainUtils::tld(&root).is_some_and(|tld| {
            self.config
                .suspicious_tlds
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&tld))
        });

        self.config
            .protected_domains
            .iter()
            .find(|protected| {
                let target = DomainUtils::primary_label(protected);
                if target == label {
                    // Brands run country sites (amazon.co.uk); only throwaway TLDs count
                    return throwaway_tld;
                }
                deconfused == target
                    || normalized_levenshtein(&label, &target) >= self.config.similarity_threshold
            })
            .cloned()
    }

    fn check_sender(&self, email: &ParsedEmail, score: &mut FeatureScore) {
        let Some(domain) = email.sender_domain() else {
            return;
        };
        let root = DomainUtils::registrable_domain(&domain);
        let label = DomainUtils::primary_label(&root);

        if DomainUtils::matches_domain_list(&domain, &self.config.disposable_domains) {
            score.add(
                0.4,
                "disposable_sender",
                format!("Sender uses disposable mail provider {root}"),
            );
        }

        let digits = label.chars().filter(|c| c.is_ascii_digit()).count();
        if digits >= 4 || (label.len() >= 6 && digits as f64 / label.len() as f64 > 0.3) {
            score.add(
                0.15,
                "numeric_domain",
                format!("Sender domain {root} is digit-heavy"),
            );
        }

        if label.len() > 25 {
            score.add(
                0.1,
                "long_domain_label",
                format!("Sender domain label is {} characters long", label.len()),
            );
        }

        if let Some(imitated) = self.lookalike_of(&domain) {
            score.add(
                0.5,
                "lookalike_domain",
                format!("Sender domain {root} imitates {imitated}"),
            );
        }

        let is_protected = self
            .config
            .protected_domains
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&root));
        if !is_protected {
            if let Some(brand) = self.config.brand_keywords.iter().find(|b| {
                root.contains(&format!("{b}-")) || root.contains(&format!("-{b}"))
            }) {
                score.add(
                    0.3,
                    "brand_hyphen_domain",
                    format!("Sender domain {root} combines brand '{brand}' with other words"),
                );
            }
        }

        let from_free = DomainUtils::matches_domain_list(&domain, &self.config.free_mail_domains);
        if let Some(reply) = email.reply_to.as_ref().and_then(|a| a.domain()) {
            if !from_free && DomainUtils::matches_domain_list(&reply, &self.config.free_mail_domains)
            {
                score.add(
                    0.2,
                    "freemail_reply_to",
                    format!("Replies go to free-mail {reply} while sender is {root}"),
                );
            }
        }
    }

    fn extension(name: &str) -> Option<String> {
        let (_, ext) = name.trim().trim_end_matches('.').rsplit_once('.')?;
        Some(ext.to_lowercase())
    }

    fn check_attachment(&self, attachment: &Attachment, score: &mut FeatureScore) {
        let name = attachment.filename.trim();
        let Some((stem, ext)) = name.trim_end_matches('.').rsplit_once('.') else {
            return;
        };
        let ext = ext.to_lowercase();
        let dangerous = self.config.dangerous_extensions.contains(&ext);
        let macro_enabled = self.config.macro_extensions.contains(&ext);

        if dangerous {
            score.add(
                0.5,
                "dangerous_attachment",
                format!("Executable attachment {name}"),
            );
        }
        if macro_enabled {
            score.add(
                0.3,
                "macro_attachment",
                format!("Macro-enabled document {name}"),
            );
        }

        if let Some(inner) = Self::extension(stem) {
            if dangerous && DOCUMENT_EXTENSIONS.contains(&inner.as_str()) {
                score.add(
                    0.3,
                    "double_extension",
                    format!("Attachment {name} disguises .{ext} as .{inner}"),
                );
            }
        }

        if (dangerous || macro_enabled || ext == "html" || ext == "htm") && LURE_NAME.is_match(name)
        {
            score.add(
                0.15,
                "lure_attachment",
                format!("Attachment name {name} uses a business lure"),
            );
        }

        if let Some(declared) = attachment.content_type.as_deref() {
            let declared = declared.trim().to_lowercase();
            let generic = declared.is_empty() || declared == "application/octet-stream";
            let mismatched = if dangerous {
                declared.starts_with("image/")
                    || declared.starts_with("text/")
                    || declared == "application/pdf"
            } else {
                EXPECTED_CONTENT_TYPES
                    .iter()
                    .find(|(e, _)| *e == ext)
                    .is_some_and(|(_, expected)| !generic && !declared.starts_with(expected))
            };
            if mismatched {
                score.add(
                    0.2,
                    "content_type_mismatch",
                    format!("Attachment {name} declared as {declared}"),
                );
            }
        }
    }

    fn check_structure(&self, email: &ParsedEmail, score: &mut FeatureScore) {
        if let Some(html) = &email.body_html {
            let visible = html_to_text(html);
            if visible.trim().chars().count() < 30 && html.len() > 200 {
                score.add(
                    0.15,
                    "html_without_text",
                    "HTML body has almost no readable text",
                );
            }
            if HIDDEN_STYLE.is_match(html) {
                score.add(0.2, "hidden_text", "HTML contains hidden content");
            }
        }

        if email.urls.len() > self.config.max_links {
            score.add(
                0.1,
                "excessive_links",
                format!("{} links in message", email.urls.len()),
            );
        }
    }

    pub fn analyze(&self, email: &ParsedEmail) -> FeatureScore {
        let mut score = FeatureScore::new("anomaly");
        self.check_sender(email, &mut score);
        for attachment in &email.attachments {
            self.check_attachment(attachment, &mut score);
        }
        self.check_structure(email, &mut score);
        log::debug!("Anomaly score {:.2}: {:?}", score.score, score.indicators);
        score
    }
}

impl FeatureExtractor for AnomalyDetector {
    fn extract(&self, email: &ParsedEmail) -> FeatureScore {
        self.analyze(email)
    }

    fn name(&self) -> &str {
        "anomaly"
    }
}
