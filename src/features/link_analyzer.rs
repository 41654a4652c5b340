use super::{FeatureExtractor, FeatureScore};
use crate::domain_utils::DomainUtils;
use crate::email::{ExtractedUrl, ParsedEmail, UrlSource};
use crate::reputation::ReputationVerdict;
use crate::url_resolver::RedirectChain;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use url::Url;

lazy_static! {
    /// Anchor text that reads like a link target
    static ref DOMAIN_LIKE: Regex =
        Regex::new(r"(?i)^(https?://)?(www\.)?([a-z0-9-]+\.)+[a-z]{2,}(/\S*)?$")
            .expect("valid domain regex");
}

const CREDENTIAL_PATH_KEYWORDS: &[&str] = &[
    "login", "signin", "sign-in", "logon", "verify", "verification", "account", "password",
    "secure", "update", "banking", "webscr", "confirm", "wp-admin",
];

const EXCESSIVE_REDIRECTS: usize = 3;
const MAX_CHAIN_DOMAINS: usize = 2;

const EXECUTABLE_TYPES: &[&str] = &[
    "application/x-msdownload",
    "application/x-msdos-program",
    "application/x-dosexec",
    "application/x-executable",
    "application/vnd.microsoft.portable-executable",
];
const ARCHIVE_TYPES: &[&str] = &[
    "application/zip",
    "application/x-zip-compressed",
    "application/x-rar-compressed",
    "application/vnd.rar",
    "application/x-7z-compressed",
    "application/gzip",
    "application/x-tar",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandConfig {
    pub name: String,
    /// Domains the brand legitimately sends links to
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlConfig {
    pub shorteners: Vec<String>,
    pub suspicious_tlds: Vec<String>,
    pub safe_domains: Vec<String>,
    pub brands: Vec<BrandConfig>,
    pub max_subdomain_dots: usize,
    pub max_query_length: usize,
}

impl Default for UrlConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        let brand = |name: &str, domains: &[&str]| BrandConfig {
            name: name.to_string(),
            domains: strings(domains),
        };

        Self {
            shorteners: strings(&[
                "bit.ly", "tinyurl.com", "t.co", "goo.gl", "ow.ly", "short.link", "is.gd", "v.gd",
                "tiny.cc", "rb.gy", "cutt.ly", "shorturl.at", "1url.com", "u.to", "buff.ly",
            ]),
            suspicious_tlds: strings(&[
                "tk", "ml", "ga", "cf", "gq", "xyz", "top", "click", "zip", "country", "kim",
                "work", "link", "review", "loan", "buzz", "rest",
            ]),
            safe_domains: strings(&[
                "google.com", "microsoft.com", "apple.com", "amazon.com", "paypal.com",
                "github.com", "linkedin.com", "office.com", "live.com",
            ]),
            brands: vec![
                brand("paypal", &["paypal.com", "paypal.me", "paypalobjects.com"]),
                brand("amazon", &["amazon.com", "amazon.co.uk", "amazonaws.com", "amzn.to"]),
                brand("microsoft", &["microsoft.com", "live.com", "office.com", "aka.ms"]),
                brand("apple", &["apple.com", "icloud.com"]),
                brand("google", &["google.com", "goo.gl", "googleusercontent.com"]),
                brand("facebook", &["facebook.com", "fb.com", "fb.me"]),
                brand("netflix", &["netflix.com"]),
                brand("linkedin", &["linkedin.com", "lnkd.in"]),
            ],
            max_subdomain_dots: 3,
            max_query_length: 200,
        }
    }
}

/// Risk assessment of one link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlAssessment {
    pub url: String,
    pub host: Option<String>,
    pub risk: f64,
    pub indicators: Vec<String>,
    pub evidence: Vec<String>,
    pub reputation: Option<ReputationVerdict>,
    pub safe_listed: bool,
    /// Landing page after redirects, when the link was followed
    pub final_url: Option<String>,
    pub final_host: Option<String>,
}

impl UrlAssessment {
    fn add(&mut self, risk: f64, indicator: &str, evidence: String) {
        self.risk = (self.risk + risk).clamp(0.0, 1.0);
        self.push_indicator(indicator);
        self.evidence.push(evidence);
    }

    fn push_indicator(&mut self, indicator: &str) {
        if !self.indicators.iter().any(|i| i == indicator) {
            self.indicators.push(indicator.to_string());
        }
    }
}

pub struct LinkAnalyzer {
    config: UrlConfig,
}

impl Default for LinkAnalyzer {
    fn default() -> Self {
        Self::new(UrlConfig::default())
    }
}

impl LinkAnalyzer {
    pub fn new(config: UrlConfig) -> Self {
        Self { config }
    }

    fn is_shortener(&self, host: &str) -> bool {
        DomainUtils::matches_domain_list(host, &self.config.shorteners)
    }

    /// Static risk of a single link, without reputation data
    pub fn assess(&self, link: &ExtractedUrl) -> UrlAssessment {
        let mut assessment = UrlAssessment {
            url: link.url.clone(),
            host: link.host.clone(),
            risk: 0.0,
            indicators: Vec::new(),
            evidence: Vec::new(),
            reputation: None,
            safe_listed: false,
            final_url: None,
            final_host: None,
        };

        let parsed = match Url::parse(&link.url) {
            Ok(parsed) => parsed,
            Err(e) => {
                assessment.add(0.2, "malformed_url", format!("Unparseable URL ({e})"));
                return assessment;
            }
        };
        let Some(host) = link.host.clone() else {
            assessment.add(0.2, "malformed_url", "URL has no host".to_string());
            return assessment;
        };

        if DomainUtils::is_ip_literal(&host) {
            assessment.add(0.4, "ip_host", format!("Link points to IP address {host}"));
        }

        if self.is_shortener(&host) {
            assessment.add(0.25, "url_shortener", format!("Shortened link via {host}"));
        }

        if let Some(tld) = DomainUtils::tld(&host) {
            if self.config.suspicious_tlds.iter().any(|t| t.eq_ignore_ascii_case(&tld)) {
                assessment.add(0.2, "suspicious_tld", format!("High-risk TLD .{tld}"));
            }
        }

        if !DomainUtils::is_ip_literal(&host)
            && host.matches('.').count() > self.config.max_subdomain_dots
        {
            assessment.add(
                0.15,
                "excessive_subdomains",
                format!("Deeply nested host {host}"),
            );
        }

        let raw_host_non_ascii = link
            .url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split(['/', '?', '#']).next())
            .is_some_and(|authority| !authority.is_ascii());
        if raw_host_non_ascii || host.split('.').any(|label| label.starts_with("xn--")) {
            assessment.add(
                0.3,
                "punycode_host",
                format!("Internationalized host {host}"),
            );
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            assessment.add(
                0.3,
                "userinfo_trick",
                format!("Credentials-style '@' before host {host}"),
            );
        }

        let path = parsed.path().to_lowercase();
        if let Some(keyword) = CREDENTIAL_PATH_KEYWORDS.iter().find(|k| path.contains(*k)) {
            assessment.add(
                0.15,
                "credential_path",
                format!("Path contains '{keyword}'"),
            );
        }

        if let Some(query) = parsed.query() {
            if query.len() > self.config.max_query_length {
                assessment.add(
                    0.1,
                    "long_query",
                    format!("Query string of {} characters", query.len()),
                );
            }
        }

        if let Some(anchor) = &link.anchor_text {
            if let Some(shown) = Self::anchor_domain(anchor) {
                if !DomainUtils::same_organization(&shown, &host) {
                    assessment.add(
                        0.5,
                        "misleading_link",
                        format!("Link text shows {shown} but points to {host}"),
                    );
                }
            }
        }

        for brand in &self.config.brands {
            if host.contains(&brand.name)
                && !DomainUtils::matches_domain_list(&host, &brand.domains)
            {
                assessment.add(
                    0.35,
                    "brand_in_host",
                    format!("Host {host} uses brand '{}' outside its domains", brand.name),
                );
            }
        }

        if DomainUtils::matches_domain_list(&host, &self.config.safe_domains) {
            assessment.safe_listed = true;
            assessment.risk *= 0.2;
            assessment
                .evidence
                .push(format!("{host} is on the known-safe list"));
        }

        assessment
    }

    /// Host shown in anchor text, if the text reads like a URL or domain
    fn anchor_domain(anchor: &str) -> Option<String> {
        let text = anchor.trim();
        if !DOMAIN_LIKE.is_match(text) {
            return None;
        }
        let with_scheme = if text.to_lowercase().starts_with("http") {
            text.to_string()
        } else {
            format!("http://{text}")
        };
        Url::parse(&with_scheme)
            .ok()?
            .host_str()
            .map(|h| h.to_lowercase())
    }

    pub fn assess_all(&self, email: &ParsedEmail) -> Vec<UrlAssessment> {
        email.urls.iter().map(|link| self.assess(link)).collect()
    }

    /// Distinct hosts worth a reputation lookup, redirect targets included
    pub fn hosts_for_lookup(assessments: &[UrlAssessment]) -> Vec<String> {
        let mut seen = HashSet::new();
        assessments
            .iter()
            .flat_map(|a| {
                let own = a.host.clone().filter(|_| !a.safe_listed);
                own.into_iter().chain(a.final_host.clone())
            })
            .filter(|h| !DomainUtils::is_ip_literal(h))
            .filter(|h| seen.insert(h.clone()))
            .collect()
    }

    /// Fold followed redirect chains into the assessments of their links
    pub fn apply_redirects(
        &self,
        assessments: &mut [UrlAssessment],
        chains: &HashMap<String, RedirectChain>,
    ) {
        for assessment in assessments.iter_mut() {
            if let Some(chain) = chains.get(&assessment.url) {
                self.apply_chain(assessment, chain);
            }
        }
    }

    fn apply_chain(&self, assessment: &mut UrlAssessment, chain: &RedirectChain) {
        let count = chain.redirect_count();
        let mut landing_safe = false;

        if count > 0 {
            assessment.final_url = Some(chain.final_url.clone());
            assessment.final_host = chain.final_host.clone();
            assessment
                .evidence
                .push(format!("Redirects {count} time(s) to {}", chain.final_url));

            // The landing page is judged like a link in the body
            let landing = self.assess(&ExtractedUrl::new(&chain.final_url, None, UrlSource::Text));
            landing_safe = landing.safe_listed;
            if landing.risk > 0.0 {
                assessment.risk = assessment.risk.max(landing.risk);
                for indicator in &landing.indicators {
                    assessment.push_indicator(indicator);
                }
                assessment
                    .evidence
                    .extend(landing.evidence.iter().map(|e| format!("destination: {e}")));
            }
        }
        if chain.truncated {
            assessment
                .evidence
                .push(format!("Stopped following after {count} redirects"));
        }

        if count > EXCESSIVE_REDIRECTS {
            assessment.add(
                0.2,
                "excessive_redirects",
                format!("{count} redirects before the destination"),
            );
        }

        let crossed = match (&assessment.host, &chain.final_host) {
            (Some(origin), Some(destination))
                if !landing_safe && !DomainUtils::same_organization(origin, destination) =>
            {
                Some(format!("Redirects from {origin} to {destination}"))
            }
            _ => None,
        };
        if let Some(evidence) = crossed {
            assessment.add(0.15, "domain_change", evidence);
        }

        let domains = chain.domains();
        if !landing_safe && domains.len() > MAX_CHAIN_DOMAINS {
            assessment.add(
                0.25,
                "multiple_domain_changes",
                format!("Redirect chain crosses {}", domains.join(" -> ")),
            );
        }

        if let Some(content_type) = &chain.content_type {
            if let Some((indicator, risk)) = Self::download_indicator(content_type) {
                assessment.add(risk, indicator, format!("Destination serves {content_type}"));
            }
        }
    }

    fn download_indicator(content_type: &str) -> Option<(&'static str, f64)> {
        let media_type = content_type.to_ascii_lowercase();
        if EXECUTABLE_TYPES.contains(&media_type.as_str()) {
            Some(("executable_download", 0.5))
        } else if ARCHIVE_TYPES.contains(&media_type.as_str()) {
            Some(("archive_download", 0.3))
        } else if media_type == "application/octet-stream" {
            Some(("binary_download", 0.3))
        } else {
            None
        }
    }

    /// Fold reputation verdicts for a link's host and landing host
    pub fn apply_reputation(
        assessments: &mut [UrlAssessment],
        verdicts: &HashMap<String, ReputationVerdict>,
    ) {
        for assessment in assessments.iter_mut() {
            let hosts: Vec<String> = assessment
                .host
                .iter()
                .chain(assessment.final_host.iter())
                .cloned()
                .collect();
            for host in hosts {
                if let Some(verdict) = verdicts.get(&host) {
                    Self::apply_verdict(assessment, &host, verdict);
                }
            }
        }
    }

    fn apply_verdict(assessment: &mut UrlAssessment, host: &str, verdict: &ReputationVerdict) {
        let severity = |v: &ReputationVerdict| match v {
            ReputationVerdict::Malicious { .. } => 3,
            ReputationVerdict::Suspicious { .. } => 2,
            ReputationVerdict::Clean => 1,
            ReputationVerdict::Unknown => 0,
        };
        if assessment
            .reputation
            .as_ref()
            .map_or(true, |current| severity(verdict) > severity(current))
        {
            assessment.reputation = Some(verdict.clone());
        }

        let subject = if assessment.host.as_deref() == Some(host) {
            "Reputation".to_string()
        } else {
            format!("Reputation of {host}")
        };
        match verdict {
            ReputationVerdict::Malicious { positives, total } => {
                assessment.risk = assessment.risk.max(0.9);
                assessment.push_indicator("reputation_malicious");
                assessment.evidence.push(format!(
                    "{subject}: malicious ({positives}/{total} engines)"
                ));
            }
            ReputationVerdict::Suspicious { positives, total } => {
                assessment.add(
                    0.3,
                    "reputation_suspicious",
                    format!("{subject}: suspicious ({positives}/{total} engines)"),
                );
            }
            ReputationVerdict::Clean => {
                assessment.evidence.push(format!("{subject}: clean"));
            }
            ReputationVerdict::Unknown => {}
        }
    }

    /// Email-level url signal: the riskiest link decides
    pub fn summarize(assessments: &[UrlAssessment]) -> FeatureScore {
        let mut score = FeatureScore::new("url");
        for assessment in assessments {
            score.score = score.score.max(assessment.risk);
            if assessment.risk > 0.0 {
                for indicator in &assessment.indicators {
                    score.push_indicator(indicator);
                }
            }
            let label = assessment.host.as_deref().unwrap_or(&assessment.url);
            score
                .evidence
                .extend(assessment.evidence.iter().map(|e| format!("{label}: {e}")));
        }
        score
    }
}

impl FeatureExtractor for LinkAnalyzer {
    fn extract(&self, email: &ParsedEmail) -> FeatureScore {
        Self::summarize(&self.assess_all(email))
    }

    fn name(&self) -> &str {
        "url"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::UrlSource;

    fn link(url: &str) -> ExtractedUrl {
        ExtractedUrl::new(url, None, UrlSource::Text)
    }

    #[test]
    fn test_ip_and_credential_path() {
        let analyzer = LinkAnalyzer::default();
        let a = analyzer.assess(&link("http://192.168.4.20/secure/login.php"));
        assert!(a.indicators.contains(&"ip_host".to_string()));
        assert!(a.indicators.contains(&"credential_path".to_string()));
        assert!((a.risk - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_misleading_anchor() {
        let analyzer = LinkAnalyzer::default();
        let a = analyzer.assess(&ExtractedUrl::new(
            "https://evil.example.net/x",
            Some("www.paypal.com".into()),
            UrlSource::Html,
        ));
        assert!(a.indicators.contains(&"misleading_link".to_string()));

        // Same organisation is not misleading
        let ok = analyzer.assess(&ExtractedUrl::new(
            "https://click.example.com/track",
            Some("https://www.example.com".into()),
            UrlSource::Html,
        ));
        assert!(!ok.indicators.contains(&"misleading_link".to_string()));
    }

    #[test]
    fn test_brand_outside_own_domain() {
        let analyzer = LinkAnalyzer::default();
        let bad = analyzer.assess(&link("https://paypal-security.top/verify"));
        assert!(bad.indicators.contains(&"brand_in_host".to_string()));
        assert!(bad.indicators.contains(&"suspicious_tld".to_string()));

        let good = analyzer.assess(&link("https://www.paypal.com/signin"));
        assert!(good.safe_listed);
        assert!(!good.indicators.contains(&"brand_in_host".to_string()));
        assert!(good.risk < 0.1);
    }

    #[test]
    fn test_shortener_userinfo_and_punycode() {
        let analyzer = LinkAnalyzer::default();
        assert!(analyzer
            .assess(&link("https://bit.ly/3xYz"))
            .indicators
            .contains(&"url_shortener".to_string()));
        assert!(analyzer
            .assess(&link("https://www.bank.com@203.0.113.9/"))
            .indicators
            .contains(&"userinfo_trick".to_string()));
        assert!(analyzer
            .assess(&link("https://xn--pple-43d.com/"))
            .indicators
            .contains(&"punycode_host".to_string()));
    }

    #[test]
    fn test_reputation_and_summary_use_max() {
        let analyzer = LinkAnalyzer::default();
        let mut assessments = vec![
            analyzer.assess(&link("https://newsletter.example.org/read")),
            analyzer.assess(&link("https://malware.example.com/")),
        ];
        let hosts = LinkAnalyzer::hosts_for_lookup(&assessments);
        assert_eq!(hosts.len(), 2);

        let mut verdicts = HashMap::new();
        verdicts.insert(
            "malware.example.com".to_string(),
            ReputationVerdict::Malicious {
                positives: 7,
                total: 70,
            },
        );
        LinkAnalyzer::apply_reputation(&mut assessments, &verdicts);

        let summary = LinkAnalyzer::summarize(&assessments);
        assert!((summary.score - 0.9).abs() < 1e-9);
        assert!(summary.has_indicator("reputation_malicious"));
        assert_eq!(LinkAnalyzer::summarize(&[]).score, 0.0);
    }

    fn chain(original: &str, targets: &[&str], content_type: Option<&str>) -> RedirectChain {
        let mut hops = Vec::new();
        let mut from = original.to_string();
        for to in targets {
            hops.push(crate::url_resolver::RedirectHop {
                from: from.clone(),
                to: to.to_string(),
                status: 302,
            });
            from = to.to_string();
        }
        RedirectChain {
            original_url: original.to_string(),
            hops,
            final_host: url::Url::parse(&from)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string)),
            final_url: from,
            content_type: content_type.map(str::to_string),
            truncated: false,
        }
    }

    #[test]
    fn test_redirect_chain_indicators() {
        let analyzer = LinkAnalyzer::default();
        let short = "https://bit.ly/3xYz";
        let mut assessments = vec![analyzer.assess(&link(short))];
        let risk_before = assessments[0].risk;

        let mut chains = HashMap::new();
        chains.insert(
            short.to_string(),
            chain(
                short,
                &[
                    "https://t.clicks.example.com/a",
                    "https://go.clicks.example.com/b",
                    "https://cdn.files.example.org/c",
                    "https://download.payload.example.net/invoice",
                ],
                Some("application/x-msdownload"),
            ),
        );
        analyzer.apply_redirects(&mut assessments, &chains);

        let a = &assessments[0];
        for indicator in [
            "url_shortener",
            "excessive_redirects",
            "domain_change",
            "multiple_domain_changes",
            "executable_download",
        ] {
            assert!(a.indicators.contains(&indicator.to_string()), "{indicator}");
        }
        assert!(a.risk > risk_before);
        assert_eq!(a.final_host.as_deref(), Some("download.payload.example.net"));

        // The landing host gets its own reputation lookup
        let hosts = LinkAnalyzer::hosts_for_lookup(&assessments);
        assert_eq!(hosts, vec!["bit.ly", "download.payload.example.net"]);
    }

    #[test]
    fn test_short_redirect_within_organization() {
        let analyzer = LinkAnalyzer::default();
        let original = "https://news.shop.example/r/42";
        let mut assessments = vec![analyzer.assess(&link(original))];

        let mut chains = HashMap::new();
        chains.insert(
            original.to_string(),
            chain(original, &["https://www.shop.example/autumn"], Some("text/html")),
        );
        analyzer.apply_redirects(&mut assessments, &chains);

        let a = &assessments[0];
        assert!(a.indicators.is_empty(), "{:?}", a.indicators);
        assert_eq!(a.risk, 0.0);
        assert_eq!(a.final_url.as_deref(), Some("https://www.shop.example/autumn"));
    }

    #[test]
    fn test_download_content_types() {
        assert_eq!(
            LinkAnalyzer::download_indicator("application/zip"),
            Some(("archive_download", 0.3))
        );
        assert_eq!(
            LinkAnalyzer::download_indicator("application/octet-stream"),
            Some(("binary_download", 0.3))
        );
        assert_eq!(
            LinkAnalyzer::download_indicator("Application/X-MSDownload"),
            Some(("executable_download", 0.5))
        );
        assert_eq!(LinkAnalyzer::download_indicator("text/html"), None);
    }

    #[test]
    fn test_reputation_of_landing_host() {
        let analyzer = LinkAnalyzer::default();
        let short = "https://bit.ly/abc";
        let mut assessments = vec![analyzer.assess(&link(short))];
        let mut chains = HashMap::new();
        chains.insert(
            short.to_string(),
            chain(short, &["https://login.evil.example.net/"], Some("text/html")),
        );
        analyzer.apply_redirects(&mut assessments, &chains);

        let mut verdicts = HashMap::new();
        verdicts.insert("bit.ly".to_string(), ReputationVerdict::Clean);
        verdicts.insert(
            "login.evil.example.net".to_string(),
            ReputationVerdict::Malicious {
                positives: 9,
                total: 70,
            },
        );
        LinkAnalyzer::apply_reputation(&mut assessments, &verdicts);

        let a = &assessments[0];
        assert!(a.risk >= 0.9);
        assert!(matches!(a.reputation, Some(ReputationVerdict::Malicious { .. })));
        assert!(a
            .evidence
            .iter()
            .any(|e| e.starts_with("Reputation of login.evil.example.net: malicious")));
    }
}
