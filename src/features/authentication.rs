//! Sender authentication signal: SPF, DKIM and DMARC results recorded by
//! upstream MTAs, sender/reply alignment, and DNS policy records when the
//! headers carry no verdict of their own.

use super::{FeatureExtractor, FeatureScore};
use crate::dns_auth::{DmarcPolicy, DnsAuthRecords};
use crate::domain_utils::DomainUtils;
use crate::email::{Headers, ParsedEmail};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref AUTH_RESULT: Regex =
        Regex::new(r"(?i)\b(spf|dkim|dmarc)\s*=\s*([a-z]+)").expect("valid auth regex");
    static ref AUTH_HEADER_D: Regex =
        Regex::new(r"(?i)\bheader\.d\s*=\s*([a-z0-9.-]+)").expect("valid header.d regex");
    static ref DKIM_D_TAG: Regex =
        Regex::new(r"(?i)(?:^|;)\s*d\s*=\s*([a-z0-9.-]+)").expect("valid d= regex");
    static ref EMBEDDED_ADDRESS: Regex =
        Regex::new(r"(?i)[a-z0-9._%+-]+@([a-z0-9-]+(\.[a-z0-9-]+)+)").expect("valid address regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl AuthResult {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pass" => Some(AuthResult::Pass),
            "fail" | "hardfail" => Some(AuthResult::Fail),
            "softfail" => Some(AuthResult::SoftFail),
            "neutral" => Some(AuthResult::Neutral),
            "none" => Some(AuthResult::None),
            "temperror" => Some(AuthResult::TempError),
            "permerror" => Some(AuthResult::PermError),
            _ => None,
        }
    }
}

/// What the message headers say about authentication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationSummary {
    pub spf: Option<AuthResult>,
    pub dkim: Option<AuthResult>,
    pub dmarc: Option<AuthResult>,
    /// Signing domains from DKIM-Signature `d=` and `header.d=`
    pub dkim_domains: Vec<String>,
}

impl AuthenticationSummary {
    /// DNS records are consulted only when SPF or DMARC was never evaluated upstream
    pub fn needs_dns_lookup(&self) -> bool {
        self.spf.is_none() || self.dmarc.is_none()
    }
}

/// Read Authentication-Results (every instance), Received-SPF and DKIM-Signature.
/// The first result per mechanism wins, except that any DKIM pass counts.
pub fn parse_authentication(headers: &Headers) -> AuthenticationSummary {
    let mut summary = AuthenticationSummary::default();

    for value in headers.get_all("authentication-results") {
        for caps in AUTH_RESULT.captures_iter(value) {
            let Some(result) = AuthResult::parse(&caps[2]) else {
                continue;
            };
            let slot = match caps[1].to_lowercase().as_str() {
                "spf" => &mut summary.spf,
                "dkim" => &mut summary.dkim,
                _ => &mut summary.dmarc,
            };
            if slot.is_none() {
                *slot = Some(result);
            } else if caps[1].eq_ignore_ascii_case("dkim") && result == AuthResult::Pass {
                *slot = Some(AuthResult::Pass);
            }
        }
        for caps in AUTH_HEADER_D.captures_iter(value) {
            push_domain(&mut summary.dkim_domains, &caps[1]);
        }
    }

    if summary.spf.is_none() {
        summary.spf = headers
            .get("received-spf")
            .and_then(|v| v.split_whitespace().next())
            .and_then(AuthResult::parse);
    }

    for signature in headers.get_all("dkim-signature") {
        if let Some(caps) = DKIM_D_TAG.captures(signature) {
            push_domain(&mut summary.dkim_domains, &caps[1]);
        }
    }

    summary
}

fn push_domain(domains: &mut Vec<String>, domain: &str) {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    if !domain.is_empty() && !domains.contains(&domain) {
        domains.push(domain);
    }
}

#[derive(Debug, Default)]
pub struct AuthenticationAnalyzer;

impl AuthenticationAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(
        &self,
        email: &ParsedEmail,
        summary: &AuthenticationSummary,
        records: Option<&DnsAuthRecords>,
    ) -> FeatureScore {
        let mut score = FeatureScore::new("header");
        let from_domain = email.from.as_ref().and_then(|a| a.domain());

        // permerror counts as a failure for every mechanism
        match summary.spf {
            Some(AuthResult::Fail) => score.add(0.3, "spf_fail", "SPF check failed"),
            Some(AuthResult::PermError) => {
                score.add(0.3, "spf_fail", "SPF permanent error (broken sender policy)")
            }
            Some(AuthResult::SoftFail) => score.add(0.15, "spf_softfail", "SPF soft fail"),
            None | Some(AuthResult::None) => score.add(0.1, "spf_missing", "No SPF result"),
            Some(other) => score.note(format!("SPF result {other:?}")),
        }

        match summary.dkim {
            Some(AuthResult::Fail) => {
                score.add(0.3, "dkim_fail", "DKIM signature failed verification")
            }
            Some(AuthResult::PermError) => {
                score.add(0.3, "dkim_fail", "DKIM permanent error (unusable signature)")
            }
            None | Some(AuthResult::None) if summary.dkim_domains.is_empty() => {
                score.add(0.1, "dkim_missing", "Message is not DKIM signed")
            }
            Some(other) => score.note(format!("DKIM result {other:?}")),
            None => score.note("DKIM signature present but unverified"),
        }

        match summary.dmarc {
            Some(AuthResult::Fail) => score.add(0.4, "dmarc_fail", "DMARC check failed"),
            Some(AuthResult::PermError) => {
                score.add(0.4, "dmarc_fail", "DMARC permanent error (broken policy)")
            }
            None | Some(AuthResult::None) => score.add(0.1, "dmarc_missing", "No DMARC result"),
            Some(other) => score.note(format!("DMARC result {other:?}")),
        }

        if let Some(from) = &from_domain {
            if !summary.dkim_domains.is_empty()
                && !summary
                    .dkim_domains
                    .iter()
                    .any(|d| DomainUtils::same_organization(d, from))
            {
                score.add(
                    0.15,
                    "dkim_misaligned",
                    format!(
                        "DKIM signed by {} but sent from {from}",
                        summary.dkim_domains.join(", ")
                    ),
                );
            }

            if let Some(reply) = email.reply_to.as_ref().and_then(|a| a.domain()) {
                if !DomainUtils::same_organization(&reply, from) {
                    score.add(
                        0.15,
                        "reply_to_mismatch",
                        format!("Reply-To domain {reply} differs from From domain {from}"),
                    );
                }
            }

            if let Some(bounce) = email.return_path.as_ref().and_then(|a| a.domain()) {
                if !DomainUtils::same_organization(&bounce, from) {
                    score.add(
                        0.1,
                        "return_path_mismatch",
                        format!("Return-Path domain {bounce} differs from From domain {from}"),
                    );
                }
            }

            let display = email.from.as_ref().and_then(|a| a.display_name.as_deref());
            if let Some(caps) = display.and_then(|name| EMBEDDED_ADDRESS.captures(name)) {
                let shown = caps[1].to_lowercase();
                if !DomainUtils::same_organization(&shown, from) {
                    score.add(
                        0.2,
                        "display_name_spoof",
                        format!("Display name shows an address at {shown}, sent from {from}"),
                    );
                }
            }
        }

        let has_message_id = email
            .message_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        if !has_message_id {
            score.add(0.05, "missing_message_id", "No Message-ID header");
        }

        if let Some(records) = records {
            if records.spf.is_none() && records.dmarc.is_none() {
                score.add(
                    0.2,
                    "no_sender_policy",
                    format!("{} publishes neither SPF nor DMARC", records.domain),
                );
            }
            if let Some(dmarc) = &records.dmarc {
                if dmarc.policy == DmarcPolicy::None {
                    score.push_indicator("dmarc_policy_none");
                    score.note(format!("{} DMARC policy is p=none", records.domain));
                }
            }
        }

        score
    }
}

impl FeatureExtractor for AuthenticationAnalyzer {
    fn extract(&self, email: &ParsedEmail) -> FeatureScore {
        self.analyze(email, &parse_authentication(&email.headers), None)
    }

    fn name(&self) -> &str {
        "header"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_auth::{DmarcRecord, SpfRecord};

    fn email(raw: &str) -> ParsedEmail {
        ParsedEmail::from_raw(raw).unwrap()
    }

    #[test]
    fn test_parse_authentication_results() {
        let parsed = email(
            "Authentication-Results: mx.example.org; spf=softfail smtp.mailfrom=x.com;\n \
             dkim=fail header.d=x.com; dkim=pass header.d=esp.net; dmarc=fail\n\
             Authentication-Results: relay.example.org; spf=pass\n\
             DKIM-Signature: v=1; a=rsa-sha256; d=esp.net; s=s1\n\
             From: a@x.com\n\nbody",
        );
        let summary = parse_authentication(&parsed.headers);
        assert_eq!(summary.spf, Some(AuthResult::SoftFail));
        assert_eq!(summary.dkim, Some(AuthResult::Pass));
        assert_eq!(summary.dmarc, Some(AuthResult::Fail));
        assert_eq!(summary.dkim_domains, vec!["x.com", "esp.net"]);
        assert!(!summary.needs_dns_lookup());
    }

    #[test]
    fn test_received_spf_fallback() {
        let parsed = email("Received-SPF: Fail (domain does not designate)\nFrom: a@x.com\n\nhi");
        let summary = parse_authentication(&parsed.headers);
        assert_eq!(summary.spf, Some(AuthResult::Fail));
        assert!(summary.needs_dns_lookup());
    }

    #[test]
    fn test_failed_authentication_and_mismatches() {
        let parsed = email(
            "From: \"security@paypal.com\" <alerts@paypa1-verify.com>\n\
             Reply-To: collect@gmail.com\n\
             Return-Path: <bounce@mailer.ru>\n\
             Authentication-Results: mx; spf=fail; dkim=fail header.d=other.net; dmarc=fail\n\n\
             body",
        );
        let analyzer = AuthenticationAnalyzer::new();
        let score = analyzer.analyze(&parsed, &parse_authentication(&parsed.headers), None);

        for indicator in [
            "spf_fail",
            "dkim_fail",
            "dmarc_fail",
            "dkim_misaligned",
            "reply_to_mismatch",
            "return_path_mismatch",
            "display_name_spoof",
            "missing_message_id",
        ] {
            assert!(score.has_indicator(indicator), "missing {indicator}");
        }
        assert_eq!(score.score, 1.0);
    }

    #[test]
    fn test_clean_authentication() {
        let parsed = email(
            "From: News <news@example.com>\n\
             Message-ID: <1@example.com>\n\
             DKIM-Signature: v=1; d=example.com; s=k\n\
             Authentication-Results: mx; spf=pass; dkim=pass; dmarc=pass\n\nhello",
        );
        let score = AuthenticationAnalyzer::new().extract(&parsed);
        assert_eq!(score.score, 0.0);
        assert!(score.indicators.is_empty());
    }

    #[test]
    fn test_dns_records_add_policy_evidence() {
        let parsed = email("From: a@nopolicy.example\nMessage-ID: <x@y>\n\nhi");
        let summary = parse_authentication(&parsed.headers);
        let analyzer = AuthenticationAnalyzer::new();

        let bare = DnsAuthRecords {
            domain: "nopolicy.example".into(),
            spf: None,
            dmarc: None,
        };
        let score = analyzer.analyze(&parsed, &summary, Some(&bare));
        assert!(score.has_indicator("no_sender_policy"));

        let monitored = DnsAuthRecords {
            domain: "nopolicy.example".into(),
            spf: Some(SpfRecord::parse("v=spf1 -all").unwrap()),
            dmarc: Some(DmarcRecord::parse("v=DMARC1; p=none").unwrap()),
        };
        let score = analyzer.analyze(&parsed, &summary, Some(&monitored));
        assert!(!score.has_indicator("no_sender_policy"));
        assert!(score.has_indicator("dmarc_policy_none"));
    }

    #[test]
    fn test_permerror_scores_like_fail() {
        let analyzer = AuthenticationAnalyzer::new();
        let score_for = |results: &str| {
            let parsed = email(&format!(
                "From: a@shop.example\nMessage-ID: <m@shop.example>\n\
                 Authentication-Results: mx; {results}\n\nhi"
            ));
            let summary = parse_authentication(&parsed.headers);
            analyzer.analyze(&parsed, &summary, None)
        };

        let cases = [("spf", "spf_fail"), ("dkim", "dkim_fail"), ("dmarc", "dmarc_fail")];
        for (mechanism, indicator) in cases {
            let others: Vec<String> = ["spf", "dkim", "dmarc"]
                .iter()
                .filter(|m| **m != mechanism)
                .map(|m| format!("{m}=pass"))
                .collect();
            let perm = score_for(&format!("{mechanism}=permerror; {}", others.join("; ")));
            let fail = score_for(&format!("{mechanism}=fail; {}", others.join("; ")));

            assert!(perm.score > 0.0, "{mechanism}");
            assert!((perm.score - fail.score).abs() < 1e-9, "{mechanism}");
            assert!(perm.has_indicator(indicator), "{mechanism}");
        }
        let spf_perm = score_for("spf=permerror; dkim=pass; dmarc=pass");
        assert!(!spf_perm.has_indicator("spf_missing"));
    }
}
