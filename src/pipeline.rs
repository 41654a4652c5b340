//! Runs every analyzer over a parsed message and folds the results into a
//! single verdict.
//!
//! Static analyzers (content, rules, anomaly, URL structure) always run.
//! Network lookups share one deadline: the URL branch follows redirects and
//! then checks reputation of every host reached, while DNS authentication
//! runs alongside it. A signal whose lookup fails or misses the deadline
//! keeps its static part and is reported as degraded.

use crate::config::Config;
use crate::dns_auth::{DnsAuthRecords, DnsAuthValidator};
use crate::email::ParsedEmail;
use crate::features::anomaly::AnomalyDetector;
use crate::features::authentication::{parse_authentication, AuthenticationAnalyzer};
use crate::features::content::ContentAnalyzer;
use crate::features::link_analyzer::LinkAnalyzer;
use crate::features::FeatureScore;
use crate::reputation::ReputationClient;
use crate::rule_engine::RuleEngine;
use crate::scoring::{Action, ScoreOutcome, ScoringEngine, Signal, SubScores, ThreatLevel};
use crate::statistics::StatEvent;
use crate::url_resolver::UrlResolver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::timeout_at;

const PHISHING_NLP_THRESHOLD: f64 = 0.4;
const PHISHING_URL_THRESHOLD: f64 = 0.5;
const PHISHING_FINAL_THRESHOLD: f64 = 0.6;
const SPAM_TERM_THRESHOLD: usize = 3;
const MALWARE_INDICATORS: &[&str] = &["dangerous_attachment", "double_extension"];
const MAX_EXPLAINED_CONTRIBUTORS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReport {
    pub score: f64,
    pub weight: f64,
    pub contribution: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub message_id: Option<String>,
    pub final_score: f64,
    pub action: Action,
    pub threat_level: ThreatLevel,
    pub sub_scores: BTreeMap<Signal, SignalReport>,
    pub indicators: Vec<String>,
    pub is_phishing: bool,
    pub is_spam: bool,
    pub is_malware: bool,
    pub explanation: String,
    /// Signals computed without their network-backed part
    pub degraded: Vec<Signal>,
    pub analyzed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Verdict {
    /// Statistics event describing this verdict
    pub fn stat_event(&self) -> StatEvent {
        StatEvent::Analyzed {
            action: self.action,
            final_score: self.final_score,
            indicators: self.indicators.clone(),
            degraded: !self.degraded.is_empty(),
            duration_ms: self.duration_ms,
        }
    }
}

pub struct ThreatAnalyzer {
    scoring: ScoringEngine,
    content: ContentAnalyzer,
    links: LinkAnalyzer,
    authentication: AuthenticationAnalyzer,
    anomaly: AnomalyDetector,
    rules: RuleEngine,
    resolver: Option<UrlResolver>,
    reputation: Option<ReputationClient>,
    dns: Option<DnsAuthValidator>,
    analysis_timeout: Duration,
}

impl ThreatAnalyzer {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let scoring = ScoringEngine::new(config.scoring.weights, config.scoring.thresholds)?;
        let rules = RuleEngine::new(config.rules.clone())?;

        let reputation = if config.reputation.enabled && config.reputation.endpoint.is_some() {
            Some(ReputationClient::new(config.reputation.clone())?)
        } else {
            log::info!("URL reputation lookups disabled (no endpoint configured)");
            None
        };

        let resolver = if config.redirects.enabled {
            Some(UrlResolver::new(config.redirects.clone())?)
        } else {
            log::info!("Redirect following disabled");
            None
        };

        let dns = if config.dns.enabled {
            Some(DnsAuthValidator::new(&config.dns))
        } else {
            log::info!("DNS authentication lookups disabled");
            None
        };

        Ok(Self {
            scoring,
            content: ContentAnalyzer::new(config.content.clone()),
            links: LinkAnalyzer::new(config.urls.clone()),
            authentication: AuthenticationAnalyzer::new(),
            anomaly: AnomalyDetector::new(config.anomaly.clone()),
            rules,
            resolver,
            reputation,
            dns,
            analysis_timeout: Duration::from_secs(config.analysis.timeout_seconds.max(1)),
        })
    }

    pub fn with_resolver(mut self, resolver: UrlResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_reputation(mut self, client: ReputationClient) -> Self {
        self.reputation = Some(client);
        self
    }

    pub fn with_dns(mut self, validator: DnsAuthValidator) -> Self {
        self.dns = Some(validator);
        self
    }

    pub fn with_timeout(mut self, analysis_timeout: Duration) -> Self {
        self.analysis_timeout = analysis_timeout;
        self
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    pub async fn analyze(&self, email: &ParsedEmail) -> Verdict {
        let started = Instant::now();
        let mut degraded = Vec::new();

        let content = self.content.analyze(email);
        let rules = self.rules.evaluate(email).to_feature_score();
        let anomaly = self.anomaly.analyze(email);
        let assessments = self.links.assess_all(email);
        let auth_summary = parse_authentication(&email.headers);

        let dns_domain = if auth_summary.needs_dns_lookup() {
            email.sender_domain()
        } else {
            None
        };

        let deadline = tokio::time::Instant::now() + self.analysis_timeout;
        let url_lookups = async {
            let mut assessments = assessments;
            let mut url_degraded = false;

            if let Some(resolver) = &self.resolver {
                let links = resolver.select_links(&assessments);
                if !links.is_empty() {
                    match timeout_at(deadline, resolver.resolve_all(&links)).await {
                        Ok(chains) => self.links.apply_redirects(&mut assessments, &chains),
                        Err(_) => {
                            log::warn!(
                                "Redirect resolution exceeded the {:?} analysis timeout",
                                self.analysis_timeout
                            );
                            url_degraded = true;
                        }
                    }
                }
            }

            let hosts = LinkAnalyzer::hosts_for_lookup(&assessments);
            match &self.reputation {
                Some(client) if client.is_enabled() && !hosts.is_empty() => {
                    match timeout_at(deadline, client.lookup_many(&hosts)).await {
                        Ok((verdicts, partial)) => {
                            LinkAnalyzer::apply_reputation(&mut assessments, &verdicts);
                            url_degraded |= partial;
                        }
                        Err(_) => {
                            log::warn!(
                                "Reputation lookups exceeded the {:?} analysis timeout",
                                self.analysis_timeout
                            );
                            url_degraded = true;
                        }
                    }
                }
                _ => {}
            }
            (assessments, url_degraded)
        };
        let dns_lookup = async {
            match (&self.dns, dns_domain.as_deref()) {
                (Some(validator), Some(domain)) => Some(validator.lookup(domain).await),
                _ => None,
            }
        };
        let ((assessments, url_degraded), dns_result) =
            tokio::join!(url_lookups, timeout_at(deadline, dns_lookup));

        if url_degraded {
            degraded.push(Signal::Url);
        }

        let records: Option<DnsAuthRecords> = match dns_result {
            Ok(Some(Ok(records))) => Some(records),
            Ok(Some(Err(e))) => {
                log::warn!("DNS authentication lookup failed: {e}");
                degraded.push(Signal::Header);
                None
            }
            Ok(None) => None,
            Err(_) => {
                log::warn!(
                    "DNS lookups exceeded the {:?} analysis timeout",
                    self.analysis_timeout
                );
                degraded.push(Signal::Header);
                None
            }
        };

        let url = LinkAnalyzer::summarize(&assessments);
        let header = self
            .authentication
            .analyze(email, &auth_summary, records.as_ref());

        let features: BTreeMap<Signal, &FeatureScore> = [
            (Signal::Nlp, &content.score),
            (Signal::Url, &url),
            (Signal::Header, &header),
            (Signal::Rules, &rules),
            (Signal::Anomaly, &anomaly),
        ]
        .into_iter()
        .collect();

        let sub_scores = SubScores {
            nlp: content.score.score,
            url: url.score,
            header: header.score,
            rules: rules.score,
            anomaly: anomaly.score,
        };
        let outcome = self.scoring.evaluate(&sub_scores);

        let mut indicators: Vec<String> = Vec::new();
        for feature in features.values() {
            for indicator in &feature.indicators {
                if !indicators.contains(indicator) {
                    indicators.push(indicator.clone());
                }
            }
        }

        let reports = outcome
            .contributions
            .iter()
            .map(|c| {
                let evidence = features
                    .get(&c.signal)
                    .map(|f| f.evidence.clone())
                    .unwrap_or_default();
                (
                    c.signal,
                    SignalReport {
                        score: c.score,
                        weight: c.weight,
                        contribution: c.contribution,
                        evidence,
                    },
                )
            })
            .collect();

        let is_phishing = sub_scores.nlp >= PHISHING_NLP_THRESHOLD
            || sub_scores.url >= PHISHING_URL_THRESHOLD
            || outcome.final_score >= PHISHING_FINAL_THRESHOLD;
        let is_spam = content.spam_term_count() >= SPAM_TERM_THRESHOLD;
        let is_malware = MALWARE_INDICATORS.iter().any(|i| anomaly.has_indicator(i));

        let explanation = self.explain(&outcome, &degraded);
        let duration_ms = started.elapsed().as_millis() as u64;

        log::info!(
            "Verdict for {}: {} (score {:.3}, {} indicators, {}ms)",
            email.message_id.as_deref().unwrap_or("<no message-id>"),
            outcome.action,
            outcome.final_score,
            indicators.len(),
            duration_ms
        );
        log::debug!("Sub-scores: {sub_scores:?}");

        Verdict {
            message_id: email.message_id.clone(),
            final_score: outcome.final_score,
            action: outcome.action,
            threat_level: outcome.threat_level,
            sub_scores: reports,
            indicators,
            is_phishing,
            is_spam,
            is_malware,
            explanation,
            degraded,
            analyzed_at: Utc::now(),
            duration_ms,
        }
    }

    fn explain(&self, outcome: &ScoreOutcome, degraded: &[Signal]) -> String {
        let threshold = self
            .scoring
            .describe_threshold(outcome.final_score, outcome.action);
        let contributors: Vec<String> = outcome
            .main_contributors()
            .into_iter()
            .take(MAX_EXPLAINED_CONTRIBUTORS)
            .map(|c| format!("{} ({:.2})", c.signal, c.contribution))
            .collect();

        let mut sentence = if contributors.is_empty() {
            format!("{}: {threshold} with no risk signals", capitalize(&outcome.action.to_string()))
        } else {
            format!(
                "{}: {threshold}, driven by {}",
                capitalize(&outcome.action.to_string()),
                contributors.join(", ")
            )
        };
        if !degraded.is_empty() {
            let names: Vec<String> = degraded.iter().map(Signal::to_string).collect();
            sentence.push_str(&format!(" (degraded: {})", names.join(", ")));
        }
        sentence.push('.');
        sentence
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
