//! SPF and DMARC policy lookups for sender domains whose messages arrive
//! without upstream authentication results.

use crate::cache::TtlCache;
use crate::domain_utils::DomainUtils;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 3,
            cache_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DnsLookupError {
    #[error("DNS lookup for {0} timed out")]
    Timeout(String),
    #[error("DNS lookup for {name} failed: {reason}")]
    Resolve { name: String, reason: String },
}

/// Qualifier of the terminal `all` mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfAll {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpfRecord {
    pub raw: String,
    pub all: Option<SpfAll>,
    pub mechanisms: usize,
}

impl SpfRecord {
    /// Parse a TXT string; `None` unless it is a `v=spf1` record
    pub fn parse(txt: &str) -> Option<Self> {
        let txt = txt.trim();
        let mut terms = txt.split_whitespace();
        if !terms.next()?.eq_ignore_ascii_case("v=spf1") {
            return None;
        }

        let mut all = None;
        let mut mechanisms = 0;
        for term in terms {
            mechanisms += 1;
            let lower = term.to_lowercase();
            all = match lower.as_str() {
                "all" | "+all" => Some(SpfAll::Pass),
                "-all" => Some(SpfAll::Fail),
                "~all" => Some(SpfAll::SoftFail),
                "?all" => Some(SpfAll::Neutral),
                _ => all,
            };
        }

        Some(Self {
            raw: txt.to_string(),
            all,
            mechanisms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

impl DmarcPolicy {
    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "quarantine" => DmarcPolicy::Quarantine,
            "reject" => DmarcPolicy::Reject,
            _ => DmarcPolicy::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmarcRecord {
    pub raw: String,
    pub policy: DmarcPolicy,
    pub subdomain_policy: Option<DmarcPolicy>,
    pub percentage: u8,
}

impl DmarcRecord {
    /// Parse a `_dmarc` TXT string; `None` unless it starts with `v=DMARC1`
    pub fn parse(txt: &str) -> Option<Self> {
        let txt = txt.trim();
        let mut tags = txt.split(';').map(str::trim).filter(|t| !t.is_empty());

        let (key, value) = tags.next()?.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("v") || !value.trim().eq_ignore_ascii_case("DMARC1")
        {
            return None;
        }

        let mut record = Self {
            raw: txt.to_string(),
            policy: DmarcPolicy::None,
            subdomain_policy: None,
            percentage: 100,
        };
        for tag in tags {
            let Some((key, value)) = tag.split_once('=') else {
                continue;
            };
            match key.trim().to_lowercase().as_str() {
                "p" => record.policy = DmarcPolicy::parse(value),
                "sp" => record.subdomain_policy = Some(DmarcPolicy::parse(value)),
                "pct" => record.percentage = value.trim().parse::<u8>().unwrap_or(100).min(100),
                _ => {}
            }
        }
        Some(record)
    }
}

/// Published sender policies for one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsAuthRecords {
    pub domain: String,
    pub spf: Option<SpfRecord>,
    pub dmarc: Option<DmarcRecord>,
}

enum Backend {
    Resolver(TokioAsyncResolver),
    /// Fixed TXT answers keyed by query name
    Static(HashMap<String, Vec<String>>),
}

pub struct DnsAuthValidator {
    backend: Backend,
    timeout: Duration,
    cache: TtlCache<String, DnsAuthRecords>,
}

impl DnsAuthValidator {
    /// Resolver from the system configuration, falling back to public defaults
    pub fn new(config: &DnsConfig) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            log::warn!("System resolver configuration unavailable ({e}), using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self::with_backend(Backend::Resolver(resolver), config)
    }

    /// Answer TXT queries from a fixed table instead of the network
    pub fn with_static_records(records: HashMap<String, Vec<String>>, config: &DnsConfig) -> Self {
        let records = records
            .into_iter()
            .map(|(name, txt)| (name.to_lowercase(), txt))
            .collect();
        Self::with_backend(Backend::Static(records), config)
    }

    fn with_backend(backend: Backend, config: &DnsConfig) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
            cache: TtlCache::new(Duration::from_secs(config.cache_ttl_seconds)),
        }
    }

    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsLookupError> {
        let resolver = match &self.backend {
            Backend::Static(records) => return Ok(records.get(name).cloned().unwrap_or_default()),
            Backend::Resolver(resolver) => resolver,
        };

        match timeout(self.timeout, resolver.txt_lookup(name)).await {
            Ok(Ok(lookup)) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk))
                        .collect::<String>()
                })
                .collect()),
            Ok(Err(e)) if Self::is_no_records(&e) => Ok(Vec::new()),
            Ok(Err(e)) => Err(DnsLookupError::Resolve {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DnsLookupError::Timeout(name.to_string())),
        }
    }

    fn is_no_records(error: &ResolveError) -> bool {
        matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
    }

    /// SPF and DMARC records of `domain`; an absent record is `None`, not an error
    pub async fn lookup(&self, domain: &str) -> Result<DnsAuthRecords, DnsLookupError> {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        if let Some(cached) = self.cache.get(&domain).await {
            log::debug!("Using cached DNS policy records for {domain}");
            return Ok(cached);
        }

        let dmarc_name = format!("_dmarc.{domain}");
        let (spf_txt, dmarc_txt) =
            tokio::join!(self.txt_records(&domain), self.txt_records(&dmarc_name));

        let spf_txt = spf_txt.inspect_err(|e| log::warn!("{e}"))?;
        let dmarc_txt = dmarc_txt.inspect_err(|e| log::warn!("{e}"))?;

        let mut dmarc = dmarc_txt.iter().find_map(|t| DmarcRecord::parse(t));
        if dmarc.is_none() {
            dmarc = self.organizational_dmarc(&domain).await?;
        }

        let records = DnsAuthRecords {
            spf: spf_txt.iter().find_map(|t| SpfRecord::parse(t)),
            dmarc,
            domain: domain.clone(),
        };
        log::debug!(
            "DNS policy for {domain}: spf={} dmarc={:?}",
            records.spf.is_some(),
            records.dmarc.as_ref().map(|d| d.policy)
        );

        self.cache.insert(domain, records.clone()).await;
        Ok(records)
    }

    /// DMARC record of the organizational domain, applied to a subdomain
    /// sender: `sp=` wins over `p=` when present
    async fn organizational_dmarc(
        &self,
        domain: &str,
    ) -> Result<Option<DmarcRecord>, DnsLookupError> {
        let organization = DomainUtils::registrable_domain(domain);
        if organization == domain {
            return Ok(None);
        }

        let txt = self
            .txt_records(&format!("_dmarc.{organization}"))
            .await
            .inspect_err(|e| log::warn!("{e}"))?;
        Ok(txt.iter().find_map(|t| DmarcRecord::parse(t)).map(|mut record| {
            log::debug!("Using DMARC record of {organization} for {domain}");
            if let Some(policy) = record.subdomain_policy {
                record.policy = policy;
            }
            record
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spf_record() {
        let spf = SpfRecord::parse("v=spf1 include:_spf.google.com ~all").unwrap();
        assert_eq!(spf.all, Some(SpfAll::SoftFail));
        assert_eq!(spf.mechanisms, 2);

        assert_eq!(SpfRecord::parse("v=spf1 -all").unwrap().all, Some(SpfAll::Fail));
        assert!(SpfRecord::parse("google-site-verification=abc").is_none());
        assert!(SpfRecord::parse("v=spf10 -all").is_none());
    }

    #[test]
    fn test_parse_dmarc_record() {
        let dmarc =
            DmarcRecord::parse("v=DMARC1; p=reject; sp=quarantine; pct=50; rua=mailto:x@y.z")
                .unwrap();
        assert_eq!(dmarc.policy, DmarcPolicy::Reject);
        assert_eq!(dmarc.subdomain_policy, Some(DmarcPolicy::Quarantine));
        assert_eq!(dmarc.percentage, 50);

        assert_eq!(
            DmarcRecord::parse("v=DMARC1; p=none").unwrap().policy,
            DmarcPolicy::None
        );
        assert!(DmarcRecord::parse("v=spf1 -all").is_none());
    }

    #[tokio::test]
    async fn test_lookup_with_static_records() {
        let mut records = HashMap::new();
        records.insert(
            "example.com".to_string(),
            vec!["some-verification=1".to_string(), "v=spf1 mx -all".to_string()],
        );
        records.insert(
            "_dmarc.example.com".to_string(),
            vec!["v=DMARC1; p=quarantine".to_string()],
        );
        let validator = DnsAuthValidator::with_static_records(records, &DnsConfig::default());

        let found = validator.lookup("Example.com.").await.unwrap();
        assert_eq!(found.domain, "example.com");
        assert_eq!(found.spf.unwrap().all, Some(SpfAll::Fail));
        assert_eq!(found.dmarc.unwrap().policy, DmarcPolicy::Quarantine);

        let missing = validator.lookup("nothing.example").await.unwrap();
        assert!(missing.spf.is_none() && missing.dmarc.is_none());
    }

    #[tokio::test]
    async fn test_subdomain_falls_back_to_organizational_dmarc() {
        let mut records = HashMap::new();
        records.insert(
            "_dmarc.example.org".to_string(),
            vec!["v=DMARC1; p=reject; sp=quarantine".to_string()],
        );
        records.insert(
            "_dmarc.example.co.uk".to_string(),
            vec!["v=DMARC1; p=reject".to_string()],
        );
        records.insert(
            "_dmarc.own.example.org".to_string(),
            vec!["v=DMARC1; p=none".to_string()],
        );
        let validator = DnsAuthValidator::with_static_records(records, &DnsConfig::default());

        let sub = validator.lookup("mail.example.org").await.unwrap();
        assert_eq!(sub.domain, "mail.example.org");
        assert_eq!(sub.dmarc.unwrap().policy, DmarcPolicy::Quarantine);

        let uk = validator.lookup("news.example.co.uk").await.unwrap();
        assert_eq!(uk.dmarc.unwrap().policy, DmarcPolicy::Reject);

        // A subdomain's own record takes precedence
        let own = validator.lookup("own.example.org").await.unwrap();
        assert_eq!(own.dmarc.unwrap().policy, DmarcPolicy::None);

        let unrelated = validator.lookup("mail.unlisted.example").await.unwrap();
        assert!(unrelated.dmarc.is_none());
    }
}
