//! Domain reputation lookups against a threat-intelligence HTTP API
//! (VirusTotal v2 `domain/report` response shape).

pub mod circuit_breaker;
pub mod rate_limiter;

use crate::cache::TtlCache;
use circuit_breaker::{BreakerState, CircuitBreaker};
use rate_limiter::RateLimiter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum ReputationVerdict {
    Malicious { positives: u32, total: u32 },
    Suspicious { positives: u32, total: u32 },
    Clean,
    Unknown,
}

/// Subset of the report body that drives the verdict
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainReport {
    #[serde(default)]
    pub response_code: i32,
    #[serde(default)]
    pub positives: Option<u32>,
    #[serde(default)]
    pub total: Option<u32>,
}

impl ReputationVerdict {
    pub fn from_report(report: &DomainReport) -> Self {
        if report.response_code == 0 {
            return ReputationVerdict::Unknown;
        }
        let positives = report.positives.unwrap_or(0);
        let total = report.total.unwrap_or(0);
        match positives {
            p if p > 2 => ReputationVerdict::Malicious { positives, total },
            p if p >= 1 => ReputationVerdict::Suspicious { positives, total },
            _ => ReputationVerdict::Clean,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReputationError {
    #[error("reputation endpoint not configured")]
    NotConfigured,
    #[error("rate limit reached, retry in {0:?}")]
    RateLimited(Duration),
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("request timed out")]
    Timeout,
    #[error("HTTP status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ReputationError {
    /// Timeouts, connection failures, 429 and 5xx are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ReputationError::Timeout | ReputationError::Network(_) => true,
            ReputationError::Http(status) => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ReputationError::Timeout
        } else {
            ReputationError::Network(error.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub enabled: bool,
    /// Lookups are skipped while no endpoint is set
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_seconds: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            api_key: None,
            timeout_seconds: 5,
            cache_ttl_seconds: 3600,
            rate_limit_requests: 4,
            rate_limit_window_seconds: 60,
            max_attempts: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5000,
            failure_threshold: 5,
            cooldown_seconds: 60,
        }
    }
}

/// Retry delays starting at `base` and doubling up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { next: base, max }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Sleep for the next delay and return it
    pub async fn wait(&mut self) -> Duration {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
        delay
    }
}

pub struct ReputationClient {
    http: Client,
    config: ReputationConfig,
    cache: TtlCache<String, ReputationVerdict>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl ReputationClient {
    pub fn new(config: ReputationConfig) -> Result<Self, ReputationError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .user_agent(concat!("phishguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ReputationError::from_reqwest)?;

        Ok(Self {
            http,
            cache: TtlCache::new(Duration::from_secs(config.cache_ttl_seconds)),
            limiter: RateLimiter::new(
                config.rate_limit_requests,
                Duration::from_secs(config.rate_limit_window_seconds),
            ),
            breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.cooldown_seconds),
            ),
            config,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.endpoint.is_some()
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        )
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Verdict for a domain; `None` when reputation data is unavailable
    pub async fn lookup(&self, domain: &str) -> Option<ReputationVerdict> {
        match self.try_lookup(domain).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                log::warn!("Reputation lookup for {domain} unavailable: {e}");
                None
            }
        }
    }

    /// Look up several hosts; the flag is true when any lookup was unavailable
    pub async fn lookup_many(&self, hosts: &[String]) -> (HashMap<String, ReputationVerdict>, bool) {
        let mut verdicts = HashMap::new();
        let mut degraded = false;
        for host in hosts {
            match self.lookup(host).await {
                Some(verdict) => {
                    verdicts.insert(host.clone(), verdict);
                }
                None => {
                    degraded = true;
                    verdicts.insert(host.clone(), ReputationVerdict::Unknown);
                }
            }
        }
        (verdicts, degraded)
    }

    pub async fn try_lookup(&self, domain: &str) -> Result<ReputationVerdict, ReputationError> {
        if !self.is_enabled() {
            return Err(ReputationError::NotConfigured);
        }

        let key = domain.trim().trim_end_matches('.').to_lowercase();
        if let Some(cached) = self.cache.get(&key).await {
            log::debug!("Using cached reputation for {key}: {cached:?}");
            return Ok(cached);
        }

        let verdict = self.fetch_with_retry(&key).await?;
        log::debug!("Reputation for {key}: {verdict:?}");
        self.cache.insert(key, verdict.clone()).await;
        Ok(verdict)
    }

    async fn fetch_with_retry(&self, domain: &str) -> Result<ReputationVerdict, ReputationError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;

            if !self.breaker.allow_request() {
                return Err(ReputationError::CircuitOpen);
            }
            if !self.limiter.try_acquire() {
                self.breaker.release_probe();
                return Err(ReputationError::RateLimited(self.limiter.retry_after()));
            }

            match self.fetch_once(domain).await {
                Ok(verdict) => {
                    self.breaker.record_success();
                    return Ok(verdict);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if !e.is_retryable() || attempt >= max_attempts {
                        return Err(e);
                    }
                    let delay = backoff.wait().await;
                    log::debug!(
                        "Reputation attempt {attempt}/{max_attempts} for {domain} failed ({e}), retried after {delay:?}"
                    );
                }
            }
        }
    }

    async fn fetch_once(&self, domain: &str) -> Result<ReputationVerdict, ReputationError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or(ReputationError::NotConfigured)?;

        let mut request = self.http.get(endpoint).query(&[("domain", domain)]);
        if let Some(key) = &self.config.api_key {
            request = request.query(&[("apikey", key.as_str())]);
        }

        let response = request.send().await.map_err(ReputationError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReputationError::Http(status.as_u16()));
        }

        let report: DomainReport = response
            .json()
            .await
            .map_err(|e| ReputationError::Decode(e.to_string()))?;
        Ok(ReputationVerdict::from_report(&report))
    }
}
