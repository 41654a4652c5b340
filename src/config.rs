use crate::dns_auth::DnsConfig;
use crate::features::anomaly::AnomalyConfig;
use crate::features::content::ContentConfig;
use crate::features::link_analyzer::UrlConfig;
use crate::reputation::ReputationConfig;
use crate::rule_engine::{default_rules, Rule, RuleEngine};
use crate::scoring::{Thresholds, Weights};
use crate::url_resolver::RedirectConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/phishguard.yaml";
pub const API_KEY_ENV: &str = "PHISHGUARD_REPUTATION_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub body_limit_bytes: usize,
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            body_limit_bytes: 10 * 1024 * 1024,
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: Weights,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Upper bound for the network-backed lookups of one message
    pub timeout_seconds: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { timeout_seconds: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub scoring: ScoringConfig,
    pub analysis: AnalysisConfig,
    pub content: ContentConfig,
    pub urls: UrlConfig,
    pub redirects: RedirectConfig,
    pub reputation: ReputationConfig,
    pub dns: DnsConfig,
    pub anomaly: AnomalyConfig,
    pub rules: Vec<Rule>,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            scoring: ScoringConfig::default(),
            analysis: AnalysisConfig::default(),
            content: ContentConfig::default(),
            urls: UrlConfig::default(),
            redirects: RedirectConfig::default(),
            reputation: ReputationConfig::default(),
            dns: DnsConfig::default(),
            anomaly: AnomalyConfig::default(),
            rules: default_rules(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse configuration file {path}"))?;
        Ok(config)
    }

    /// Load `path`, falling back to the defaults when the file does not exist
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            log::warn!("Configuration file {path} not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check weights, thresholds and rule patterns
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scoring
            .weights
            .validate()
            .context("scoring.weights")?;
        self.scoring
            .thresholds
            .validate()
            .context("scoring.thresholds")?;
        RuleEngine::new(self.rules.clone()).context("rules")?;
        if self.analysis.timeout_seconds == 0 {
            anyhow::bail!("analysis.timeout_seconds must be greater than 0");
        }
        if self.redirects.enabled && self.redirects.timeout_seconds == 0 {
            anyhow::bail!("redirects.timeout_seconds must be greater than 0");
        }
        if self.server.body_limit_bytes == 0 {
            anyhow::bail!("server.body_limit_bytes must be greater than 0");
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_api_key(std::env::var(API_KEY_ENV).ok());
    }

    fn apply_api_key(&mut self, key: Option<String>) {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            log::debug!("Using reputation API key from {API_KEY_ENV}");
            self.reputation.api_key = Some(key.trim().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_engine::Criteria;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.body_limit_bytes, 10 * 1024 * 1024);
        assert!(config.scoring.thresholds.quarantine.is_none());
        assert!(!config.rules.is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
scoring:
  thresholds:
    tag: 0.3
    flag: 0.5
    block: 0.9
reputation:
  endpoint: "https://intel.example.net/domain/report"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scoring.thresholds.tag, 0.3);
        assert_eq!(config.scoring.weights, Weights::default());
        assert_eq!(
            config.reputation.endpoint.as_deref(),
            Some("https://intel.example.net/domain/report")
        );
        assert_eq!(config.reputation.rate_limit_requests, 4);
        assert_eq!(config.rules, default_rules());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = Config::default();
        config.scoring.weights.nlp = 0.9;
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("weights"));
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let mut config = Config::default();
        config.scoring.thresholds.flag = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_names_bad_rule() {
        let mut config = Config::default();
        config.rules.push(Rule {
            name: "Broken pattern".to_string(),
            weight: 0.5,
            criteria: Criteria::SubjectPattern {
                pattern: "(unclosed".to_string(),
            },
            enabled: true,
        });
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("Broken pattern"));
    }

    #[test]
    fn test_api_key_override() {
        let mut config = Config::default();
        config.apply_api_key(Some("  secret-key ".to_string()));
        assert_eq!(config.reputation.api_key.as_deref(), Some("secret-key"));

        config.apply_api_key(Some("   ".to_string()));
        assert_eq!(config.reputation.api_key.as_deref(), Some("secret-key"));
    }

    #[test]
    fn test_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("phishguard-config-{}.yaml", std::process::id()));
        let path = path.to_string_lossy().to_string();

        let mut config = Config::default();
        config.server.cors_permissive = true;
        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/phishguard.yaml").unwrap();
        assert_eq!(config, Config::default());
    }
}
