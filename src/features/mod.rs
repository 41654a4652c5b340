pub mod anomaly;
pub mod authentication;
pub mod content;
pub mod link_analyzer;

use crate::email::ParsedEmail;
use serde::{Deserialize, Serialize};

/// Output of one analyzer: a [0, 1] risk plus the reasons behind it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureScore {
    pub feature_name: String,
    pub score: f64,
    pub evidence: Vec<String>,
    /// Short machine-readable tags, e.g. `spf_fail`
    pub indicators: Vec<String>,
}

impl FeatureScore {
    pub fn new(feature_name: &str) -> Self {
        Self {
            feature_name: feature_name.to_string(),
            ..Default::default()
        }
    }

    /// Add a risk contribution; the running score is capped at 1.0
    pub fn add(&mut self, risk: f64, indicator: &str, evidence: impl Into<String>) {
        self.score = (self.score + risk).clamp(0.0, 1.0);
        self.push_indicator(indicator);
        self.evidence.push(evidence.into());
    }

    /// Record evidence that does not change the score
    pub fn note(&mut self, evidence: impl Into<String>) {
        self.evidence.push(evidence.into());
    }

    pub fn push_indicator(&mut self, indicator: &str) {
        if !indicator.is_empty() && !self.indicators.iter().any(|i| i == indicator) {
            self.indicators.push(indicator.to_string());
        }
    }

    /// Merge another score into this one, keeping the higher risk
    pub fn absorb_max(&mut self, other: FeatureScore) {
        self.score = self.score.max(other.score);
        for indicator in &other.indicators {
            self.push_indicator(indicator);
        }
        self.evidence.extend(other.evidence);
    }

    pub fn has_indicator(&self, indicator: &str) -> bool {
        self.indicators.iter().any(|i| i == indicator)
    }
}

/// Synchronous analyzer over a parsed message
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, email: &ParsedEmail) -> FeatureScore;
    fn name(&self) -> &str;
}
