//! Weighted aggregation of the five analysis signals into one risk score
//! and the mapping of that score onto an action.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
/// Final scores are rounded to this precision so boundary inputs land on the threshold
const SCORE_PRECISION: f64 = 1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Tag,
    Flag,
    Quarantine,
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Allow => "allow",
            Action::Tag => "tag",
            Action::Flag => "flag",
            Action::Quarantine => "quarantine",
            Action::Block => "block",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.8 => ThreatLevel::Critical,
            s if s >= 0.6 => ThreatLevel::High,
            s if s >= 0.4 => ThreatLevel::Medium,
            s if s >= 0.2 => ThreatLevel::Low,
            _ => ThreatLevel::Clean,
        }
    }
}

/// The independent analysis signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Nlp,
    Url,
    Header,
    Rules,
    Anomaly,
}

impl Signal {
    pub const ALL: [Signal; 5] = [
        Signal::Nlp,
        Signal::Url,
        Signal::Header,
        Signal::Rules,
        Signal::Anomaly,
    ];
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Nlp => "nlp",
            Signal::Url => "url",
            Signal::Header => "header",
            Signal::Rules => "rules",
            Signal::Anomaly => "anomaly",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScoringError {
    #[error("invalid weights: {0}")]
    InvalidWeights(String),
    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),
    #[error("{signal} sub-score {value} is outside [0, 1]")]
    OutOfRange { signal: Signal, value: f64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub nlp: f64,
    pub url: f64,
    pub header: f64,
    pub rules: f64,
    pub anomaly: f64,
}

impl SubScores {
    pub fn get(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Nlp => self.nlp,
            Signal::Url => self.url,
            Signal::Header => self.header,
            Signal::Rules => self.rules,
            Signal::Anomaly => self.anomaly,
        }
    }

    /// Strict check for externally supplied scores: finite and within [0, 1]
    pub fn validate(&self) -> Result<(), ScoringError> {
        for signal in Signal::ALL {
            let value = self.get(signal);
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ScoringError::OutOfRange { signal, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub nlp: f64,
    pub url: f64,
    pub header: f64,
    pub rules: f64,
    pub anomaly: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            nlp: 0.25,
            url: 0.30,
            header: 0.20,
            rules: 0.15,
            anomaly: 0.10,
        }
    }
}

impl Weights {
    pub fn get(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Nlp => self.nlp,
            Signal::Url => self.url,
            Signal::Header => self.header,
            Signal::Rules => self.rules,
            Signal::Anomaly => self.anomaly,
        }
    }

    pub fn validate(&self) -> Result<(), ScoringError> {
        for signal in Signal::ALL {
            let w = self.get(signal);
            if !w.is_finite() || w < 0.0 {
                return Err(ScoringError::InvalidWeights(format!(
                    "{signal} weight {w} must be a non-negative number"
                )));
            }
        }
        let sum: f64 = Signal::ALL.iter().map(|s| self.get(*s)).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ScoringError::InvalidWeights(format!(
                "weights sum to {sum:.6}, expected 1.0"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub tag: f64,
    pub flag: f64,
    /// Disabled unless set; must sit strictly between flag and block
    pub quarantine: Option<f64>,
    pub block: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            tag: 0.4,
            flag: 0.6,
            quarantine: None,
            block: 0.8,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ScoringError> {
        let mut ladder = vec![("tag", self.tag), ("flag", self.flag)];
        if let Some(q) = self.quarantine {
            ladder.push(("quarantine", q));
        }
        ladder.push(("block", self.block));

        for (name, value) in &ladder {
            if !value.is_finite() || *value <= 0.0 || *value > 1.0 {
                return Err(ScoringError::InvalidThresholds(format!(
                    "{name} threshold {value} must be within (0, 1]"
                )));
            }
        }
        for pair in ladder.windows(2) {
            let ((low_name, low), (high_name, high)) = (pair[0], pair[1]);
            if low >= high {
                return Err(ScoringError::InvalidThresholds(format!(
                    "{low_name} ({low}) must be below {high_name} ({high})"
                )));
            }
        }
        Ok(())
    }

    /// Lower bound of an action's bucket; `None` for allow and disabled quarantine
    pub fn lower_bound(&self, action: Action) -> Option<f64> {
        match action {
            Action::Allow => None,
            Action::Tag => Some(self.tag),
            Action::Flag => Some(self.flag),
            Action::Quarantine => self.quarantine,
            Action::Block => Some(self.block),
        }
    }
}

/// Per-signal share of the final score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub signal: Signal,
    pub score: f64,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    pub final_score: f64,
    pub action: Action,
    pub threat_level: ThreatLevel,
    pub contributions: Vec<Contribution>,
}

impl ScoreOutcome {
    /// Contributions ordered largest first, zero shares dropped
    pub fn main_contributors(&self) -> Vec<&Contribution> {
        let mut ranked: Vec<&Contribution> = self
            .contributions
            .iter()
            .filter(|c| c.contribution > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.contribution.total_cmp(&a.contribution));
        ranked
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    weights: Weights,
    thresholds: Thresholds,
}

impl ScoringEngine {
    pub fn new(weights: Weights, thresholds: Thresholds) -> Result<Self, ScoringError> {
        weights.validate()?;
        thresholds.validate()?;
        Ok(Self {
            weights,
            thresholds,
        })
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    fn sanitize(signal: Signal, value: f64) -> f64 {
        if value.is_nan() {
            log::warn!("{signal} sub-score is NaN, treating it as 0");
            return 0.0;
        }
        value.clamp(0.0, 1.0)
    }

    /// Weighted sum of the (clamped) sub-scores, in [0, 1]
    pub fn aggregate(&self, scores: &SubScores) -> f64 {
        let sum: f64 = Signal::ALL
            .iter()
            .map(|s| Self::sanitize(*s, scores.get(*s)) * self.weights.get(*s))
            .sum();
        ((sum * SCORE_PRECISION).round() / SCORE_PRECISION).clamp(0.0, 1.0)
    }

    /// Map a final score to an action; a score equal to a threshold takes the higher bucket
    pub fn classify(&self, score: f64) -> Action {
        let t = &self.thresholds;
        if score >= t.block {
            Action::Block
        } else if t.quarantine.is_some_and(|q| score >= q) {
            Action::Quarantine
        } else if score >= t.flag {
            Action::Flag
        } else if score >= t.tag {
            Action::Tag
        } else {
            Action::Allow
        }
    }

    pub fn evaluate(&self, scores: &SubScores) -> ScoreOutcome {
        let contributions = Signal::ALL
            .iter()
            .map(|s| {
                let score = Self::sanitize(*s, scores.get(*s));
                let weight = self.weights.get(*s);
                Contribution {
                    signal: *s,
                    score,
                    weight,
                    contribution: score * weight,
                }
            })
            .collect();

        let final_score = self.aggregate(scores);
        let action = self.classify(final_score);
        log::debug!("Aggregated {scores:?} -> {final_score:.3} ({action})");

        ScoreOutcome {
            final_score,
            action,
            threat_level: ThreatLevel::from_score(final_score),
            contributions,
        }
    }

    /// Human-readable statement of which threshold the score crossed
    pub fn describe_threshold(&self, score: f64, action: Action) -> String {
        match self.thresholds.lower_bound(action) {
            Some(bound) => format!("score {score:.2} reached the {action} threshold ({bound:.2})"),
            None => format!(
                "score {score:.2} is below the tag threshold ({:.2})",
                self.thresholds.tag
            ),
        }
    }
}
