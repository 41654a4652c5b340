use super::{FeatureExtractor, FeatureScore};
use crate::email::ParsedEmail;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

lazy_static! {
    static ref PUNCTUATION_RUN: Regex = Regex::new(r"[!?]{3,}").expect("valid regex");
    static ref GENERIC_GREETING: Regex = Regex::new(
        r"(?i)\b(dear\s+(valued\s+)?(customer|user|client|member|account\s+holder|sir(\s*(/|or)\s*madam)?)|hello\s+user)\b"
    )
    .expect("valid greeting regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LexiconCategory {
    Urgency,
    Fear,
    Credential,
    Financial,
    Reward,
}

impl LexiconCategory {
    /// Upper bound of a single category's contribution
    fn cap(self) -> f64 {
        match self {
            LexiconCategory::Credential => 0.4,
            _ => 0.3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LexiconCategory::Urgency => "urgency",
            LexiconCategory::Fear => "fear",
            LexiconCategory::Credential => "credential",
            LexiconCategory::Financial => "financial",
            LexiconCategory::Reward => "reward",
        }
    }
}

const URGENCY_TERMS: &[(&str, f64)] = &[
    ("urgent", 0.1),
    ("immediately", 0.1),
    ("immediate action", 0.15),
    ("within 24 hours", 0.15),
    ("within 48 hours", 0.15),
    ("expires", 0.08),
    ("expires today", 0.15),
    ("deadline", 0.08),
    ("act now", 0.12),
    ("asap", 0.08),
    ("final notice", 0.12),
    ("last chance", 0.08),
    ("limited time", 0.08),
];

const FEAR_TERMS: &[(&str, f64)] = &[
    ("suspended", 0.15),
    ("suspend", 0.12),
    ("locked", 0.12),
    ("unauthorized", 0.12),
    ("unusual activity", 0.15),
    ("suspicious activity", 0.15),
    ("legal action", 0.15),
    ("terminated", 0.1),
    ("compromised", 0.12),
    ("security alert", 0.12),
    ("breach", 0.1),
];

const CREDENTIAL_TERMS: &[(&str, f64)] = &[
    ("verify your account", 0.25),
    ("confirm your password", 0.3),
    ("confirm your identity", 0.25),
    ("update your payment", 0.2),
    ("verify", 0.08),
    ("login", 0.08),
    ("log in", 0.08),
    ("sign in", 0.08),
    ("password", 0.12),
    ("social security", 0.2),
    ("ssn", 0.15),
    ("credit card number", 0.2),
    ("click here", 0.1),
];

const FINANCIAL_TERMS: &[(&str, f64)] = &[
    ("wire transfer", 0.15),
    ("gift card", 0.2),
    ("bitcoin", 0.15),
    ("cryptocurrency", 0.1),
    ("refund", 0.1),
    ("invoice", 0.05),
    ("payment", 0.05),
    ("bank account", 0.1),
    ("loan", 0.05),
    ("debt", 0.05),
    ("credit", 0.03),
    ("make money", 0.1),
    ("work from home", 0.08),
    ("business opportunity", 0.08),
];

const REWARD_TERMS: &[(&str, f64)] = &[
    ("winner", 0.15),
    ("lottery", 0.2),
    ("prize", 0.12),
    ("inheritance", 0.2),
    ("you have won", 0.2),
    ("congratulations", 0.08),
    ("claim your", 0.12),
    ("beneficiary", 0.1),
    ("free", 0.05),
    ("casino", 0.1),
];

/// Word pairs that together signal a phishing pretext
const COMBOS: &[(&str, &str)] = &[
    ("urgent", "verify"),
    ("immediate", "action"),
    ("suspended", "hours"),
    ("expires", "today"),
    ("click", "immediately"),
    ("verify", "now"),
    ("account", "suspended"),
    ("security", "alert"),
];

const NEGATIVE_WORDS: &[&str] = &[
    "problem", "failed", "failure", "unable", "risk", "loss", "lose", "closed", "penalty",
    "violation", "fraud", "blocked", "denied", "error", "warning", "terminated",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraTerm {
    pub category: LexiconCategory,
    pub term: String,
    #[serde(default = "default_extra_weight")]
    pub weight: f64,
}

fn default_extra_weight() -> f64 {
    0.1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Terms appended to the built-in lexicons
    pub extra_terms: Vec<ExtraTerm>,
    pub uppercase_ratio_threshold: f64,
    pub combo_bonus: f64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            extra_terms: Vec::new(),
            uppercase_ratio_threshold: 0.3,
            combo_bonus: 0.1,
        }
    }
}

struct LexiconTerm {
    category: LexiconCategory,
    term: String,
    weight: f64,
    pattern: Regex,
}

/// Detailed lexical result; `score` feeds the nlp signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub score: FeatureScore,
    pub matches: BTreeMap<LexiconCategory, Vec<String>>,
    pub uppercase_ratio: f64,
    pub negative_ratio: f64,
}

impl ContentAnalysis {
    /// Lexicon hits typical of bulk spam rather than targeted phishing
    pub fn spam_term_count(&self) -> usize {
        [LexiconCategory::Financial, LexiconCategory::Reward]
            .iter()
            .filter_map(|c| self.matches.get(c))
            .map(Vec::len)
            .sum()
    }
}

pub struct ContentAnalyzer {
    terms: Vec<LexiconTerm>,
    config: ContentConfig,
}

impl Default for ContentAnalyzer {
    fn default() -> Self {
        Self::new(ContentConfig::default())
    }
}

impl ContentAnalyzer {
    pub fn new(config: ContentConfig) -> Self {
        let builtin = [
            (LexiconCategory::Urgency, URGENCY_TERMS),
            (LexiconCategory::Fear, FEAR_TERMS),
            (LexiconCategory::Credential, CREDENTIAL_TERMS),
            (LexiconCategory::Financial, FINANCIAL_TERMS),
            (LexiconCategory::Reward, REWARD_TERMS),
        ];

        let mut terms: Vec<LexiconTerm> = builtin
            .iter()
            .flat_map(|(category, list)| {
                list.iter()
                    .filter_map(move |(term, weight)| Self::compile(*category, term, *weight))
            })
            .collect();

        terms.extend(
            config
                .extra_terms
                .iter()
                .filter_map(|extra| Self::compile(extra.category, &extra.term, extra.weight)),
        );

        Self { terms, config }
    }

    fn compile(category: LexiconCategory, term: &str, weight: f64) -> Option<LexiconTerm> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return None;
        }
        let words: Vec<String> = term.split_whitespace().map(regex::escape).collect();
        let pattern = format!(r"(?i)\b{}\b", words.join(r"\s+"));
        match Regex::new(&pattern) {
            Ok(pattern) => Some(LexiconTerm {
                category,
                term,
                weight: weight.clamp(0.0, 1.0),
                pattern,
            }),
            Err(e) => {
                log::warn!("Skipping lexicon term '{term}': {e}");
                None
            }
        }
    }

    pub fn analyze(&self, email: &ParsedEmail) -> ContentAnalysis {
        self.analyze_text(&email.text_for_analysis())
    }

    pub fn analyze_text(&self, text: &str) -> ContentAnalysis {
        let mut score = FeatureScore::new("content");
        let mut matches: BTreeMap<LexiconCategory, Vec<String>> = BTreeMap::new();
        let mut category_totals: BTreeMap<LexiconCategory, f64> = BTreeMap::new();

        for term in &self.terms {
            if term.pattern.is_match(text) {
                matches
                    .entry(term.category)
                    .or_default()
                    .push(term.term.clone());
                *category_totals.entry(term.category).or_default() += term.weight;
            }
        }

        for (category, total) in &category_totals {
            let capped = total.min(category.cap());
            let terms = matches.get(category).cloned().unwrap_or_default();
            score.add(
                capped,
                &format!("{}_language", category.label()),
                format!("{} language: {}", category.label(), terms.join(", ")),
            );
        }

        let lower = text.to_lowercase();
        let words: HashSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let combos: Vec<String> = COMBOS
            .iter()
            .filter(|(a, b)| words.contains(a) && words.contains(b))
            .map(|(a, b)| format!("{a}+{b}"))
            .collect();
        if !combos.is_empty() {
            let bonus = (combos.len() as f64 * self.config.combo_bonus).min(0.3);
            score.add(
                bonus,
                "pretext_combo",
                format!("Phishing word combinations: {}", combos.join(", ")),
            );
        }

        let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
        let uppercase_ratio = if letters.len() >= 20 {
            letters.iter().filter(|c| c.is_uppercase()).count() as f64 / letters.len() as f64
        } else {
            0.0
        };
        if uppercase_ratio > self.config.uppercase_ratio_threshold {
            score.add(
                0.1,
                "excessive_caps",
                format!("{:.0}% of letters are uppercase", uppercase_ratio * 100.0),
            );
        }

        if PUNCTUATION_RUN.is_match(text) {
            score.add(0.1, "excessive_punctuation", "Runs of !!! or ???");
        }

        if let Some(greeting) = GENERIC_GREETING.find(text) {
            score.add(
                0.1,
                "generic_greeting",
                format!("Generic greeting '{}'", greeting.as_str()),
            );
        }

        let total_words = lower.split_whitespace().count();
        let negative = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| NEGATIVE_WORDS.contains(w))
            .count();
        let negative_ratio = if total_words > 0 {
            negative as f64 / total_words as f64
        } else {
            0.0
        };
        if negative_ratio > 0.03 {
            score.add(
                (negative_ratio * 2.0).min(0.1),
                "negative_tone",
                format!("Negative tone ({negative} of {total_words} words)"),
            );
        }

        log::debug!(
            "Content score {:.2} ({} categories matched)",
            score.score,
            matches.len()
        );

        ContentAnalysis {
            score,
            matches,
            uppercase_ratio,
            negative_ratio,
        }
    }
}

impl FeatureExtractor for ContentAnalyzer {
    fn extract(&self, email: &ParsedEmail) -> FeatureScore {
        self.analyze(email).score
    }

    fn name(&self) -> &str {
        "content"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phishing_text_scores_high() {
        let analyzer = ContentAnalyzer::default();
        let result = analyzer.analyze_text(
            "URGENT: Your account has been suspended. Verify your account within 24 hours \
             or it will be closed. Dear customer, click here to confirm your password.",
        );

        assert!(result.score.score >= 0.8, "score {}", result.score.score);
        assert!(result.matches.contains_key(&LexiconCategory::Urgency));
        assert!(result.matches.contains_key(&LexiconCategory::Credential));
        assert!(result.score.has_indicator("pretext_combo"));
        assert!(result.score.has_indicator("generic_greeting"));
    }

    #[test]
    fn test_benign_text_scores_low() {
        let analyzer = ContentAnalyzer::default();
        let result = analyzer.analyze_text(
            "Hi team, attached are the notes from Tuesday's planning meeting. \
             Let me know if I missed anything.",
        );
        assert!(result.score.score < 0.1, "score {}", result.score.score);
        assert!(result.matches.is_empty());
    }

    #[test]
    fn test_word_boundaries() {
        let analyzer = ContentAnalyzer::default();
        // "freedom" must not match "free", "prizefight" must not match "prize"
        let result = analyzer.analyze_text("freedom and prizefighting");
        assert!(result.matches.is_empty());
    }

    #[test]
    fn test_spam_term_count_and_caps() {
        let analyzer = ContentAnalyzer::default();
        let result =
            analyzer.analyze_text("CONGRATULATIONS WINNER!!! CLAIM YOUR FREE LOTTERY PRIZE NOW");
        assert!(result.spam_term_count() >= 3);
        assert!(result.score.has_indicator("excessive_caps"));
        assert!(result.score.has_indicator("excessive_punctuation"));
    }

    #[test]
    fn test_extra_terms() {
        let analyzer = ContentAnalyzer::new(ContentConfig {
            extra_terms: vec![ExtraTerm {
                category: LexiconCategory::Financial,
                term: "payroll update".into(),
                weight: 0.2,
            }],
            ..ContentConfig::default()
        });
        let result = analyzer.analyze_text("Please review the payroll   update form");
        assert_eq!(
            result.matches.get(&LexiconCategory::Financial),
            Some(&vec!["payroll update".to_string()])
        );
    }
}
