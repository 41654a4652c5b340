use crate::domain_utils::DomainUtils;
use crate::email::ParsedEmail;
use crate::features::FeatureScore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Probability-like strength in [0, 1]
    pub weight: f64,
    pub criteria: Criteria,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Criteria {
    SubjectPattern {
        pattern: String,
    },
    BodyPattern {
        pattern: String,
    },
    SenderPattern {
        pattern: String,
    },
    SenderDomain {
        domains: Vec<String>,
    },
    HeaderPattern {
        header: String,
        pattern: String,
    },
    UrlPattern {
        pattern: String,
    },
    AttachmentExtension {
        extensions: Vec<String>,
    },
    And {
        criteria: Vec<Criteria>,
    },
    Or {
        criteria: Vec<Criteria>,
    },
    Not {
        criterion: Box<Criteria>,
    },
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{rule}': invalid regex pattern '{pattern}': {source}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule '{rule}': weight {weight} must be within [0, 1]")]
    InvalidWeight { rule: String, weight: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub score: f64,
    pub matched: Vec<RuleMatch>,
}

impl RuleEvaluation {
    pub fn to_feature_score(&self) -> FeatureScore {
        let mut score = FeatureScore::new("rules");
        score.score = self.score;
        for rule in &self.matched {
            score.push_indicator(&format!("rule:{}", rule.name));
            score
                .evidence
                .push(format!("Rule '{}' matched (weight {:.2})", rule.name, rule.weight));
        }
        score
    }
}

pub struct RuleEngine {
    rules: Vec<Rule>,
    compiled_patterns: HashMap<String, Regex>,
}

impl RuleEngine {
    /// Validate weights and compile every pattern up front
    pub fn new(rules: Vec<Rule>) -> Result<Self, RuleError> {
        let mut engine = Self {
            rules,
            compiled_patterns: HashMap::new(),
        };

        let rules = engine.rules.clone();
        for rule in &rules {
            if !rule.weight.is_finite() || !(0.0..=1.0).contains(&rule.weight) {
                return Err(RuleError::InvalidWeight {
                    rule: rule.name.clone(),
                    weight: rule.weight,
                });
            }
            engine.compile_criteria_patterns(&rule.name, &rule.criteria)?;
        }

        log::debug!(
            "Rule engine ready: {} rules, {} patterns",
            engine.rules.len(),
            engine.compiled_patterns.len()
        );
        Ok(engine)
    }

    fn compile_criteria_patterns(&mut self, rule: &str, criteria: &Criteria) -> Result<(), RuleError> {
        match criteria {
            Criteria::SubjectPattern { pattern }
            | Criteria::BodyPattern { pattern }
            | Criteria::SenderPattern { pattern }
            | Criteria::UrlPattern { pattern }
            | Criteria::HeaderPattern { pattern, .. } => {
                if !self.compiled_patterns.contains_key(pattern) {
                    let regex = Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
                        rule: rule.to_string(),
                        pattern: pattern.clone(),
                        source,
                    })?;
                    self.compiled_patterns.insert(pattern.clone(), regex);
                }
            }
            Criteria::SenderDomain { .. } | Criteria::AttachmentExtension { .. } => {}
            Criteria::And { criteria } | Criteria::Or { criteria } => {
                for c in criteria {
                    self.compile_criteria_patterns(rule, c)?;
                }
            }
            Criteria::Not { criterion } => self.compile_criteria_patterns(rule, criterion)?,
        }
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn is_match(&self, pattern: &str, text: &str) -> bool {
        self.compiled_patterns
            .get(pattern)
            .is_some_and(|regex| regex.is_match(text))
    }

    fn evaluate_criteria(&self, criteria: &Criteria, email: &ParsedEmail) -> bool {
        match criteria {
            Criteria::SubjectPattern { pattern } => self.is_match(pattern, &email.subject),
            Criteria::BodyPattern { pattern } => {
                self.is_match(pattern, &email.body_text)
                    || email
                        .body_html
                        .as_deref()
                        .is_some_and(|html| self.is_match(pattern, html))
            }
            Criteria::SenderPattern { pattern } => email.from.as_ref().is_some_and(|from| {
                self.is_match(pattern, &from.email)
                    || from
                        .display_name
                        .as_deref()
                        .is_some_and(|name| self.is_match(pattern, name))
            }),
            Criteria::SenderDomain { domains } => email
                .sender_domain()
                .is_some_and(|domain| DomainUtils::matches_domain_list(&domain, domains)),
            Criteria::HeaderPattern { header, pattern } => email
                .headers
                .get_all(header)
                .any(|value| self.is_match(pattern, value)),
            Criteria::UrlPattern { pattern } => {
                email.urls.iter().any(|u| self.is_match(pattern, &u.url))
            }
            Criteria::AttachmentExtension { extensions } => email.attachments.iter().any(|a| {
                a.filename
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_lowercase())
                    .is_some_and(|ext| {
                        extensions
                            .iter()
                            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
                    })
            }),
            Criteria::And { criteria } => criteria.iter().all(|c| self.evaluate_criteria(c, email)),
            Criteria::Or { criteria } => criteria.iter().any(|c| self.evaluate_criteria(c, email)),
            Criteria::Not { criterion } => !self.evaluate_criteria(criterion, email),
        }
    }

    /// Matched rules combined by noisy-OR: `1 - Π(1 - w)`
    pub fn evaluate(&self, email: &ParsedEmail) -> RuleEvaluation {
        let matched: Vec<RuleMatch> = self
            .rules
            .iter()
            .filter(|rule| rule.enabled && self.evaluate_criteria(&rule.criteria, email))
            .map(|rule| RuleMatch {
                name: rule.name.clone(),
                weight: rule.weight,
            })
            .collect();

        let miss_probability: f64 = matched.iter().map(|m| 1.0 - m.weight).product();
        let score = (1.0 - miss_probability).clamp(0.0, 1.0);

        for rule in &matched {
            log::debug!("Rule '{}' matched", rule.name);
        }
        RuleEvaluation { score, matched }
    }
}

/// Rule set shipped with the default configuration
pub fn default_rules() -> Vec<Rule> {
    let rule = |name: &str, weight: f64, criteria: Criteria| Rule {
        name: name.to_string(),
        weight,
        criteria,
        enabled: true,
    };
    let subject = |p: &str| Criteria::SubjectPattern {
        pattern: p.to_string(),
    };
    let body = |p: &str| Criteria::BodyPattern {
        pattern: p.to_string(),
    };

    vec![
        rule(
            "Credential harvest subject",
            0.5,
            subject(r"(?i)(verify|confirm|update|validate).{0,30}(account|password|identity|payment)"),
        ),
        rule(
            "Account suspension notice",
            0.4,
            Criteria::Or {
                criteria: vec![
                    subject(r"(?i)account.{0,40}(suspend|lock|disabl|restrict)"),
                    body(r"(?i)account.{0,40}(suspend|lock|disabl|restrict)"),
                ],
            },
        ),
        rule(
            "Executable attachment",
            0.7,
            Criteria::AttachmentExtension {
                extensions: ["exe", "scr", "js", "vbs", "bat", "cmd", "hta", "jar", "ps1"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        ),
        rule(
            "Urgent gift card request",
            0.5,
            Criteria::And {
                criteria: vec![
                    body(r"(?i)gift\s*cards?"),
                    body(r"(?i)\b(urgent|asap|today|quickly|right away)\b"),
                ],
            },
        ),
        rule(
            "Link to raw IP address",
            0.4,
            Criteria::UrlPattern {
                pattern: r"(?i)^https?://\d{1,3}(\.\d{1,3}){3}([:/]|$)".to_string(),
            },
        ),
        rule(
            "Payment request failing DMARC",
            0.5,
            Criteria::And {
                criteria: vec![
                    subject(r"(?i)\b(bank|wire|transfer|payment|invoice)\b"),
                    Criteria::HeaderPattern {
                        header: "Authentication-Results".to_string(),
                        pattern: r"(?i)dmarc=fail".to_string(),
                    },
                ],
            },
        ),
        rule(
            "Advance-fee scam language",
            0.4,
            body(r"(?i)(lottery|inheritance|beneficiary|unclaimed funds|next of kin)"),
        ),
        rule(
            "Password reset from unexpected sender",
            0.4,
            Criteria::And {
                criteria: vec![
                    subject(r"(?i)password\s+(reset|expir)"),
                    Criteria::Not {
                        criterion: Box::new(Criteria::SenderDomain {
                            domains: ["microsoft.com", "google.com", "apple.com", "okta.com"]
                                .iter()
                                .map(|s| s.to_string())
                                .collect(),
                        }),
                    },
                ],
            },
        ),
    ]
}
