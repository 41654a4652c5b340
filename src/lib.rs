pub mod api;
pub mod cache;
pub mod config;
pub mod dns_auth;
pub mod domain_utils;
pub mod email;
pub mod features;
pub mod pipeline;
pub mod reputation;
pub mod rule_engine;
pub mod scoring;
pub mod statistics;
pub mod url_resolver;

pub use config::Config;
pub use email::{EmailSubmission, ParseError, ParsedEmail};
pub use pipeline::{ThreatAnalyzer, Verdict};
pub use scoring::{Action, ScoringEngine, Signal, SubScores, ThreatLevel};
pub use statistics::{StatEvent, StatisticsCollector};
