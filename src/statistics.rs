use crate::scoring::Action;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
pub enum StatEvent {
    Analyzed {
        action: Action,
        final_score: f64,
        indicators: Vec<String>,
        degraded: bool,
        duration_ms: u64,
    },
    ParseFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_analyzed: u64,
    pub per_action: BTreeMap<Action, u64>,
    pub mean_final_score: f64,
    pub indicator_hits: BTreeMap<String, u64>,
    pub degraded_analyses: u64,
    pub parse_failures: u64,
    pub mean_duration_ms: f64,
    pub start_time: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    fn new() -> Self {
        Self {
            total_analyzed: 0,
            per_action: BTreeMap::new(),
            mean_final_score: 0.0,
            indicator_hits: BTreeMap::new(),
            degraded_analyses: 0,
            parse_failures: 0,
            mean_duration_ms: 0.0,
            start_time: Utc::now(),
            last_updated: None,
        }
    }
}

enum Command {
    Record(StatEvent),
    Snapshot(oneshot::Sender<StatsSnapshot>),
}

/// In-memory counters updated by a background task
pub struct StatisticsCollector {
    sender: mpsc::UnboundedSender<Command>,
    _handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    /// Must be called from within a tokio runtime
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::stats_worker(receiver));
        Self {
            sender,
            _handle: handle,
        }
    }

    pub fn record_event(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(Command::Record(event)) {
            log::warn!("Failed to send statistics event: {e}");
        }
    }

    /// Current counters, including every event recorded before this call
    pub async fn snapshot(&self) -> Result<StatsSnapshot> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Snapshot(reply))
            .map_err(|_| anyhow::anyhow!("statistics worker has stopped"))?;
        response.await.context("statistics worker dropped the request")
    }

    async fn stats_worker(mut receiver: mpsc::UnboundedReceiver<Command>) {
        let mut stats = StatsSnapshot::new();
        let mut score_sum = 0.0;
        let mut duration_sum = 0u64;

        while let Some(command) = receiver.recv().await {
            match command {
                Command::Record(event) => {
                    Self::process_event(event, &mut stats, &mut score_sum, &mut duration_sum)
                }
                Command::Snapshot(reply) => {
                    // Requester may have gone away; nothing to do then
                    let _ = reply.send(stats.clone());
                }
            }
        }
        log::debug!("Statistics worker stopped");
    }

    fn process_event(
        event: StatEvent,
        stats: &mut StatsSnapshot,
        score_sum: &mut f64,
        duration_sum: &mut u64,
    ) {
        stats.last_updated = Some(Utc::now());

        match event {
            StatEvent::ParseFailure => stats.parse_failures += 1,
            StatEvent::Analyzed {
                action,
                final_score,
                indicators,
                degraded,
                duration_ms,
            } => {
                stats.total_analyzed += 1;
                *stats.per_action.entry(action).or_insert(0) += 1;
                for indicator in indicators {
                    *stats.indicator_hits.entry(indicator).or_insert(0) += 1;
                }
                if degraded {
                    stats.degraded_analyses += 1;
                }

                *score_sum += final_score;
                *duration_sum += duration_ms;
                stats.mean_final_score = *score_sum / stats.total_analyzed as f64;
                stats.mean_duration_ms = *duration_sum as f64 / stats.total_analyzed as f64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzed(action: Action, score: f64, indicators: &[&str]) -> StatEvent {
        StatEvent::Analyzed {
            action,
            final_score: score,
            indicators: indicators.iter().map(|s| s.to_string()).collect(),
            degraded: false,
            duration_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_counters_and_means() {
        let collector = StatisticsCollector::new();
        collector.record_event(analyzed(Action::Block, 0.9, &["spf_fail", "ip_host"]));
        collector.record_event(analyzed(Action::Allow, 0.1, &["spf_fail"]));
        collector.record_event(StatEvent::ParseFailure);

        let snapshot = collector.snapshot().await.unwrap();
        assert_eq!(snapshot.total_analyzed, 2);
        assert_eq!(snapshot.per_action[&Action::Block], 1);
        assert_eq!(snapshot.per_action[&Action::Allow], 1);
        assert_eq!(snapshot.indicator_hits["spf_fail"], 2);
        assert_eq!(snapshot.parse_failures, 1);
        assert!((snapshot.mean_final_score - 0.5).abs() < 1e-9);
        assert!((snapshot.mean_duration_ms - 10.0).abs() < 1e-9);
        assert!(snapshot.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let collector = StatisticsCollector::new();
        let snapshot = collector.snapshot().await.unwrap();
        assert_eq!(snapshot.total_analyzed, 0);
        assert!(snapshot.last_updated.is_none());
    }
}
