use super::{ApiError, AppState};
use crate::email::{EmailSubmission, ParsedEmail};
use crate::pipeline::Verdict;
use crate::scoring::{Action, SubScores, ThreatLevel, Thresholds, Weights};
use crate::statistics::{StatEvent, StatsSnapshot};
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, JsonRejection};
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub final_score: f64,
    pub action: Action,
    pub threat_level: ThreatLevel,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoringConfigResponse {
    pub weights: Weights,
    pub thresholds: Thresholds,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /api/v1/analyze
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EmailSubmission>, JsonRejection>,
) -> Result<Json<Verdict>, ApiError> {
    let Json(submission) = payload?;
    let email = ParsedEmail::from_submission(submission)
        .inspect_err(|_| state.stats.record_event(StatEvent::ParseFailure))?;
    Ok(Json(run_analysis(&state, &email).await))
}

/// POST /api/v1/analyze/raw
pub async fn analyze_raw(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Verdict>, ApiError> {
    let body = body?;
    let parsed = std::str::from_utf8(&body)
        .map_err(|e| ApiError::Parse(format!("message is not valid UTF-8: {e}")))
        .and_then(|raw| ParsedEmail::from_raw(raw).map_err(ApiError::from));
    let email = parsed.inspect_err(|_| state.stats.record_event(StatEvent::ParseFailure))?;
    Ok(Json(run_analysis(&state, &email).await))
}

async fn run_analysis(state: &AppState, email: &ParsedEmail) -> Verdict {
    let verdict = state.analyzer.analyze(email).await;
    state.stats.record_event(verdict.stat_event());
    verdict
}

/// POST /api/v1/score
pub async fn score(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubScores>, JsonRejection>,
) -> Result<Json<ScoreResponse>, ApiError> {
    let Json(scores) = payload?;
    scores.validate()?;

    let outcome = state.analyzer.scoring().evaluate(&scores);
    Ok(Json(ScoreResponse {
        final_score: outcome.final_score,
        action: outcome.action,
        threat_level: outcome.threat_level,
    }))
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsSnapshot>, ApiError> {
    Ok(Json(state.stats.snapshot().await?))
}

/// GET /api/v1/config/scoring
pub async fn scoring_config(State(state): State<Arc<AppState>>) -> Json<ScoringConfigResponse> {
    let engine = state.analyzer.scoring();
    Json(ScoringConfigResponse {
        weights: *engine.weights(),
        thresholds: *engine.thresholds(),
    })
}
