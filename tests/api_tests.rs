use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use phishguard::api::{ApiServer, AppState};
use phishguard::config::Config;
use phishguard::pipeline::ThreatAnalyzer;
use phishguard::statistics::StatisticsCollector;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_config() -> Config {
    let mut config = Config::default();
    config.dns.enabled = false;
    config.redirects.enabled = false;
    config.reputation.endpoint = None;
    config
}

fn router_with(config: Config) -> Router {
    let analyzer = ThreatAnalyzer::from_config(&config).unwrap();
    let state = AppState::new(analyzer, StatisticsCollector::new());
    ApiServer::new(state, config.server.clone()).router()
}

fn router() -> Router {
    router_with(test_config())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

const RAW_PHISH: &str = "From: \"PayPal\" <service@paypal-secure-login.xyz>\r\n\
To: victim@example.net\r\n\
Subject: Verify your account now\r\n\
Authentication-Results: mx.example.net; spf=fail; dkim=none; dmarc=fail\r\n\
\r\n\
Your account has been suspended. Log in at http://203.0.113.9/paypal/login immediately.\r\n";

#[tokio::test]
async fn health_reports_version() {
    let response = router().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn score_endpoint_classifies_boundaries() {
    let app = router();
    let cases = [(0.8, "block", "critical"), (0.6, "flag", "high"), (0.4, "tag", "medium"), (0.1, "allow", "clean")];

    for (value, action, level) in cases {
        let request = post_json(
            "/api/v1/score",
            json!({"nlp": value, "url": value, "header": value, "rules": value, "anomaly": value}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["action"], action, "score {value}");
        assert_eq!(body["threat_level"], level, "score {value}");
        assert!((body["final_score"].as_f64().unwrap() - value).abs() < 1e-9);
    }
}

#[tokio::test]
async fn score_endpoint_rejects_out_of_range() {
    let request = post_json(
        "/api/v1/score",
        json!({"nlp": 1.5, "url": 0.0, "header": 0.0, "rules": 0.0, "anomaly": 0.0}),
    );
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("nlp"));
}

#[tokio::test]
async fn score_endpoint_rejects_missing_fields() {
    let request = post_json("/api/v1/score", json!({"nlp": 0.5}));
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/analyze")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn analyze_requires_sender() {
    let request = post_json("/api/v1/analyze", json!({"subject": "hello", "body_text": "hi"}));
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("sender"));
}

#[tokio::test]
async fn analyze_json_submission() {
    let request = post_json(
        "/api/v1/analyze",
        json!({
            "message_id": "<weekly-42@team.example>",
            "from": "Team Lead <lead@team.example>",
            "subject": "Notes from the weekly sync",
            "headers": {
                "Authentication-Results": "mx.example.net; spf=pass; dkim=pass header.d=team.example; dmarc=pass"
            },
            "body_text": "Thanks everyone for joining. Notes are in the shared folder."
        }),
    );
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["action"], "allow");
    assert_eq!(body["message_id"], "<weekly-42@team.example>");
    assert_eq!(body["is_phishing"], false);
    assert!(body["explanation"].as_str().unwrap().starts_with("Allow"));
    assert!(body["degraded"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn analyze_raw_message() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/analyze/raw")
        .header(header::CONTENT_TYPE, "message/rfc822")
        .body(Body::from(RAW_PHISH))
        .unwrap();
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["is_phishing"], true);
    let indicators: Vec<&str> = body["indicators"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(indicators.contains(&"ip_host"));
    assert!(indicators.contains(&"dmarc_fail"));
    assert!(body["final_score"].as_f64().unwrap() >= 0.6);
}

#[tokio::test]
async fn analyze_raw_rejects_empty_body() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/analyze/raw")
        .body(Body::from("   \r\n"))
        .unwrap();
    let response = router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut config = test_config();
    config.server.body_limit_bytes = 256;
    let app = router_with(config);

    let mut raw = String::from("From: a@example.org\nSubject: big\n\n");
    raw.push_str(&"x".repeat(1024));
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/analyze/raw")
        .body(Body::from(raw))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn oversized_json_submission_is_rejected() {
    let mut config = test_config();
    config.server.body_limit_bytes = 256;
    let app = router_with(config);

    let request = post_json(
        "/api/v1/analyze",
        json!({"from": "a@example.org", "body_text": "x".repeat(1024)}),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn stats_count_analyses_and_failures() {
    let app = router();

    let raw = Request::builder()
        .method("POST")
        .uri("/api/v1/analyze/raw")
        .body(Body::from(RAW_PHISH))
        .unwrap();
    assert_eq!(app.clone().oneshot(raw).await.unwrap().status(), StatusCode::OK);

    let missing_sender = post_json("/api/v1/analyze", json!({"body_text": "hi"}));
    assert_eq!(
        app.clone().oneshot(missing_sender).await.unwrap().status(),
        StatusCode::BAD_REQUEST
    );

    let response = app.oneshot(get("/api/v1/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats = json_body(response).await;
    assert_eq!(stats["total_analyzed"], 1);
    assert_eq!(stats["parse_failures"], 1);
    assert_eq!(stats["indicator_hits"]["ip_host"], 1);
}

#[tokio::test]
async fn scoring_config_reflects_configuration() {
    let mut config = test_config();
    config.scoring.thresholds.quarantine = Some(0.7);
    let response = router_with(config).oneshot(get("/api/v1/config/scoring")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["weights"]["url"], 0.3);
    assert_eq!(body["thresholds"]["block"], 0.8);
    assert_eq!(body["thresholds"]["quarantine"], 0.7);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let response = router().oneshot(get("/api/v1/nothing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
