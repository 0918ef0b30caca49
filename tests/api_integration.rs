//! Integration tests for the REST API feature.

#![cfg(feature = "api")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use ilc_engine::api::{AppState, ScenarioSummary, router};
use ilc_engine::config::ScenarioConfig;
use ilc_engine::sim::engine::Simulation;

/// Replays the stagger preset and returns the API state.
fn build_api_state() -> Arc<AppState> {
    let cfg = ScenarioConfig::from_preset("stagger").expect("preset parses");
    let mut sim = Simulation::from_config(&cfg).expect("scenario builds");
    let results = sim.run();
    let kpi = sim.report(&results);
    Arc::new(AppState {
        scenario: ScenarioSummary::from_config(&cfg),
        kpi,
        results,
    })
}

async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
    let app = router(build_api_state());
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request builds"))
        .await
        .expect("router responds");
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body readable");
    (status, serde_json::from_slice(&body).expect("body is JSON"))
}

#[tokio::test]
async fn state_reports_scenario_and_kpis() {
    let (status, json) = get("/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["scenario"]["steps"], 600);
    assert_eq!(json["scenario"]["stagger_release"], true);
    assert_eq!(json["scenario"]["clusters"][0], "lighting");
    assert!(json["kpi"]["curtailments"].as_u64().unwrap_or(0) > 0);
    assert_eq!(json["latest_tick"]["step"], 599);
}

#[tokio::test]
async fn telemetry_window_around_the_peak() {
    let (status, json) = get("/telemetry?from=280&to=320").await;
    assert_eq!(status, StatusCode::OK);
    let ticks = json.as_array().expect("array");
    assert_eq!(ticks.len(), 41);
    assert_eq!(ticks[0]["step"], 280);
    assert!(ticks.iter().all(|t| t.get("phase").is_some()));
}

#[tokio::test]
async fn inverted_range_is_rejected() {
    let (status, json) = get("/telemetry?from=20&to=10").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().is_some());
}
