//! Integration tests for `POST /stream_workflow`.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{
    body_json, build_test_app, build_test_app_with, executed, executing, finished, node_error,
    progress, sse_events, started, test_config, FakeBackend, Script,
};
use serde_json::json;

fn workflow() -> serde_json::Value {
    json!({"3": {"class_type": "KSampler", "inputs": {"steps": 10}}})
}

fn terminal_count(events: &[(String, serde_json::Value)]) -> usize {
    events
        .iter()
        .filter(|(name, _)| name == "result" || name == "error")
        .count()
}

#[tokio::test]
async fn stream_reports_progress_then_one_result() {
    let mut frames = vec![started(), executing("3")];
    frames.extend((1..=10).map(|step| progress(step, 10, "3")));
    frames.extend([executed("9"), finished()]);
    let backend = FakeBackend::new(Script::Frames(frames)).with_outputs(json!({
        "9": {"images": [{"filename": "out.png", "subfolder": "run", "type": "output"}]}
    }));
    let app = build_test_app(backend).await;

    let response = app.post_json("/stream_workflow", &workflow()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = sse_events(response).await;

    let states: Vec<&str> = events
        .iter()
        .filter(|(name, _)| name == "executing")
        .filter_map(|(_, data)| data["state"].as_str())
        .collect();
    assert_eq!(
        states,
        ["submitted", "queued", "started", "executing", "executed"]
    );

    let steps: Vec<u64> = events
        .iter()
        .filter(|(name, _)| name == "progress")
        .map(|(_, data)| data["value"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, (1..=10).collect::<Vec<u64>>());

    let (_, last_progress) = events.iter().rfind(|(name, _)| name == "progress").unwrap();
    assert_eq!(last_progress["percent"], 100);
    assert_eq!(last_progress["node"], "3");

    assert_eq!(terminal_count(&events), 1);
    let (name, result) = events.last().unwrap();
    assert_eq!(name, "result");
    assert_eq!(result["filename"], "out.png");
    assert_eq!(result["node_id"], "9");
    assert_eq!(result["kind"], "image");
    assert_eq!(result["media_type"], "image/png");
    assert_eq!(result["subfolder"], "run");
    assert_eq!(result["type"], "output");

    // The result event describes the artifact; bytes are not downloaded.
    assert!(!app.backend.calls().iter().any(|c| c.starts_with("view:")));
    assert!(app.state.registry.is_empty());
}

#[tokio::test]
async fn stream_ends_with_error_event_on_node_failure() {
    let backend = FakeBackend::new(Script::Frames(vec![
        started(),
        executing("7"),
        node_error("7", "Allocation on device"),
    ]));
    let app = build_test_app(backend).await;

    let response = app.post_json("/stream_workflow", &workflow()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(response).await;

    assert_eq!(terminal_count(&events), 1);
    let (name, error) = events.last().unwrap();
    assert_eq!(name, "error");
    assert_eq!(error["code"], "EXECUTION_ERROR");
    assert_eq!(error["details"]["node_id"], "7");
}

#[tokio::test]
async fn stream_reports_lost_connection() {
    let app = build_test_app(FakeBackend::new(Script::DropConnection)).await;

    let response = app.post_json("/stream_workflow", &workflow()).await;
    let events = sse_events(response).await;

    assert_eq!(terminal_count(&events), 1);
    let (name, error) = events.last().unwrap();
    assert_eq!(name, "error");
    assert_eq!(error["code"], "CONNECTION_LOST");
}

#[tokio::test(start_paused = true)]
async fn silent_stream_ends_with_timeout_event() {
    let mut config = test_config();
    config.job_timeout_secs = 600;
    let app = build_test_app_with(config, FakeBackend::new(Script::Silent)).await;

    let response = app.post_json("/stream_workflow", &workflow()).await;
    let events = sse_events(response).await;

    assert_eq!(terminal_count(&events), 1);
    let (name, error) = events.last().unwrap();
    assert_eq!(name, "error");
    assert_eq!(error["code"], "TIMEOUT");
    assert_eq!(error["message"], "Job did not finish within 600s");
    assert!(app.state.registry.is_empty());
}

#[tokio::test]
async fn rejected_submission_yields_single_error_event() {
    let backend = FakeBackend::new(Script::Reject(400, r#"{"error": "bad node"}"#.into()));
    let app = build_test_app(backend).await;

    let response = app.post_json("/stream_workflow", &workflow()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(response).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    assert_eq!(events[0].1["code"], "SUBMISSION_REJECTED");
    assert_eq!(events[0].1["details"]["error"], "bad node");
}

#[tokio::test]
async fn missing_output_is_reported_in_stream() {
    let app = build_test_app(FakeBackend::new(Script::Frames(vec![started(), finished()]))).await;

    let response = app.post_json("/stream_workflow", &workflow()).await;
    let events = sse_events(response).await;

    let (name, error) = events.last().unwrap();
    assert_eq!(name, "error");
    assert_eq!(error["code"], "NO_OUTPUT");
}

#[tokio::test]
async fn malformed_body_is_rejected_before_streaming() {
    let app = build_test_app(FakeBackend::new(Script::Silent)).await;

    let response = app.post_json("/stream_workflow", &json!("just a string")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    assert!(app.backend.calls().is_empty());
}

#[tokio::test]
async fn stream_requires_api_key() {
    let app = build_test_app(FakeBackend::new(Script::Silent)).await;

    let request = Request::post("/stream_workflow")
        .body(Body::from(workflow().to_string()))
        .unwrap();
    let response = app.request(request).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
