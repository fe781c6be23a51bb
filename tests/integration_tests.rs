//! End-to-end tests against a mocked analysis service.

use httpmock::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use vidguide_client::config::{Config, ConfigBuilder};
use vidguide_client::orchestrator::QueryOrchestrator;
use vidguide_client::state::{BboxVerification, RunPhase, StageStatus, StepQuality};

fn test_config(server: &MockServer) -> Config {
    ConfigBuilder::new()
        .with_base_url(server.base_url())
        .with_image_host(server.base_url())
        .with_reconnect_attempts(2)
        .with_reconnect_delay(0)
        .with_fallback_deadline(600)
        .build()
}

fn sse_body(frames: &[&str]) -> String {
    frames
        .iter()
        .map(|f| {
            let data: String = f.lines().map(|line| format!("data: {}\n", line)).collect();
            format!("{}\n", data)
        })
        .collect::<String>()
}

#[tokio::test]
async fn test_streamed_success() {
    let server = MockServer::start_async().await;

    let stream_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/process-query-stream")
                .query_param("query", "how do I take a screenshot");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&[
                    r#"{"step": "connection"}"#,
                    r#"{"step": "video-search", "status": "active"}"#,
                    r#"{"step": "video-search", "status": "completed"}"#,
                    r#"{"step": "video-download", "status": "completed"}"#,
                    r#"{"step": "frame-extraction", "status": "completed"}"#,
                    r#"{"step": "ui-screens", "status": "completed"}"#,
                    r#"{"step": "osatlas-processing", "status": "active", "message": "Processing frame 2/4"}"#,
                    r#"{"step": "complete", "data": {"results": [
                        {"step": 1, "action": "OPEN_APP [Settings]", "thought": "Start from settings", "image": "/steps/1.png"},
                        {"step": 2, "action": "CLICK <point>[220, 340]</point>", "image": "/steps/2.png"}
                    ], "video_id": "vid-42", "timing": {"video-search": {"duration": 3.5}}}}"#,
                    r#"{"step": "stream-end"}"#,
                ]));
        })
        .await;

    let orchestrator = QueryOrchestrator::new(test_config(&server));
    let results = orchestrator
        .submit("how do I take a screenshot")
        .await
        .expect("streamed run should succeed");

    stream_mock.assert_async().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].action, "OPEN_APP [Settings]");

    let state = orchestrator.snapshot().await;
    assert_eq!(state.phase, RunPhase::Succeeded);
    assert_eq!(state.progress, 100);
    assert!(state.error.is_none());
    assert_eq!(state.video_id.as_deref(), Some("vid-42"));
    assert!(state.timing.is_some());
    assert!(state
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Completed));
}

#[tokio::test]
async fn test_streamed_error() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&[
                    r#"{"step": "video-search", "status": "active"}"#,
                    r#"{"status": "error", "message": "quota exceeded"}"#,
                ]));
        })
        .await;

    let orchestrator = QueryOrchestrator::new(test_config(&server));
    let result = orchestrator.submit("query").await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("quota exceeded"));

    let state = orchestrator.snapshot().await;
    assert_eq!(state.phase, RunPhase::Failed);
    assert_eq!(state.error.as_deref(), Some("quota exceeded"));
    assert_eq!(state.progress, 0);
    assert!(state.results.is_empty());
}

#[tokio::test]
async fn test_malformed_event_fails_the_run() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("data: this is not json\n\n");
        })
        .await;

    let orchestrator = QueryOrchestrator::new(test_config(&server));
    let result = orchestrator.submit("query").await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("parse"));

    let state = orchestrator.snapshot().await;
    assert_eq!(state.phase, RunPhase::Failed);
}

#[tokio::test]
async fn test_rejected_subscription_fails_immediately() {
    let server = MockServer::start_async().await;

    let stream_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(503);
        })
        .await;

    let orchestrator = QueryOrchestrator::new(test_config(&server));
    let result = orchestrator.submit("query").await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("503"));
    // No retries against an endpoint that refused the subscription
    stream_mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_reconnect_budget_exhaustion() {
    let server = MockServer::start_async().await;

    // Connects fine but never delivers a terminal event before EOF, so the
    // transport reconnects until the budget runs out
    let stream_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&[r#"{"step": "video-search", "status": "active"}"#]));
        })
        .await;

    let orchestrator = QueryOrchestrator::new(test_config(&server));
    let result = orchestrator.submit("query").await;

    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Connection lost after 2 attempts"));
    stream_mock.assert_hits_async(2).await;

    let state = orchestrator.snapshot().await;
    assert_eq!(state.phase, RunPhase::Failed);
    // Stage statuses stay as last observed on failure
    assert_eq!(state.stages[0].status, StageStatus::Active);
}

#[tokio::test]
async fn test_fallback_after_deadline() {
    let server = MockServer::start_async().await;

    // The stream stalls past the deadline; the run must degrade to the
    // blocking endpoint exactly once
    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .delay(Duration::from_secs(30))
                .body(sse_body(&[r#"{"step": "connection"}"#]));
        })
        .await;

    let fallback_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/process-query")
                .body_includes("query=");
            then.status(200).json_body(serde_json::json!({
                "results": [
                    {"step": 1, "action": "PRESS_HOME", "image": "/steps/1.png"}
                ],
                "video_id": "vid-7"
            }));
        })
        .await;

    let mut config = test_config(&server);
    config.stream.fallback_deadline_secs = 1;

    let orchestrator = QueryOrchestrator::new(config);
    let results = orchestrator
        .submit("how do I go home")
        .await
        .expect("fallback should succeed");

    fallback_mock.assert_hits_async(1).await;
    assert_eq!(results.len(), 1);

    let state = orchestrator.snapshot().await;
    assert_eq!(state.phase, RunPhase::Succeeded);
    assert_eq!(state.progress, 100);
    assert!(state
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Completed));
}

#[tokio::test]
async fn test_stream_end_without_complete_falls_back() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&[
                    r#"{"step": "video-search", "status": "completed"}"#,
                    r#"{"step": "stream-end"}"#,
                ]));
        })
        .await;

    let fallback_mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/process-query");
            then.status(200).json_body(serde_json::json!({
                "results": [
                    {"step": 1, "action": "ENTER", "image": "/steps/1.png"}
                ]
            }));
        })
        .await;

    let mut config = test_config(&server);
    config.stream.fallback_deadline_secs = 1;

    let orchestrator = QueryOrchestrator::new(config);
    let results = orchestrator.submit("query").await.expect("fallback result");

    fallback_mock.assert_hits_async(1).await;
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_fallback_error_body_fails_the_run() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .delay(Duration::from_secs(30))
                .body("");
        })
        .await;

    // Upstream convention: HTTP 200 whose body carries an error message
    server
        .mock_async(|when, then| {
            when.method(POST).path("/process-query");
            then.status(200)
                .json_body(serde_json::json!({"error": "No suitable video found."}));
        })
        .await;

    let mut config = test_config(&server);
    config.stream.fallback_deadline_secs = 1;

    let orchestrator = QueryOrchestrator::new(config);
    let result = orchestrator.submit("query").await;

    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("No suitable video found."));

    let state = orchestrator.snapshot().await;
    assert_eq!(state.phase, RunPhase::Failed);
    assert_eq!(state.progress, 0);
}

#[tokio::test]
async fn test_submit_rejected_while_run_in_flight() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .delay(Duration::from_secs(30))
                .body("");
        })
        .await;

    server
        .mock_async(|when, then| {
            when.method(POST).path("/process-query");
            then.status(200).json_body(serde_json::json!({"results": []}));
        })
        .await;

    let mut config = test_config(&server);
    config.stream.fallback_deadline_secs = 2;

    let orchestrator = Arc::new(QueryOrchestrator::new(config));
    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit("first").await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Second submission while the first is in flight is a no-op rejection
    let second = orchestrator.submit("second").await;
    assert!(second.is_err());
    assert_eq!(orchestrator.snapshot().await.query, "first");

    let first = first.await.expect("join");
    assert!(first.is_ok());
}

#[tokio::test]
async fn test_verification_and_metrics_export() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&[
                    r#"{"step": "complete", "data": {"results": [
                        {"step": 1, "action": "OPEN_APP [Camera]", "image": "/steps/1.png"},
                        {"step": 2, "action": "CLICK <point>[80, 90]</point>", "image": "/steps/2.png"}
                    ], "video_id": "vid-9"}}"#,
                ]));
        })
        .await;

    let metrics_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/save-accuracy-metrics")
                .json_body_includes(
                    r#"{"video_id": "vid-9", "correct": 1, "incorrect": 1, "total": 2}"#,
                );
            then.status(200).json_body(serde_json::json!({"ok": true}));
        })
        .await;

    let orchestrator = QueryOrchestrator::new(test_config(&server));
    orchestrator.submit("query").await.expect("run succeeds");

    orchestrator
        .verify_step_quality(1, StepQuality::Good)
        .await
        .unwrap();
    orchestrator
        .verify_bbox(1, BboxVerification::Correct)
        .await
        .unwrap();
    orchestrator
        .verify_bbox(2, BboxVerification::Incorrect)
        .await
        .unwrap();

    let state = orchestrator.snapshot().await;
    let tally = state.test_metrics.expect("tally recomputed");
    assert_eq!(tally.correct, 1);
    assert_eq!(tally.incorrect, 1);
    assert!((tally.accuracy - 50.0).abs() < f64::EPSILON);

    orchestrator.save_metrics().await.expect("metrics saved");
    metrics_mock.assert_async().await;
}

#[tokio::test]
async fn test_reset_allows_a_fresh_run() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/process-query-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&[
                    r#"{"status": "error", "message": "quota exceeded"}"#,
                ]));
        })
        .await;

    let orchestrator = QueryOrchestrator::new(test_config(&server));
    assert!(orchestrator.submit("query").await.is_err());

    orchestrator.reset().await;

    let state = orchestrator.snapshot().await;
    assert_eq!(state.phase, RunPhase::Idle);
    assert!(state.error.is_none());
    assert!(state.results.is_empty());
    assert_eq!(state.progress, 0);
    assert!(state
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Pending));
}
