use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use qa_live_monitor::{
    ApiClient, Error, HttpConnector, MonitorTiming, Phase, RunTrigger, StepState,
    StreamConnector, StreamController,
};
use serde_json::json;
use tokio::sync::Notify;

fn payload(event_type: &str, extra: serde_json::Value) -> String {
    let mut body = json!({
        "type": event_type,
        "message": format!("{event_type} for run"),
        "timestamp": "2025-06-01T12:00:00.000001+00:00",
    });
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        body.extend(extra.clone());
    }
    body.to_string()
}

async fn live(Path(test_id): Path<String>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let steps = json!([
        { "step_number": 1, "description": format!("Open {test_id}") },
        { "step_number": 2, "description": "Submit form" },
    ])
    .to_string();

    let events = vec![
        Event::default().comment("keepalive"),
        Event::default().id("1-0").data(payload("plan_start", json!({}))),
        Event::default()
            .id("2-0")
            .data(payload("plan_complete", json!({ "steps": steps }))),
        Event::default().id("3-0").data("not json at all"),
        Event::default().id("4-0").data(payload("browser_start", json!({}))),
        Event::default().id("5-0").data(payload(
            "browser_preview",
            json!({ "streaming_url": "https://preview.example/session/9" }),
        )),
        Event::default().id("6-0").data(payload(
            "step_complete",
            json!({ "step_number": "1", "passed": "True" }),
        )),
        Event::default().id("7-0").data(payload(
            "step_complete",
            json!({ "step_number": "2", "passed": "False" }),
        )),
        Event::default().id("8-0").data(payload("eval_start", json!({}))),
        Event::default()
            .id("9-0")
            .data(payload("eval_complete", json!({ "passed": "False" }))),
    ];
    Sse::new(stream::iter(events.into_iter().map(Ok)))
}

async fn run(Path(test_id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({ "status": "started", "test_id": test_id }))
}

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_backend() -> String {
    spawn(
        Router::new()
            .route("/api/tests/{id}/live", get(live))
            .route("/api/tests/{id}/run", post(run)),
    )
    .await
}

#[tokio::test]
async fn test_http_connector_yields_data_payloads() {
    let base = spawn_backend().await;
    let connector = HttpConnector::new(&base).unwrap();

    let messages: Vec<String> = connector
        .connect("checkout")
        .await
        .unwrap()
        .map(|m| m.unwrap())
        .collect()
        .await;

    assert_eq!(messages.len(), 9, "keep-alive comment must not be yielded");
    assert!(messages[0].contains("plan_start"));
    assert_eq!(messages[2], "not json at all");
    assert!(messages[8].contains("eval_complete"));
}

#[tokio::test]
async fn test_http_connector_reports_missing_route() {
    let base = spawn(Router::new()).await;
    let connector = HttpConnector::new(&base).unwrap();

    match connector.connect("checkout").await {
        Err(Error::Api { status, .. }) => assert_eq!(status, 404),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connected to a missing route"),
    }
}

#[tokio::test]
async fn test_api_client_starts_run() {
    let base = spawn_backend().await;
    let api = ApiClient::new(&base).unwrap();
    let response = api.start_run("checkout").await.unwrap();
    assert_eq!(response["test_id"], "checkout");
}

#[tokio::test]
async fn test_api_client_maps_error_status() {
    let base = spawn(Router::new().route(
        "/api/tests/{id}/run",
        post(|| async { (StatusCode::CONFLICT, "run already in progress") }),
    ))
    .await;
    let api = ApiClient::new(&base).unwrap();

    match api.start_run("checkout").await {
        Err(Error::Api { status, message }) => {
            assert_eq!(status, 409);
            assert_eq!(message, "run already in progress");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_controller_against_live_backend() {
    let base = spawn_backend().await;
    let finished = Arc::new(Notify::new());
    let mut controller = StreamController::builder(
        "checkout",
        Arc::new(HttpConnector::new(&base).unwrap()),
    )
    .timing(MonitorTiming {
        settle_delay: Duration::from_millis(20),
        auto_hide: Duration::from_millis(100),
    })
    .on_complete({
        let finished = Arc::clone(&finished);
        move || finished.notify_one()
    })
    .build();
    let mut diagnostics = controller.diagnostics();

    controller.set_trigger(RunTrigger::new(1));
    tokio::time::timeout(Duration::from_secs(5), finished.notified())
        .await
        .expect("run did not complete");

    let view = controller.view();
    assert_eq!(view.snapshot.phase, Phase::Complete);
    assert_eq!(view.snapshot.final_result, Some(false));
    assert_eq!(view.snapshot.events.len(), 8);
    assert_eq!(
        view.snapshot.streaming_url.as_deref(),
        Some("https://preview.example/session/9")
    );
    let states: Vec<_> = view.snapshot.steps.iter().map(|s| s.state).collect();
    assert_eq!(states, vec![StepState::Passed, StepState::Failed]);
    assert_eq!(view.snapshot.steps[0].description, "Open checkout");
    assert!(view.visible);

    let first = diagnostics.recv().await.unwrap();
    assert!(matches!(
        first,
        qa_live_monitor::Diagnostic::MalformedPayload { .. }
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!controller.view().visible);
}
