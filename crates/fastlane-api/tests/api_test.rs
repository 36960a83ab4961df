//! API surface tests over the in-memory engine harness

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use fastlane_api::{create_router, AppState};
use fastlane_core::runtime::fake::ExecutionPlan;
use fastlane_core::testing::TestHarness;

fn router(harness: &TestHarness) -> axum::Router {
    create_router(AppState::new(harness.ctx.clone()))
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn submit_and_read_job() {
    let harness = TestHarness::new();
    harness.runtime("host-a").push_plan(ExecutionPlan::exits(0, "hi\n"));
    let app = router(&harness);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks/demo",
            serde_json::json!({
                "image": "alpine",
                "command": "echo hi",
                "envs": {"API_TOKEN": "hunter2"},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let created = json_body(response).await;
    let job_id = created["job_id"].as_str().unwrap().to_string();
    // blacklisted env values never render
    assert_eq!(created["spec"]["envs"]["API_TOKEN"], "***");

    harness.settle().await;

    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/tasks/demo/jobs/{}", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = json_body(response).await;
    assert_eq!(detail["status"], "done");
    assert_eq!(detail["executions"][0]["exit_code"], 0);

    // canonical logs come from the store
    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/tasks/demo/jobs/{}/stdout", job_id)))
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hi\n");

    let response = app
        .oneshot(empty_request("GET", &format!("/tasks/demo/jobs/{}/logs", job_id)))
        .await
        .unwrap();
    let logs = json_body(response).await;
    assert_eq!(logs["stdout"], "hi\n");
    assert_eq!(logs["stderr"], "");
}

#[tokio::test]
async fn bad_submissions_are_rejected() {
    let harness = TestHarness::new();
    let app = router(&harness);

    // bad cron: 400, never stored
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks/demo",
            serde_json::json!({"image": "alpine", "command": "true", "cron": "bogus"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // schema garbage: 400
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks/demo",
            serde_json::json!({"image": "alpine", "command": "true", "priority": "high"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // invalid task id: 400
    let response = app
        .oneshot(json_request(
            "POST",
            "/tasks/has%20space",
            serde_json::json!({"image": "alpine", "command": "true"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(harness.queued_total().await, 0);
}

#[tokio::test]
async fn stop_done_is_conflict_retry_is_allowed() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.push_plan(ExecutionPlan::exits(0, "one\n"));
    runtime.push_plan(ExecutionPlan::exits(0, "two\n"));
    let app = router(&harness);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks/demo",
            serde_json::json!({"image": "alpine", "command": "echo one"}),
        ))
        .await
        .unwrap();
    let job_id = json_body(response).await["job_id"].as_str().unwrap().to_string();
    harness.settle().await;

    // stop a done job: 409
    let response = app
        .clone()
        .oneshot(empty_request("POST", &format!("/tasks/demo/jobs/{}/stop", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // retry a done job: allowed
    let response = app
        .clone()
        .oneshot(empty_request("POST", &format!("/tasks/demo/jobs/{}/retry", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    harness.settle().await;

    let response = app
        .oneshot(empty_request("GET", &format!("/tasks/demo/jobs/{}", job_id)))
        .await
        .unwrap();
    let detail = json_body(response).await;
    assert_eq!(detail["executions"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_resources_are_404() {
    let harness = TestHarness::new();
    let app = router(&harness);

    let response = app.clone().oneshot(empty_request("GET", "/tasks/ghost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let missing = ulid::Ulid::new();
    let response = app
        .oneshot(empty_request("GET", &format!("/tasks/ghost/jobs/{}", missing)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_queue_metrics() {
    let harness = TestHarness::new();
    let app = router(&harness);

    let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health = json_body(response).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["metrics"]["queues"].as_array().unwrap().len(), 4);
}
