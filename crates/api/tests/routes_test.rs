mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{FakeSupervisor, FakeWorker};
use scheduler_core::models::Operation;

async fn post(app: Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = common::supervisor_routes(&Arc::new(FakeSupervisor::default()));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_supervisor_task_endpoints() {
    let fake = Arc::new(FakeSupervisor::default());
    let app = common::supervisor_routes(&fake);

    let (status, body) = post(app.clone(), "/supervisor/rpc/task/get", json!({"task_id": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["task_id"], 1);

    let (_, body) = post(app.clone(), "/supervisor/rpc/task/get", json!({"task_id": 2})).await;
    assert!(body["data"].is_null());

    let (status, body) = post(
        app,
        "/supervisor/rpc/task/stop",
        json!({
            "instance_id": 10,
            "task_id": 1,
            "worker": "app:w1:127.0.0.1:9000",
            "operation": Operation::Trigger,
            "to_state": "FINISHED",
            "error_msg": null
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"], true);
    assert_eq!(fake.stopped.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_supervisor_error_status_mapping() {
    let fake = Arc::new(FakeSupervisor::default());
    let app = common::supervisor_routes(&fake);

    let (status, body) = post(app.clone(), "/supervisor/rpc/job/trigger", json!({"job_id": 7})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], 700);

    let (status, body) = post(app.clone(), "/supervisor/rpc/job/trigger", json!({"job_id": 404})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "JOB_NOT_FOUND");

    let (status, _) = post(app.clone(), "/supervisor/rpc/instance/pause", json!({"instance_id": 1})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post(
        app.clone(),
        "/supervisor/rpc/instance/cancel",
        json!({"instance_id": 1, "operation": Operation::Trigger}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        app,
        "/supervisor/rpc/instance/cancel",
        json!({"instance_id": 1, "operation": Operation::ManualCancel}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        fake.canceled.lock().unwrap().as_slice(),
        &[(1, Operation::ManualCancel)]
    );
}

#[tokio::test]
async fn test_worker_endpoints() {
    let fake = Arc::new(FakeWorker::default());
    let app = common::worker_routes(&fake);

    let param = serde_json::to_value(common::handler_param("shell", "a,b,c")).unwrap();
    let (status, body) = post(app.clone(), "/worker/rpc/verify", param.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], true);

    let (_, body) = post(app.clone(), "/worker/rpc/split", param).await;
    assert_eq!(body["data"], json!(["a", "b", "c"]));

    let dispatch = json!({
        "worker": "app:w1:127.0.0.1:9000",
        "params": [common::execute_param(5)]
    });
    let (status, _) = post(app.clone(), "/worker/rpc/dispatch", dispatch.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fake.received.lock().unwrap().len(), 1);

    fake.full.store(true, std::sync::atomic::Ordering::SeqCst);
    let (status, body) = post(app, "/worker/rpc/dispatch", dispatch).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RESOURCE_EXHAUSTED");
}

#[tokio::test]
async fn test_malformed_body_is_client_error() {
    let app = common::worker_routes(&Arc::new(FakeWorker::default()));
    let (status, _) = post(app, "/worker/rpc/verify", json!({"group": 1})).await;
    assert!(status.is_client_error());
}
