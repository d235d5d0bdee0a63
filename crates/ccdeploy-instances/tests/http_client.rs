//! HTTP scheduler client tests against a local stub scheduler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use ccdeploy_instances::*;
use ccdeploy_state::{ProcessRecord, ProcessState};

fn test_process(id: &str, instances: u32) -> ProcessRecord {
    ProcessRecord {
        id: id.to_string(),
        app_id: "app-1".to_string(),
        process_type: "web-deployment-d1".to_string(),
        state: ProcessState::Started,
        instances,
        droplet_id: None,
        restart_count: 0,
        created_at: 1000,
        updated_at: 1000,
    }
}

async fn actual_lrps(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    match params.get("process_guid").map(String::as_str) {
        Some("proc-ok") => Json(serde_json::json!([
            {"index": 0, "state": "RUNNING", "since": 1_000_000_000u64},
            {"index": 1, "state": "CLAIMED", "since": 1_000_000_000u64},
        ]))
        .into_response(),
        Some("proc-garbage") => (StatusCode::OK, "not json").into_response(),
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn spawn_scheduler() -> SocketAddr {
    let router = Router::new().route("/v1/actual_lrps", get(actual_lrps));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn fetches_instances_for_process() {
    let addr = spawn_scheduler().await;
    let client = HttpInstancesClient::new(addr.to_string(), Duration::from_secs(2));

    let instances = client
        .actual_instances(&test_process("proc-ok", 2))
        .await
        .unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].state, SchedulerState::Running);
    assert_eq!(instances[1].state, SchedulerState::Claimed);
}

#[tokio::test]
async fn reporter_translates_http_results() {
    let addr = spawn_scheduler().await;
    let client = HttpInstancesClient::new(addr.to_string(), Duration::from_secs(2));
    let reporter = InstancesReporter::new(Arc::new(client));

    let statuses = reporter
        .all_instances_for_process(&test_process("proc-ok", 3))
        .await
        .unwrap();
    assert_eq!(statuses[&0].state, InstanceState::Running);
    assert_eq!(statuses[&0].since, 1);
    assert_eq!(statuses[&1].state, InstanceState::Starting);
    assert_eq!(statuses[&2].state, InstanceState::Down);
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let addr = spawn_scheduler().await;
    let client = HttpInstancesClient::new(addr.to_string(), Duration::from_secs(2));

    let err = client
        .actual_instances(&test_process("proc-missing", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, InstancesError::Status(500)));
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let addr = spawn_scheduler().await;
    let client = HttpInstancesClient::new(addr.to_string(), Duration::from_secs(2));

    let err = client
        .actual_instances(&test_process("proc-garbage", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, InstancesError::Decode(_)));
}

#[tokio::test]
async fn closed_port_surfaces_as_unavailable() {
    // Nothing listens on port 1.
    let client = HttpInstancesClient::new("127.0.0.1:1", Duration::from_millis(500));
    let reporter = InstancesReporter::new(Arc::new(client));

    let err = reporter
        .all_instances_for_process(&test_process("proc-ok", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, InstancesError::Unavailable(_)));
}
