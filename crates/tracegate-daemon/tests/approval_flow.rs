//! End-to-end approval gate flow over the HTTP API: a labeled intent plans
//! as requires-approval, commit is refused until an approval exists, and
//! revert hands the stored receipt back to the driver.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::util::ServiceExt;

use tracegate_core::policy::{AllowRule, Caps, PolicyConfig};
use tracegate_core::rollback::RollbackRuleRegistry;
use tracegate_daemon::http::{AppState, router};

use common::{bundle_bytes, intent, network_entry, orchestrator_with_mock};

fn approval_policy() -> PolicyConfig {
    PolicyConfig {
        version: "v1".to_string(),
        allow: vec![AllowRule {
            domains: vec!["example.com".to_string()],
            methods: vec!["POST".to_string()],
            paths: vec!["/api".to_string()],
        }],
        caps: Caps {
            max_amount: Some(1000.0),
        },
        require_approval_labels: vec!["external_email".to_string()],
        time_window: None,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(path: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

#[tokio::test]
async fn labeled_intent_is_gated_on_approval() {
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, mock) = orchestrator_with_mock(
        data_dir.path(),
        approval_policy(),
        RollbackRuleRegistry::empty(),
    );
    let app = router(AppState::new(Arc::new(orchestrator)));

    // Ingest a bundle with one labeled intent and one allowed network entry.
    let bytes = bundle_bytes(
        vec![intent(
            "test.mock",
            json!({
                "id": "intent-1",
                "labels": ["external_email"],
                "amount": 10,
                "action": "send"
            }),
        )],
        vec![network_entry("POST", "https://example.com/api")],
    );
    let (status, body) = send(&app, post("/bundles", Body::from(bytes))).await;
    assert_eq!(status, StatusCode::CREATED);
    let bundle_id = body["bundleId"].as_str().unwrap().to_string();

    // Plan: allowed, but approval is required.
    let (status, plan) = send(
        &app,
        Request::builder()
            .uri(format!("/bundles/{bundle_id}/plan"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["policy"]["bundle"]["allowed"], json!(true));
    assert_eq!(plan["policy"]["bundle"]["requiresApproval"], json!(true));
    assert_eq!(plan["intents"][0]["id"], "intent-1");

    // Commit before approval is refused.
    let (status, body) = send(
        &app,
        post(&format!("/bundles/{bundle_id}/commit"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "ApprovalRequired");

    // Approve, then commit succeeds with the mock receipt.
    let (status, body) = send(
        &app,
        post(
            &format!("/bundles/{bundle_id}/approve"),
            Body::from(r#"{"actor": "alice"}"#),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert_eq!(body["approval"]["actor"], "alice");
    assert_eq!(body["approval"]["policyVersion"], "v1");

    let (status, body) = send(
        &app,
        post(&format!("/bundles/{bundle_id}/commit"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "committed");
    assert_eq!(
        body["receipts"],
        json!([{"intentId": "intent-1", "receipt": {"receipt": "applied"}}])
    );

    // Revert invokes the driver with the stored receipt.
    let (status, body) = send(
        &app,
        post(&format!("/bundles/{bundle_id}/revert"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "reverted");
    let reverted = mock.reverted.lock().unwrap();
    assert_eq!(reverted.as_slice(), &[json!({"receipt": "applied"})]);

    // Revert preserves history: the bundle stays committed.
    let (status, body) = send(
        &app,
        Request::builder().uri("/bundles").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bundles"][0]["status"], "committed");
    assert_eq!(body["bundles"][0]["approval"]["actor"], "alice");
}

#[tokio::test]
async fn missing_actor_is_a_bad_request() {
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) = orchestrator_with_mock(
        data_dir.path(),
        approval_policy(),
        RollbackRuleRegistry::empty(),
    );
    let app = router(AppState::new(Arc::new(orchestrator)));

    let bytes = bundle_bytes(
        vec![intent("test.mock", json!({"id": "intent-1"}))],
        vec![],
    );
    let (_, body) = send(&app, post("/bundles", Body::from(bytes))).await;
    let bundle_id = body["bundleId"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        post(&format!("/bundles/{bundle_id}/approve"), Body::from("{}")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_bundle_returns_not_found() {
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) = orchestrator_with_mock(
        data_dir.path(),
        approval_policy(),
        RollbackRuleRegistry::empty(),
    );
    let app = router(AppState::new(Arc::new(orchestrator)));

    for request in [
        Request::builder()
            .uri("/bundles/nope/plan")
            .body(Body::empty())
            .unwrap(),
        post("/bundles/nope/commit", Body::empty()),
        post("/bundles/nope/revert", Body::empty()),
    ] {
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn blocked_amount_denies_commit_with_reasons() {
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) = orchestrator_with_mock(
        data_dir.path(),
        approval_policy(),
        RollbackRuleRegistry::empty(),
    );
    let app = router(AppState::new(Arc::new(orchestrator)));

    let bytes = bundle_bytes(
        vec![intent(
            "test.mock",
            json!({"id": "intent-1", "amount": 5000}),
        )],
        vec![],
    );
    let (_, body) = send(&app, post("/bundles", Body::from(bytes))).await;
    let bundle_id = body["bundleId"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        post(&format!("/bundles/{bundle_id}/commit"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "PolicyDenied");
    assert!(body["reasons"][0].as_str().unwrap().contains("5000"));
}

#[tokio::test]
async fn revert_without_receipts_is_a_bad_request() {
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) = orchestrator_with_mock(
        data_dir.path(),
        approval_policy(),
        RollbackRuleRegistry::empty(),
    );
    let app = router(AppState::new(Arc::new(orchestrator)));

    let bytes = bundle_bytes(
        vec![intent("test.mock", json!({"id": "intent-1"}))],
        vec![],
    );
    let (_, body) = send(&app, post("/bundles", Body::from(bytes))).await;
    let bundle_id = body["bundleId"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        post(&format!("/bundles/{bundle_id}/revert"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "NoReceipts");
}

#[tokio::test]
async fn duplicate_intent_ids_are_rejected_at_ingest() {
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) = orchestrator_with_mock(
        data_dir.path(),
        approval_policy(),
        RollbackRuleRegistry::empty(),
    );
    let app = router(AppState::new(Arc::new(orchestrator)));

    let bytes = bundle_bytes(
        vec![
            intent("test.mock", json!({"id": "same"})),
            intent("test.mock", json!({"id": "same"})),
        ],
        vec![],
    );
    let (status, body) = send(&app, post("/bundles", Body::from(bytes))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "DuplicateIntentId");
}

#[tokio::test]
async fn empty_ingest_body_is_rejected() {
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) = orchestrator_with_mock(
        data_dir.path(),
        approval_policy(),
        RollbackRuleRegistry::empty(),
    );
    let app = router(AppState::new(Arc::new(orchestrator)));

    let (status, _) = send(&app, post("/bundles", Body::empty())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
