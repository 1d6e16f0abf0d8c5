//! Reversible-HTTP flow against a local stub server: a registry rule
//! derives the compensating DELETE from the commit response, and a response
//! missing the id field degrades to a non-reversible intent.

mod common;

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tempfile::TempDir;

use tracegate_core::context::OpContext;
use tracegate_core::policy::PolicyConfig;
use tracegate_core::rollback::{
    CommitMatch, HttpRollbackRule, RollbackMethod, RollbackRuleRegistry, RollbackSpec,
};
use tracegate_daemon::orchestrator::RevertStatus;

use common::{bundle_bytes, intent, orchestrator_with_mock};

/// One observed request: method, path, headers (lowercased names).
type Observed = (String, String, BTreeMap<String, String>);

struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Observed>>>,
}

/// Serves `post_body` for POSTs and `{}` for DELETEs, recording everything.
fn start_stub(post_body: &'static str) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let seen = Arc::clone(&seen);
            std::thread::spawn(move || handle(stream, &seen, post_body));
        }
    });

    StubServer { addr, requests }
}

fn handle(stream: TcpStream, seen: &Mutex<Vec<Observed>>, post_body: &str) {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = BTreeMap::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.trim_end().split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().unwrap_or(0);
            }
            headers.insert(name, value);
        }
    }
    let mut body = vec![0u8; content_length];
    let _ = reader.read_exact(&mut body);

    seen.lock().unwrap().push((method.clone(), path, headers));

    let body = if method == "POST" { post_body } else { "{}" };
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let mut stream = reader.into_inner();
    let _ = stream.write_all(response.as_bytes());
}

fn message_rules() -> RollbackRuleRegistry {
    RollbackRuleRegistry::from_rules(vec![HttpRollbackRule {
        name: "message-create".to_string(),
        host_pattern: "127.0.0.1".to_string(),
        commit: CommitMatch {
            method: "POST".to_string(),
            path_pattern: "/messages".to_string(),
            id_from: vec!["json:$.messageId".to_string()],
        },
        rollback: RollbackSpec {
            method: RollbackMethod::Delete,
            path_template: "/messages/{id}".to_string(),
            headers: None,
        },
        matchers: None,
    }])
}

fn permissive_policy() -> PolicyConfig {
    PolicyConfig {
        version: "v1".to_string(),
        ..Default::default()
    }
}

#[test]
fn registry_rule_drives_the_compensating_delete() {
    let server = start_stub(r#"{"messageId":"message-1"}"#);
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) =
        orchestrator_with_mock(data_dir.path(), permissive_policy(), message_rules());

    let url = format!("http://{}/messages", server.addr);
    let bytes = bundle_bytes(
        vec![intent(
            "http.post",
            json!({"id": "msg-1", "url": url, "body": {"text": "hi"}}),
        )],
        vec![],
    );
    let bundle_id = orchestrator.ingest(&bytes).unwrap();

    // Plan reports the rule-derived rollback shape without touching the
    // network.
    let plan = orchestrator.plan(&bundle_id).unwrap();
    assert_eq!(
        plan.intents[0].rollback,
        Some(json!({
            "available": true,
            "rule": "message-create",
            "method": "DELETE",
            "pathTemplate": "/messages/{id}",
            "requiresId": true,
        }))
    );
    assert!(server.requests.lock().unwrap().is_empty());

    // Commit extracts the created id into the receipt metadata.
    let receipts = orchestrator
        .commit(&bundle_id, &OpContext::background())
        .unwrap();
    assert_eq!(receipts.len(), 1);
    let metadata = &receipts[0].receipt["metadata"]["rollbackRule"];
    assert_eq!(metadata["id"], "message-1");
    assert_eq!(metadata["name"], "message-create");

    // The POST carried the journal idempotency key.
    {
        let observed = server.requests.lock().unwrap();
        let (method, path, headers) = &observed[0];
        assert_eq!((method.as_str(), path.as_str()), ("POST", "/messages"));
        assert_eq!(
            headers.get("idempotency-key").map(String::as_str),
            Some(format!("{bundle_id}:msg-1").as_str())
        );
    }

    // Revert issues DELETE /messages/message-1 with the -rollback key.
    let outcomes = orchestrator
        .revert(&bundle_id, &OpContext::background())
        .unwrap();
    assert_eq!(outcomes[0].status, RevertStatus::Reverted);

    let observed = server.requests.lock().unwrap();
    let deletes: Vec<&Observed> = observed.iter().filter(|(m, _, _)| m == "DELETE").collect();
    assert!(!deletes.is_empty(), "server must observe at least one delete");
    let (_, path, headers) = deletes[0];
    assert_eq!(path, "/messages/message-1");
    assert_eq!(
        headers.get("idempotency-key").map(String::as_str),
        Some(format!("{bundle_id}:msg-1-rollback").as_str())
    );
}

#[test]
fn missing_id_field_degrades_to_non_reversible() {
    let server = start_stub(r#"{"ok":true}"#);
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) =
        orchestrator_with_mock(data_dir.path(), permissive_policy(), message_rules());

    let url = format!("http://{}/messages", server.addr);
    let bytes = bundle_bytes(
        vec![intent(
            "http.post",
            json!({"id": "msg-1", "url": url, "body": {"text": "hi"}}),
        )],
        vec![],
    );
    let bundle_id = orchestrator.ingest(&bytes).unwrap();

    // Commit still succeeds; the rule matched but the id never resolved.
    let receipts = orchestrator
        .commit(&bundle_id, &OpContext::background())
        .unwrap();
    assert_eq!(receipts[0].receipt["metadata"]["rollbackRule"]["id"], json!(null));

    // Revert surfaces the intent for manual review and issues no request.
    let outcomes = orchestrator
        .revert(&bundle_id, &OpContext::background())
        .unwrap();
    assert_eq!(outcomes[0].status, RevertStatus::NonReversible);

    let observed = server.requests.lock().unwrap();
    assert!(
        observed.iter().all(|(method, _, _)| method != "DELETE"),
        "no compensating request may be issued"
    );
}

#[test]
fn json_id_fallback_reverts_via_delete() {
    // No registry rules at all: the driver falls back to the response's
    // JSON id field and deletes <base>/<id>.
    let server = start_stub(r#"{"id":"thing-9"}"#);
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) = orchestrator_with_mock(
        data_dir.path(),
        permissive_policy(),
        RollbackRuleRegistry::empty(),
    );

    let url = format!("http://{}/things", server.addr);
    let bytes = bundle_bytes(
        vec![intent(
            "http.post",
            json!({"id": "t-1", "url": url, "body": {"kind": "widget"}}),
        )],
        vec![],
    );
    let bundle_id = orchestrator.ingest(&bytes).unwrap();

    let receipts = orchestrator
        .commit(&bundle_id, &OpContext::background())
        .unwrap();
    assert_eq!(receipts[0].receipt["metadata"]["id"], "thing-9");

    let outcomes = orchestrator
        .revert(&bundle_id, &OpContext::background())
        .unwrap();
    assert_eq!(outcomes[0].status, RevertStatus::Reverted);

    let observed = server.requests.lock().unwrap();
    assert!(observed
        .iter()
        .any(|(method, path, _)| method == "DELETE" && path == "/things/thing-9"));
}

#[test]
fn commit_is_idempotent_per_intent() {
    // Committing twice after a partial failure cannot double-POST: the
    // journal collapses the retry onto the committed entry.
    let server = start_stub(r#"{"messageId":"message-1"}"#);
    let data_dir = TempDir::new().unwrap();
    let (orchestrator, _mock) =
        orchestrator_with_mock(data_dir.path(), permissive_policy(), message_rules());

    let url = format!("http://{}/messages", server.addr);
    let bytes = bundle_bytes(
        vec![intent(
            "http.post",
            json!({"id": "msg-1", "url": url, "body": {"text": "hi"}}),
        )],
        vec![],
    );
    let bundle_id = orchestrator.ingest(&bytes).unwrap();

    orchestrator
        .commit(&bundle_id, &OpContext::background())
        .unwrap();
    // A second commit on a committed bundle is refused outright.
    let err = orchestrator
        .commit(&bundle_id, &OpContext::background())
        .unwrap_err();
    assert!(matches!(
        err,
        tracegate_daemon::orchestrator::GateError::AlreadyCommitted { .. }
    ));

    let observed = server.requests.lock().unwrap();
    let posts = observed.iter().filter(|(m, _, _)| m == "POST").count();
    assert_eq!(posts, 1, "the effect must be applied exactly once");
}
