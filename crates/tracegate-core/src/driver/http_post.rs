//! HTTP-POST driver: idempotent POSTs with derivable compensation.
//!
//! `prepare` composes headers (defaulting `content-type` and stamping the
//! journal idempotency key) and consults the reversible-HTTP rule registry.
//! `commit` issues the POST, hashes the response body, and derives rollback
//! metadata in priority order:
//!
//! 1. a registry rule match, resolving the created resource's id;
//! 2. the response `Location` header;
//! 3. a top-level `id` field in the response JSON;
//! 4. an explicit `rollback: {method, path}` pair in the response JSON.
//!
//! When none applies the intent is non-reversible and [`Driver::revert`]
//! surfaces it for manual review. Compensating requests carry
//! `Idempotency-Key: <original>-rollback`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use serde_json::{Value, json};

use super::{Driver, DriverError, Prepared, Receipt};
use crate::canonical::hash_bytes;
use crate::context::OpContext;
use crate::journal::JournalIntent;
use crate::rollback::{CommitRequest, RollbackRuleRegistry, resolve};

/// Default per-request timeout when the context carries no deadline.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs a JSON body to a URL and records enough to compensate it.
pub struct HttpPostDriver {
    client: Client,
    registry: Arc<RollbackRuleRegistry>,
}

impl std::fmt::Debug for HttpPostDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPostDriver")
            .field("rules", &self.registry.rules().len())
            .finish_non_exhaustive()
    }
}

struct ParsedPayload {
    url: Url,
    body: String,
    body_json: Option<Value>,
    headers: BTreeMap<String, String>,
}

impl HttpPostDriver {
    /// Creates a driver bound to a rule registry.
    ///
    /// # Panics
    ///
    /// Panics if the underlying HTTP client cannot be constructed, which
    /// only happens when the TLS backend is unavailable.
    #[must_use]
    pub fn new(registry: Arc<RollbackRuleRegistry>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .expect("failed to construct HTTP client");
        Self { client, registry }
    }

    fn parse(intent: &JournalIntent) -> Result<ParsedPayload, DriverError> {
        let url_str = intent
            .payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::PrepareFailed {
                reason: "http.post payload has no url".to_string(),
            })?;
        let url = Url::parse(url_str).map_err(|e| DriverError::PrepareFailed {
            reason: format!("invalid url '{url_str}': {e}"),
        })?;

        let raw_body = intent.payload.get("body").cloned().unwrap_or(Value::Null);
        let (body, body_json) = match raw_body {
            Value::String(s) => {
                let parsed = serde_json::from_str::<Value>(&s).ok();
                (s, parsed)
            },
            Value::Null => (String::new(), None),
            other => (
                serde_json::to_string(&other).map_err(|e| DriverError::PrepareFailed {
                    reason: e.to_string(),
                })?,
                Some(other),
            ),
        };

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        if let Some(map) = intent.payload.get("headers").and_then(Value::as_object) {
            for (name, value) in map {
                if let Some(value) = value.as_str() {
                    headers.insert(name.clone(), value.to_string());
                }
            }
        }
        if !has_header(&headers, "content-type") {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        if !has_header(&headers, "idempotency-key") {
            headers.insert(
                "Idempotency-Key".to_string(),
                intent.idempotency_key.clone(),
            );
        }

        Ok(ParsedPayload {
            url,
            body,
            body_json,
            headers,
        })
    }

    fn request_timeout(ctx: &OpContext) -> Duration {
        ctx.remaining()
            .map_or(DEFAULT_REQUEST_TIMEOUT, |r| r.min(DEFAULT_REQUEST_TIMEOUT))
    }

    fn send(
        &self,
        method: &str,
        url: Url,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
        ctx: &OpContext,
    ) -> Result<(u16, Vec<(String, String)>, String), DriverError> {
        ctx.check()?;
        let mut request = match method {
            "DELETE" => self.client.delete(url),
            "POST" => self.client.post(url),
            other => {
                return Err(DriverError::CommitFailed {
                    reason: format!("unsupported method {other}"),
                });
            },
        };
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request
            .timeout(Self::request_timeout(ctx))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    DriverError::Context(crate::context::ContextError::TimedOut)
                } else {
                    DriverError::CommitFailed {
                        reason: format!("request failed: {e}"),
                    }
                }
            })?;

        let status = response.status().as_u16();
        let resp_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.text().map_err(|e| DriverError::CommitFailed {
            reason: format!("failed to read response body: {e}"),
        })?;
        Ok((status, resp_headers, body))
    }

    fn derive_metadata(
        &self,
        rule_name: Option<&str>,
        resp_headers: &[(String, String)],
        resp_json: Option<&Value>,
    ) -> Option<Value> {
        if let Some(rule) = rule_name.and_then(|name| self.registry.rule_named(name)) {
            let mut entry = json!({
                "name": rule.name,
                "method": rule.rollback.method.as_str(),
                "pathTemplate": rule.rollback.path_template,
            });
            if let Some(headers) = &rule.rollback.headers {
                entry["headers"] = json!(headers);
            }
            match resolve(rule, resp_headers, resp_json) {
                Some(resolved) => {
                    entry["id"] = json!(resolved.id);
                    entry["path"] = json!(resolved.path);
                },
                None => {
                    // The rule claimed this request but the response lacks
                    // the id; the reversal falls to manual review rather
                    // than guessing through the generic fallbacks.
                    entry["id"] = Value::Null;
                },
            }
            return Some(json!({ "rollbackRule": entry }));
        }

        if let Some(location) = resp_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("location"))
            .map(|(_, value)| value.clone())
        {
            return Some(json!({ "location": location }));
        }

        if let Some(id) = resp_json
            .and_then(|body| body.get("id"))
            .and_then(scalar_string)
        {
            return Some(json!({ "id": id }));
        }

        if let Some(rb) = resp_json.and_then(|body| body.get("rollback")) {
            let method = rb.get("method").and_then(Value::as_str);
            let path = rb.get("path").and_then(Value::as_str);
            if let (Some(method), Some(path)) = (method, path) {
                return Some(json!({ "rollback": { "method": method, "path": path } }));
            }
        }

        None
    }
}

impl Driver for HttpPostDriver {
    fn name(&self) -> &str {
        "http.post"
    }

    fn validate(&self, intent: &JournalIntent, _ctx: &OpContext) -> Result<(), DriverError> {
        Self::parse(intent).map(|_| ())
    }

    fn prepare(&self, intent: &JournalIntent, ctx: &OpContext) -> Result<Prepared, DriverError> {
        ctx.check()?;
        let parsed = Self::parse(intent)?;
        let host = parsed.url.host_str().unwrap_or_default().to_string();
        let rule = self
            .registry
            .find_rule(&CommitRequest {
                host: &host,
                method: "POST",
                path: parsed.url.path(),
                headers: &parsed.headers,
                body: parsed.body_json.as_ref(),
            })
            .map(|rule| rule.name.clone());

        Ok(json!({
            "url": parsed.url.as_str(),
            "body": parsed.body,
            "headers": parsed.headers,
            "rule": rule,
        }))
    }

    fn commit(
        &self,
        intent: &JournalIntent,
        prepared: &Prepared,
        ctx: &OpContext,
    ) -> Result<Receipt, DriverError> {
        let url_str = prepared
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::CommitFailed {
                reason: "prepared state has no url".to_string(),
            })?;
        let url = Url::parse(url_str).map_err(|e| DriverError::CommitFailed {
            reason: e.to_string(),
        })?;
        let body = prepared
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let headers: BTreeMap<String, String> = prepared
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let rule_name = prepared.get("rule").and_then(Value::as_str);

        let (status, resp_headers, resp_body) =
            self.send("POST", url, &headers, Some(body), ctx)?;
        if !(200..300).contains(&status) {
            return Err(DriverError::Http { status });
        }

        let resp_json = serde_json::from_str::<Value>(&resp_body).ok();
        let metadata = self.derive_metadata(rule_name, &resp_headers, resp_json.as_ref());

        let mut receipt = json!({
            "status": status,
            "idempotencyKey": intent.idempotency_key,
            "responseHash": hash_bytes(resp_body.as_bytes()),
        });
        if let Some(metadata) = metadata {
            receipt["metadata"] = metadata;
        }
        Ok(receipt)
    }

    fn rollback(
        &self,
        intent: &JournalIntent,
        _prepared: &Prepared,
        _ctx: &OpContext,
    ) -> Result<(), DriverError> {
        // A failed commit means the POST errored or returned non-success;
        // there is no acknowledged resource to compensate.
        tracing::debug!(
            idempotency_key = %intent.idempotency_key,
            "http.post rollback after failed commit is a no-op"
        );
        Ok(())
    }

    fn revert(
        &self,
        intent: &JournalIntent,
        receipt: &Receipt,
        ctx: &OpContext,
    ) -> Result<(), DriverError> {
        let parsed = Self::parse(intent)?;
        let base = parsed.url;
        let intent_id = intent_display_id(intent);

        let Some(metadata) = receipt.get("metadata") else {
            return Err(DriverError::NonReversible { intent_id });
        };

        let mut headers = BTreeMap::new();
        let (method, url) = if let Some(rule_meta) = metadata.get("rollbackRule") {
            let path = rule_meta.get("path").and_then(Value::as_str);
            let Some(path) = path else {
                return Err(DriverError::NonReversible { intent_id });
            };
            if let Some(map) = rule_meta.get("headers").and_then(Value::as_object) {
                for (name, value) in map {
                    if let Some(value) = value.as_str() {
                        headers.insert(name.clone(), value.to_string());
                    }
                }
            }
            let method = rule_meta
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("DELETE")
                .to_string();
            (method, join_base(&base, path)?)
        } else if let Some(location) = metadata.get("location").and_then(Value::as_str) {
            ("DELETE".to_string(), join_base(&base, location)?)
        } else if let Some(id) = metadata.get("id").and_then(scalar_string) {
            let trimmed = base.as_str().trim_end_matches('/').to_string();
            let url = Url::parse(&format!("{trimmed}/{id}")).map_err(|e| {
                DriverError::RollbackFailed {
                    reason: e.to_string(),
                }
            })?;
            ("DELETE".to_string(), url)
        } else if let Some(rb) = metadata.get("rollback") {
            let method = rb
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("DELETE")
                .to_string();
            let path = rb.get("path").and_then(Value::as_str).ok_or_else(|| {
                DriverError::NonReversible {
                    intent_id: intent_id.clone(),
                }
            })?;
            (method, join_base(&base, path)?)
        } else {
            return Err(DriverError::NonReversible { intent_id });
        };

        headers.insert(
            "Idempotency-Key".to_string(),
            format!("{}-rollback", intent.idempotency_key),
        );

        let (status, _, _) = self.send(&method, url, &headers, None, ctx)?;
        // 404 means the resource is already gone; the compensation is
        // idempotent so that counts as reverted.
        if (200..300).contains(&status) || status == 404 {
            Ok(())
        } else {
            Err(DriverError::Http { status })
        }
    }
}

/// Plan-time reversibility summary for an `http.post` payload.
///
/// Reports whether a registry rule claims the request and what the
/// compensation would look like, without touching the network.
#[must_use]
pub fn rollback_plan(payload: &Value, registry: &RollbackRuleRegistry) -> Value {
    let Some(url) = payload
        .get("url")
        .and_then(Value::as_str)
        .and_then(|u| Url::parse(u).ok())
    else {
        return json!({ "available": false });
    };

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    if let Some(map) = payload.get("headers").and_then(Value::as_object) {
        for (name, value) in map {
            if let Some(value) = value.as_str() {
                headers.insert(name.clone(), value.to_string());
            }
        }
    }
    let body_json = match payload.get("body") {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok(),
        Some(other) => Some(other.clone()),
        None => None,
    };

    let host = url.host_str().unwrap_or_default().to_string();
    let rule = registry.find_rule(&CommitRequest {
        host: &host,
        method: "POST",
        path: url.path(),
        headers: &headers,
        body: body_json.as_ref(),
    });

    match rule {
        Some(rule) => json!({
            "available": true,
            "rule": rule.name,
            "method": rule.rollback.method.as_str(),
            "pathTemplate": rule.rollback.path_template,
            "requiresId": rule.rollback.path_template.contains("{id}"),
        }),
        None => json!({ "available": false }),
    }
}

fn has_header(headers: &BTreeMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn intent_display_id(intent: &JournalIntent) -> String {
    intent
        .metadata
        .as_ref()
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
        .map_or_else(|| intent.idempotency_key.clone(), ToString::to_string)
}

/// Resolves `target` against the base URL's origin: absolute URLs pass
/// through, absolute paths replace the base's path.
fn join_base(base: &Url, target: &str) -> Result<Url, DriverError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Url::parse(target).map_err(|e| DriverError::RollbackFailed {
            reason: e.to_string(),
        });
    }
    base.join(target).map_err(|e| DriverError::RollbackFailed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::rollback::{CommitMatch, HttpRollbackRule, RollbackMethod, RollbackSpec};

    fn registry() -> Arc<RollbackRuleRegistry> {
        Arc::new(RollbackRuleRegistry::from_rules(vec![HttpRollbackRule {
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
        }]))
    }

    fn intent(payload: Value) -> JournalIntent {
        JournalIntent {
            intent_type: "http.post".to_string(),
            idempotency_key: "bundle-1:intent-1".to_string(),
            payload,
            metadata: None,
        }
    }

    #[test]
    fn prepare_stamps_default_headers() {
        let driver = HttpPostDriver::new(registry());
        let intent = intent(json!({"url": "http://127.0.0.1:9/x", "body": {"a": 1}}));
        let prepared = driver.prepare(&intent, &OpContext::background()).unwrap();

        let headers = prepared["headers"].as_object().unwrap();
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["Idempotency-Key"], "bundle-1:intent-1");
        assert_eq!(prepared["body"], r#"{"a":1}"#);
    }

    #[test]
    fn prepare_keeps_caller_idempotency_header() {
        let driver = HttpPostDriver::new(registry());
        let intent = intent(json!({
            "url": "http://127.0.0.1:9/x",
            "body": "{}",
            "headers": {"idempotency-key": "caller-key"}
        }));
        let prepared = driver.prepare(&intent, &OpContext::background()).unwrap();
        let headers = prepared["headers"].as_object().unwrap();
        assert_eq!(headers["idempotency-key"], "caller-key");
        assert!(!headers.contains_key("Idempotency-Key"));
    }

    #[test]
    fn prepare_attaches_matching_rule() {
        let driver = HttpPostDriver::new(registry());
        let intent = intent(json!({
            "url": "http://127.0.0.1:8099/messages",
            "body": {"text": "hi"}
        }));
        let prepared = driver.prepare(&intent, &OpContext::background()).unwrap();
        assert_eq!(prepared["rule"], "message-create");
    }

    #[test]
    fn missing_url_fails_validation() {
        let driver = HttpPostDriver::new(registry());
        let err = driver
            .validate(&intent(json!({"body": {}})), &OpContext::background())
            .unwrap_err();
        assert!(matches!(err, DriverError::PrepareFailed { .. }));
    }

    #[test]
    fn revert_without_metadata_is_non_reversible() {
        let driver = HttpPostDriver::new(registry());
        let intent = intent(json!({"url": "http://127.0.0.1:9/messages", "body": {}}));
        let receipt = json!({"status": 200, "responseHash": "aa"});
        let err = driver
            .revert(&intent, &receipt, &OpContext::background())
            .unwrap_err();
        assert!(matches!(err, DriverError::NonReversible { .. }));
    }

    #[test]
    fn revert_with_unresolved_rule_id_is_non_reversible() {
        let driver = HttpPostDriver::new(registry());
        let intent = intent(json!({"url": "http://127.0.0.1:9/messages", "body": {}}));
        let receipt = json!({
            "status": 200,
            "responseHash": "aa",
            "metadata": {"rollbackRule": {"name": "message-create", "method": "DELETE", "id": null}}
        });
        let err = driver
            .revert(&intent, &receipt, &OpContext::background())
            .unwrap_err();
        assert!(matches!(err, DriverError::NonReversible { .. }));
    }

    #[test]
    fn plan_summary_reports_rule_shape() {
        let payload = json!({"url": "http://127.0.0.1:8099/messages", "body": {"text": "hi"}});
        let summary = rollback_plan(&payload, &registry());
        assert_eq!(
            summary,
            json!({
                "available": true,
                "rule": "message-create",
                "method": "DELETE",
                "pathTemplate": "/messages/{id}",
                "requiresId": true,
            })
        );
    }

    #[test]
    fn plan_summary_without_rule_is_unavailable() {
        let payload = json!({"url": "http://elsewhere.test/messages", "body": {}});
        assert_eq!(
            rollback_plan(&payload, &registry()),
            json!({"available": false})
        );
    }

    #[test]
    fn metadata_priority_falls_back_to_location_then_id() {
        let driver = HttpPostDriver::new(registry());
        let headers = vec![("location".to_string(), "/things/7".to_string())];
        let meta = driver.derive_metadata(None, &headers, Some(&json!({"id": "x"})));
        assert_eq!(meta, Some(json!({"location": "/things/7"})));

        let meta = driver.derive_metadata(None, &[], Some(&json!({"id": "x"})));
        assert_eq!(meta, Some(json!({"id": "x"})));

        let meta = driver.derive_metadata(
            None,
            &[],
            Some(&json!({"rollback": {"method": "POST", "path": "/undo"}})),
        );
        assert_eq!(
            meta,
            Some(json!({"rollback": {"method": "POST", "path": "/undo"}}))
        );

        assert_eq!(driver.derive_metadata(None, &[], Some(&json!({"ok": true}))), None);
    }
}
