//! Shared helpers for gate integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tempfile::TempDir;

use tracegate_core::bundle::{Bundle, BundleInput, archive};
use tracegate_core::clock::{Clock, SystemClock};
use tracegate_core::context::OpContext;
use tracegate_core::driver::{Driver, DriverError, DriverRegistry, Prepared, Receipt};
use tracegate_core::intent::IntentRecord;
use tracegate_core::journal::JournalIntent;
use tracegate_core::policy::PolicyConfig;
use tracegate_core::rollback::RollbackRuleRegistry;
use tracegate_daemon::orchestrator::{
    DefaultDriverFactory, DriverFactory, GateError, GateOrchestrator,
};

/// Builds a packed bundle with the given intents and network entries.
pub fn bundle_bytes(intents: Vec<IntentRecord>, network_entries: Vec<Value>) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let input = BundleInput {
        env: json!({"seed": 42, "startTime": "2026-01-02T03:04:05Z"}),
        clock: json!({"version": 1, "initialTime": "2026-01-02T03:04:05Z", "sources": {}}),
        network: json!({"log": {"entries": network_entries}}),
        logs: vec![
            ("stdout.log".to_string(), b"recorded run\n".to_vec()),
            ("stderr.log".to_string(), Vec::new()),
            ("policy.yaml".to_string(), b"version: v1\n".to_vec()),
        ],
        intents,
        ..Default::default()
    };
    Bundle::create(dir.path(), &input, &SystemClock).unwrap();
    archive::pack(dir.path()).unwrap()
}

/// One intent record with a payload.
pub fn intent(intent_type: &str, payload: Value) -> IntentRecord {
    IntentRecord {
        index: 0,
        intent_type: intent_type.to_string(),
        timestamp: None,
        payload,
        metadata: None,
    }
}

/// A recorded network entry.
pub fn network_entry(method: &str, url: &str) -> Value {
    json!({
        "request": {"method": method, "url": url},
        "response": {"status": 200}
    })
}

/// A mock driver for `test.mock` intents: commits to a canned receipt and
/// records every receipt handed back for reversal.
#[derive(Default)]
pub struct MockDriver {
    pub reverted: Mutex<Vec<Value>>,
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "test.mock"
    }

    fn prepare(&self, _: &JournalIntent, _: &OpContext) -> Result<Prepared, DriverError> {
        Ok(Value::Null)
    }

    fn commit(
        &self,
        _: &JournalIntent,
        _: &Prepared,
        _: &OpContext,
    ) -> Result<Receipt, DriverError> {
        Ok(json!({"receipt": "applied"}))
    }

    fn rollback(&self, _: &JournalIntent, _: &Prepared, _: &OpContext) -> Result<(), DriverError> {
        Ok(())
    }

    fn revert(
        &self,
        _: &JournalIntent,
        receipt: &Receipt,
        _: &OpContext,
    ) -> Result<(), DriverError> {
        self.reverted.lock().unwrap().push(receipt.clone());
        Ok(())
    }
}

/// Default drivers plus the `test.mock` driver.
pub struct MockFactory {
    inner: DefaultDriverFactory,
    pub mock: Arc<MockDriver>,
}

impl MockFactory {
    pub fn new(rules: Arc<RollbackRuleRegistry>) -> Self {
        Self {
            inner: DefaultDriverFactory::new(rules, Arc::new(SystemClock)),
            mock: Arc::new(MockDriver::default()),
        }
    }
}

impl DriverFactory for MockFactory {
    fn build(&self, bundle: &Bundle) -> Result<DriverRegistry, GateError> {
        let mut registry = self.inner.build(bundle)?;
        registry.register("test.mock", Arc::clone(&self.mock) as Arc<dyn Driver>);
        Ok(registry)
    }
}

/// An orchestrator over a fresh data dir with the mock factory installed.
pub fn orchestrator_with_mock(
    data_dir: &std::path::Path,
    policy: PolicyConfig,
    rules: RollbackRuleRegistry,
) -> (GateOrchestrator, Arc<MockDriver>) {
    let rules = Arc::new(rules);
    let factory = Arc::new(MockFactory::new(Arc::clone(&rules)));
    let mock = Arc::clone(&factory.mock);
    let orchestrator = GateOrchestrator::new(
        data_dir,
        policy,
        rules,
        Arc::new(SystemClock) as Arc<dyn Clock>,
    )
    .unwrap()
    .with_driver_factory(factory);
    (orchestrator, mock)
}
