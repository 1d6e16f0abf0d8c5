//! A file write whose commit fails after the bytes hit disk is rolled back
//! to the prior content, and the journal records the failure.

use std::fs;
use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::TempDir;

use tracegate_core::clock::SystemClock;
use tracegate_core::context::OpContext;
use tracegate_core::driver::{
    Driver, DriverError, FileWriteDriver, Prepared, Receipt,
};
use tracegate_core::journal::{EntryStatus, Journal, JournalError, JournalIntent};

/// Delegates to the real file driver but fails after the write lands, so
/// the journal must restore the prior content.
struct WriteThenFail {
    inner: FileWriteDriver,
}

impl Driver for WriteThenFail {
    fn name(&self) -> &str {
        "file.write"
    }

    fn prepare(&self, intent: &JournalIntent, ctx: &OpContext) -> Result<Prepared, DriverError> {
        self.inner.prepare(intent, ctx)
    }

    fn commit(
        &self,
        intent: &JournalIntent,
        prepared: &Prepared,
        ctx: &OpContext,
    ) -> Result<Receipt, DriverError> {
        self.inner.commit(intent, prepared, ctx)?;
        Err(DriverError::CommitFailed {
            reason: "post-write verification failed".to_string(),
        })
    }

    fn rollback(
        &self,
        intent: &JournalIntent,
        prepared: &Prepared,
        ctx: &OpContext,
    ) -> Result<(), DriverError> {
        self.inner.rollback(intent, prepared, ctx)
    }

    fn revert(
        &self,
        intent: &JournalIntent,
        receipt: &Receipt,
        ctx: &OpContext,
    ) -> Result<(), DriverError> {
        self.inner.revert(intent, receipt, ctx)
    }
}

#[test]
fn failed_commit_restores_baseline_and_journals_the_rollback() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("w").join("note.txt");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, "baseline").unwrap();

    let journal = Journal::open(dir.path().join("journal.jsonl"), Arc::new(SystemClock)).unwrap();
    let driver = WriteThenFail {
        inner: FileWriteDriver,
    };
    let intent = JournalIntent {
        intent_type: "file.write".to_string(),
        idempotency_key: "bundle:write-1".to_string(),
        payload: json!({
            "path": target.to_str().unwrap(),
            "content": "new-content"
        }),
        metadata: None,
    };

    let err = journal
        .append(&intent, &driver, &OpContext::background())
        .unwrap_err();
    assert!(matches!(
        err,
        JournalError::Driver(DriverError::CommitFailed { .. })
    ));

    // The write was undone.
    assert_eq!(fs::read_to_string(&target).unwrap(), "baseline");

    // The journal's last entry records the rollback.
    let entries = journal.entries();
    let last = entries.last().unwrap();
    assert_eq!(last.status, EntryStatus::Rolledback);
    assert!(last.error.as_deref().unwrap().contains("verification"));
    assert_eq!(last.receipt, None::<Value>);
}

#[test]
fn successful_write_then_revert_round_trips_through_the_receipt() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("note.txt");
    fs::write(&target, "baseline").unwrap();

    let journal = Journal::open(dir.path().join("journal.jsonl"), Arc::new(SystemClock)).unwrap();
    let driver = FileWriteDriver;
    let intent = JournalIntent {
        intent_type: "file.write".to_string(),
        idempotency_key: "bundle:write-1".to_string(),
        payload: json!({
            "path": target.to_str().unwrap(),
            "content": "new-content"
        }),
        metadata: None,
    };

    let entry = journal
        .append(&intent, &driver, &OpContext::background())
        .unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), "new-content");

    let receipt = entry.receipt.unwrap();
    driver
        .revert(&intent, &receipt, &OpContext::background())
        .unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), "baseline");
}
