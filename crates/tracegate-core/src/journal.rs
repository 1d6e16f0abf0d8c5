//! Append-only intent journal with idempotent two-phase commits.
//!
//! The journal is scoped to one JSONL file with a single writer; concurrent
//! callers serialize through a mutex and an exclusive `flock` guards against
//! a second process. Each entry is one JSON line terminated by `\n` and
//! fsynced before the in-memory state advances, so the on-disk journal is
//! always equal to or ahead of memory.
//!
//! # Append contract
//!
//! 1. A committed entry with the same idempotency key short-circuits: the
//!    prior entry is returned unchanged (at-most-once).
//! 2. `plan` and `validate` failures propagate without persisting anything.
//! 3. A `prepare` failure persists a `rolledback` entry and propagates.
//! 4. A `commit` failure invokes `rollback(prepared)` best-effort, persists
//!    a `rolledback` entry, and propagates the original error.
//!
//! Re-opening the file replays every line with strict newline framing: a
//! half-written trailing line is a parse error, not a silently dropped
//! record - admitting a shortened journal would break the at-most-once
//! audit trail.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock::Clock;
use crate::context::{ContextError, OpContext};
use crate::driver::{Driver, DriverError};

/// Width of the zero-padded decimal entry ID.
const ID_WIDTH: usize = 12;

/// Errors from journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// The journal file contains a line that is not a valid entry.
    #[error("journal parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Failure description.
        reason: String,
    },

    /// Filesystem failure reading or appending the journal.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A driver phase failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The operation's context expired or was cancelled.
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Terminal status of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// The driver commit succeeded and the receipt is recorded.
    Committed,
    /// Prepare or commit failed; any partial effect was compensated.
    Rolledback,
}

/// The unit of work handed to [`Journal::append`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalIntent {
    /// Wire intent type, used for driver dispatch.
    #[serde(rename = "intentType")]
    pub intent_type: String,
    /// Stable key collapsing retried appends to one committed entry.
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    /// Driver-specific payload.
    pub payload: Value,
    /// Free-form metadata carried into the entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// One persisted journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic 12-digit zero-padded decimal ID.
    pub id: String,
    /// Wire intent type.
    #[serde(rename = "intentType")]
    pub intent_type: String,
    /// The intent's idempotency key.
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    /// The committed payload.
    pub payload: Value,
    /// Driver receipt, present on committed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Value>,
    /// RFC3339 persistence timestamp.
    pub timestamp: String,
    /// Terminal status.
    pub status: EntryStatus,
    /// Metadata carried from the intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Failure description on rolledback entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct JournalInner {
    file: File,
    entries: Vec<JournalEntry>,
    /// Index of the committed entry per idempotency key.
    committed: HashMap<String, usize>,
    next_seq: u64,
}

/// The append-only intent journal.
///
/// Holds an exclusive file lock for its lifetime; a second opener on the
/// same path fails instead of corrupting the log.
pub struct Journal {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    inner: Mutex<JournalInner>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Opens or creates the journal at `path`, replaying existing entries.
    ///
    /// # Errors
    ///
    /// - [`JournalError::Io`] if the file cannot be opened or locked.
    /// - [`JournalError::Parse`] on any malformed or unterminated line.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .truncate(false)
            .append(true)
            .open(&path)?;
        fs2::FileExt::try_lock_exclusive(&file).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("journal is locked by another process ({}): {e}", path.display()),
            )
        })?;

        let raw = std::fs::read(&path)?;
        let (entries, committed, next_seq) = replay(&raw)?;

        Ok(Self {
            path,
            clock,
            inner: Mutex::new(JournalInner {
                file,
                entries,
                committed,
                next_seq,
            }),
        })
    }

    /// The journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of persisted entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("journal lock poisoned").entries.len()
    }

    /// True when no entries are persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner
            .lock()
            .expect("journal lock poisoned")
            .entries
            .clone()
    }

    /// The committed entry for an idempotency key, if any.
    #[must_use]
    pub fn committed_entry(&self, idempotency_key: &str) -> Option<JournalEntry> {
        let inner = self.inner.lock().expect("journal lock poisoned");
        inner
            .committed
            .get(idempotency_key)
            .map(|&i| inner.entries[i].clone())
    }

    /// Runs one intent through `driver` and persists the outcome.
    ///
    /// The entire driver lifecycle executes inside the journal's critical
    /// section - including the driver's external I/O - so idempotency stays
    /// atomic with respect to external effects. A stuck network call
    /// therefore stalls further appends on this journal; callers bound that
    /// exposure through `ctx`.
    ///
    /// # Errors
    ///
    /// Propagates driver failures per the append contract; returns
    /// [`JournalError::Io`] if persisting the outcome fails.
    pub fn append(
        &self,
        intent: &JournalIntent,
        driver: &dyn Driver,
        ctx: &OpContext,
    ) -> Result<JournalEntry, JournalError> {
        let mut inner = self.inner.lock().expect("journal lock poisoned");

        if let Some(&i) = inner.committed.get(&intent.idempotency_key) {
            return Ok(inner.entries[i].clone());
        }

        ctx.check()?;
        driver.plan(intent, ctx)?;
        driver.validate(intent, ctx)?;

        let prepared = match driver.prepare(intent, ctx) {
            Ok(prepared) => prepared,
            Err(err) => {
                let entry = self.persist(
                    &mut inner,
                    intent,
                    EntryStatus::Rolledback,
                    None,
                    Some(err.to_string()),
                )?;
                tracing::warn!(
                    intent_type = %intent.intent_type,
                    entry_id = %entry.id,
                    error = %err,
                    "prepare failed; rolledback entry persisted"
                );
                return Err(err.into());
            },
        };

        match driver.commit(intent, &prepared, ctx) {
            Ok(receipt) => {
                let entry = self.persist(
                    &mut inner,
                    intent,
                    EntryStatus::Committed,
                    Some(receipt),
                    None,
                )?;
                Ok(entry)
            },
            Err(err) => {
                if let Err(rollback_err) = driver.rollback(intent, &prepared, ctx) {
                    tracing::warn!(
                        intent_type = %intent.intent_type,
                        error = %rollback_err,
                        "best-effort rollback failed after commit error"
                    );
                }
                let entry = self.persist(
                    &mut inner,
                    intent,
                    EntryStatus::Rolledback,
                    None,
                    Some(err.to_string()),
                )?;
                tracing::warn!(
                    intent_type = %intent.intent_type,
                    entry_id = %entry.id,
                    error = %err,
                    "commit failed; rolledback entry persisted"
                );
                Err(err.into())
            },
        }
    }

    /// Serializes one entry, appends it with a trailing newline, fsyncs, and
    /// only then updates the in-memory state.
    fn persist(
        &self,
        inner: &mut JournalInner,
        intent: &JournalIntent,
        status: EntryStatus,
        receipt: Option<Value>,
        error: Option<String>,
    ) -> Result<JournalEntry, JournalError> {
        let entry = JournalEntry {
            id: format!("{:0width$}", inner.next_seq, width = ID_WIDTH),
            intent_type: intent.intent_type.clone(),
            idempotency_key: intent.idempotency_key.clone(),
            payload: intent.payload.clone(),
            receipt,
            timestamp: self.clock.now().to_rfc3339(),
            status,
            metadata: intent.metadata.clone(),
            error,
        };

        let line = serde_json::to_string(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(inner.file, "{line}")?;
        inner.file.sync_all()?;

        inner.next_seq += 1;
        if entry.status == EntryStatus::Committed {
            inner
                .committed
                .insert(entry.idempotency_key.clone(), inner.entries.len());
        }
        inner.entries.push(entry.clone());
        Ok(entry)
    }
}

/// Replays raw journal bytes with strict newline framing.
#[allow(clippy::type_complexity)]
fn replay(raw: &[u8]) -> Result<(Vec<JournalEntry>, HashMap<String, usize>, u64), JournalError> {
    let mut entries: Vec<JournalEntry> = Vec::new();
    let mut committed = HashMap::new();
    let mut last_id: Option<u64> = None;

    if !raw.is_empty() && raw.last() != Some(&b'\n') {
        let line = raw.iter().filter(|&&b| b == b'\n').count() + 1;
        return Err(JournalError::Parse {
            line,
            reason: "unterminated trailing line".to_string(),
        });
    }

    let text = std::str::from_utf8(raw).map_err(|e| JournalError::Parse {
        line: 0,
        reason: format!("journal is not valid UTF-8: {e}"),
    })?;

    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry =
            serde_json::from_str(line).map_err(|e| JournalError::Parse {
                line: i + 1,
                reason: e.to_string(),
            })?;
        let id: u64 = entry.id.parse().map_err(|_| JournalError::Parse {
            line: i + 1,
            reason: format!("entry id is not decimal: {}", entry.id),
        })?;
        if let Some(prev) = last_id {
            if id <= prev {
                return Err(JournalError::Parse {
                    line: i + 1,
                    reason: format!("entry id {id} is not strictly increasing after {prev}"),
                });
            }
        }
        last_id = Some(id);

        if entry.status == EntryStatus::Committed {
            let prior = committed.insert(entry.idempotency_key.clone(), entries.len());
            if prior.is_some() {
                return Err(JournalError::Parse {
                    line: i + 1,
                    reason: format!(
                        "second committed entry for idempotency key '{}'",
                        entry.idempotency_key
                    ),
                });
            }
        }
        entries.push(entry);
    }

    let next_seq = last_id.map_or(0, |id| id + 1);
    Ok((entries, committed, next_seq))
}
