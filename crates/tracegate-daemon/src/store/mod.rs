//! `SQLite`-backed gate store for bundle blobs, approvals, and receipts.
//!
//! The store uses WAL mode so readers never block the single writer, and
//! every multi-step write runs inside a transaction - a crash mid-commit
//! leaves either a fully written record or none. Bundle blobs live on disk
//! under `<dataDir>/bundles/<id>.tgz`; the database keeps their metadata.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error writing or reading a bundle blob.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored bundle's metadata row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleRow {
    /// Opaque bundle ID.
    pub id: String,
    /// Path of the blob on disk.
    pub path: String,
    /// Ingestion time, RFC3339.
    #[serde(rename = "createdAt")]
    pub created_at: String,
    /// Free-form metadata captured at ingest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// An approval for one bundle; re-approval replaces the prior record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRecord {
    /// The approved bundle.
    #[serde(rename = "bundleId")]
    pub bundle_id: String,
    /// Who approved.
    pub actor: String,
    /// The policy version in force at approval time.
    #[serde(rename = "policyVersion")]
    pub policy_version: String,
    /// Approval time, RFC3339.
    #[serde(rename = "approvedAt")]
    pub approved_at: String,
}

/// Evidence of one committed intent, keyed by `(bundle_id, intent_id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptRecord {
    /// The owning bundle.
    #[serde(rename = "bundleId")]
    pub bundle_id: String,
    /// The committed intent's stable ID.
    #[serde(rename = "intentId")]
    pub intent_id: String,
    /// The intent's wire type.
    #[serde(rename = "intentType")]
    pub intent_type: String,
    /// The driver receipt.
    pub receipt: Value,
    /// Persistence time, RFC3339.
    #[serde(rename = "recordedAt")]
    pub recorded_at: String,
}

/// The persistent gate store.
pub struct GateStore {
    conn: Mutex<Connection>,
    bundles_dir: PathBuf,
}

impl std::fmt::Debug for GateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateStore")
            .field("bundles_dir", &self.bundles_dir)
            .finish_non_exhaustive()
    }
}

impl GateStore {
    /// Opens or creates the store under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory or database cannot be
    /// initialized.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        let bundles_dir = data_dir.join("bundles");
        fs::create_dir_all(&bundles_dir)?;

        let conn = Connection::open(data_dir.join("gate.db"))?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
            bundles_dir,
        })
    }

    /// Writes the bundle blob and records its row transactionally.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on blob or database write failure.
    pub fn persist_bundle(
        &self,
        id: &str,
        bytes: &[u8],
        metadata: Option<&Value>,
        created_at: &str,
    ) -> Result<BundleRow, StoreError> {
        let blob_path = self.bundles_dir.join(format!("{id}.tgz"));
        fs::write(&blob_path, bytes)?;

        let path_str = blob_path.display().to_string();
        let metadata_json = metadata.map(Value::to_string);
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO bundles (id, path, created_at, metadata_json) VALUES (?1, ?2, ?3, ?4)",
            params![id, path_str, created_at, metadata_json],
        )?;

        Ok(BundleRow {
            id: id.to_string(),
            path: path_str,
            created_at: created_at.to_string(),
            metadata: metadata.cloned(),
        })
    }

    /// Fetches one bundle row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub fn get_bundle(&self, id: &str) -> Result<Option<BundleRow>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, path, created_at, metadata_json FROM bundles WHERE id = ?1",
                params![id],
                row_to_bundle,
            )
            .optional()?;
        Ok(row)
    }

    /// All bundle rows, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub fn list_bundles(&self) -> Result<Vec<BundleRow>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, path, created_at, metadata_json FROM bundles ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([], row_to_bundle)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Reads a stored bundle's blob bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the blob is unreadable.
    pub fn read_bundle_bytes(&self, row: &BundleRow) -> Result<Vec<u8>, StoreError> {
        Ok(fs::read(&row.path)?)
    }

    /// Upserts an approval by bundle ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub fn record_approval(&self, record: &ApprovalRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO approvals (bundle_id, actor, policy_version, approved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (bundle_id) DO UPDATE SET
               actor = excluded.actor,
               policy_version = excluded.policy_version,
               approved_at = excluded.approved_at",
            params![
                record.bundle_id,
                record.actor,
                record.policy_version,
                record.approved_at
            ],
        )?;
        Ok(())
    }

    /// The current approval for a bundle, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub fn get_approval(&self, bundle_id: &str) -> Result<Option<ApprovalRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                "SELECT bundle_id, actor, policy_version, approved_at
                 FROM approvals WHERE bundle_id = ?1",
                params![bundle_id],
                |row| {
                    Ok(ApprovalRecord {
                        bundle_id: row.get(0)?,
                        actor: row.get(1)?,
                        policy_version: row.get(2)?,
                        approved_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Upserts a receipt by `(bundle_id, intent_id)`; last writer wins.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub fn save_receipt(&self, record: &ReceiptRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO receipts (bundle_id, intent_id, intent_type, receipt_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (bundle_id, intent_id) DO UPDATE SET
               intent_type = excluded.intent_type,
               receipt_json = excluded.receipt_json,
               recorded_at = excluded.recorded_at",
            params![
                record.bundle_id,
                record.intent_id,
                record.intent_type,
                record.receipt.to_string(),
                record.recorded_at
            ],
        )?;
        Ok(())
    }

    /// Receipts for a bundle, sorted by intent ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub fn list_receipts(&self, bundle_id: &str) -> Result<Vec<ReceiptRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT bundle_id, intent_id, intent_type, receipt_json, recorded_at
             FROM receipts WHERE bundle_id = ?1 ORDER BY intent_id",
        )?;
        let rows = stmt
            .query_map(params![bundle_id], |row| {
                let receipt_json: String = row.get(3)?;
                Ok(ReceiptRecord {
                    bundle_id: row.get(0)?,
                    intent_id: row.get(1)?,
                    intent_type: row.get(2)?,
                    receipt: serde_json::from_str(&receipt_json).unwrap_or(Value::Null),
                    recorded_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// True when any receipt exists for the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub fn has_receipts(&self, bundle_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM receipts WHERE bundle_id = ?1",
            params![bundle_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn row_to_bundle(row: &rusqlite::Row<'_>) -> rusqlite::Result<BundleRow> {
    let metadata_json: Option<String> = row.get(3)?;
    Ok(BundleRow {
        id: row.get(0)?,
        path: row.get(1)?,
        created_at: row.get(2)?,
        metadata: metadata_json.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, GateStore) {
        let dir = TempDir::new().unwrap();
        let store = GateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn persist_and_fetch_bundle() {
        let (_dir, store) = store();
        let row = store
            .persist_bundle("b-1", b"blob", None, "2026-01-01T00:00:00Z")
            .unwrap();
        assert!(row.path.ends_with("b-1.tgz"));

        let fetched = store.get_bundle("b-1").unwrap().unwrap();
        assert_eq!(fetched, row);
        assert_eq!(store.read_bundle_bytes(&fetched).unwrap(), b"blob");
        assert!(store.get_bundle("missing").unwrap().is_none());
    }

    #[test]
    fn list_orders_by_creation() {
        let (_dir, store) = store();
        store
            .persist_bundle("b-2", b"x", None, "2026-01-02T00:00:00Z")
            .unwrap();
        store
            .persist_bundle("b-1", b"x", None, "2026-01-01T00:00:00Z")
            .unwrap();
        let ids: Vec<String> = store
            .list_bundles()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["b-1", "b-2"]);
    }

    #[test]
    fn approval_upsert_replaces_prior() {
        let (_dir, store) = store();
        store
            .record_approval(&ApprovalRecord {
                bundle_id: "b-1".to_string(),
                actor: "alice".to_string(),
                policy_version: "v1".to_string(),
                approved_at: "2026-01-01T00:00:00Z".to_string(),
            })
            .unwrap();
        store
            .record_approval(&ApprovalRecord {
                bundle_id: "b-1".to_string(),
                actor: "bob".to_string(),
                policy_version: "v2".to_string(),
                approved_at: "2026-01-02T00:00:00Z".to_string(),
            })
            .unwrap();

        let approval = store.get_approval("b-1").unwrap().unwrap();
        assert_eq!(approval.actor, "bob");
        assert_eq!(approval.policy_version, "v2");
    }

    #[test]
    fn receipts_upsert_and_sort_by_intent_id() {
        let (_dir, store) = store();
        for intent_id in ["intent-2", "intent-1"] {
            store
                .save_receipt(&ReceiptRecord {
                    bundle_id: "b-1".to_string(),
                    intent_id: intent_id.to_string(),
                    intent_type: "test.mock".to_string(),
                    receipt: json!({"receipt": "applied"}),
                    recorded_at: "2026-01-01T00:00:00Z".to_string(),
                })
                .unwrap();
        }
        // Last-writer-wins on the same key.
        store
            .save_receipt(&ReceiptRecord {
                bundle_id: "b-1".to_string(),
                intent_id: "intent-1".to_string(),
                intent_type: "test.mock".to_string(),
                receipt: json!({"receipt": "updated"}),
                recorded_at: "2026-01-02T00:00:00Z".to_string(),
            })
            .unwrap();

        let receipts = store.list_receipts("b-1").unwrap();
        assert_eq!(receipts.len(), 2);
        assert_eq!(receipts[0].intent_id, "intent-1");
        assert_eq!(receipts[0].receipt, json!({"receipt": "updated"}));
        assert_eq!(receipts[1].intent_id, "intent-2");

        assert!(store.has_receipts("b-1").unwrap());
        assert!(!store.has_receipts("b-2").unwrap());
    }

    #[test]
    fn store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = GateStore::open(dir.path()).unwrap();
            store
                .persist_bundle("b-1", b"blob", Some(&json!({"k": "v"})), "2026-01-01T00:00:00Z")
                .unwrap();
        }
        let store = GateStore::open(dir.path()).unwrap();
        let row = store.get_bundle("b-1").unwrap().unwrap();
        assert_eq!(row.metadata, Some(json!({"k": "v"})));
    }
}
