//! File-write driver: captures prior content, writes atomically, restores on
//! rollback.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Driver, DriverError, Prepared, Receipt};
use crate::canonical::hash_bytes;
use crate::context::OpContext;
use crate::journal::JournalIntent;

/// Payload shape for `file.write` intents.
#[derive(Debug, Clone, Deserialize)]
struct FileWritePayload {
    path: String,
    content: String,
    #[serde(default)]
    mode: Option<u32>,
}

/// State captured by `prepare`: everything needed to restore the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileWritePrepared {
    path: String,
    existed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_hash: Option<String>,
}

/// Writes `payload.content` to `payload.path`, retaining the previous bytes
/// and mode so the write can be undone.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileWriteDriver;

impl FileWriteDriver {
    fn parse(intent: &JournalIntent) -> Result<FileWritePayload, DriverError> {
        let payload: FileWritePayload = serde_json::from_value(intent.payload.clone())
            .map_err(|e| DriverError::PrepareFailed {
                reason: format!("malformed file.write payload: {e}"),
            })?;
        if payload.path.is_empty() {
            return Err(DriverError::PathInvalid {
                path: payload.path,
            });
        }
        Ok(payload)
    }
}

impl Driver for FileWriteDriver {
    fn name(&self) -> &str {
        "file.write"
    }

    fn validate(&self, intent: &JournalIntent, _ctx: &OpContext) -> Result<(), DriverError> {
        Self::parse(intent).map(|_| ())
    }

    fn prepare(&self, intent: &JournalIntent, ctx: &OpContext) -> Result<Prepared, DriverError> {
        ctx.check()?;
        let payload = Self::parse(intent)?;
        let path = Path::new(&payload.path);

        let prepared = if path.exists() {
            let meta = fs::metadata(path)?;
            if !meta.is_file() {
                return Err(DriverError::NotAFile {
                    path: payload.path.clone(),
                });
            }
            let prior = fs::read(path)?;
            FileWritePrepared {
                path: payload.path,
                existed: true,
                prior_hash: Some(hash_bytes(&prior)),
                prior_content: Some(BASE64.encode(&prior)),
                prior_mode: Some(file_mode(&meta)),
            }
        } else {
            FileWritePrepared {
                path: payload.path,
                existed: false,
                prior_content: None,
                prior_mode: None,
                prior_hash: None,
            }
        };

        serde_json::to_value(&prepared).map_err(|e| DriverError::PrepareFailed {
            reason: e.to_string(),
        })
    }

    fn commit(
        &self,
        intent: &JournalIntent,
        prepared: &Prepared,
        ctx: &OpContext,
    ) -> Result<Receipt, DriverError> {
        ctx.check()?;
        let payload = Self::parse(intent)?;
        let state: FileWritePrepared = decode_prepared(prepared)?;
        let path = PathBuf::from(&payload.path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, payload.content.as_bytes())?;
        if let Some(mode) = payload.mode {
            set_file_mode(&path, mode)?;
        }

        let mut receipt = json!({
            "path": payload.path,
            "sha256": hash_bytes(payload.content.as_bytes()),
        });
        if let Some(prior_hash) = &state.prior_hash {
            receipt["previousHash"] = json!(prior_hash);
        }
        if state.existed {
            // The receipt must be able to drive the reversal on its own, so
            // it carries the prior bytes alongside the digest.
            receipt["previous"] = json!({
                "content": state.prior_content,
                "mode": state.prior_mode,
            });
        }
        Ok(receipt)
    }

    fn rollback(
        &self,
        _intent: &JournalIntent,
        prepared: &Prepared,
        _ctx: &OpContext,
    ) -> Result<(), DriverError> {
        let state: FileWritePrepared = decode_prepared(prepared)?;
        restore(&state.path, state.existed, state.prior_content.as_deref(), state.prior_mode)
    }

    fn revert(
        &self,
        _intent: &JournalIntent,
        receipt: &Receipt,
        _ctx: &OpContext,
    ) -> Result<(), DriverError> {
        let path = receipt
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::RollbackFailed {
                reason: "receipt has no path".to_string(),
            })?;
        let previous = receipt.get("previous");
        let existed = previous.is_some();
        let content = previous
            .and_then(|p| p.get("content"))
            .and_then(Value::as_str);
        let mode = previous
            .and_then(|p| p.get("mode"))
            .and_then(Value::as_u64)
            .map(|m| m as u32);
        restore(path, existed, content, mode)
    }
}

fn restore(
    path: &str,
    existed: bool,
    content_b64: Option<&str>,
    mode: Option<u32>,
) -> Result<(), DriverError> {
    let path = PathBuf::from(path);
    if existed {
        let encoded = content_b64.ok_or_else(|| DriverError::RollbackFailed {
            reason: format!("no prior content captured for {}", path.display()),
        })?;
        let bytes = BASE64.decode(encoded).map_err(|e| DriverError::RollbackFailed {
            reason: format!("prior content is not valid base64: {e}"),
        })?;
        write_atomic(&path, &bytes)?;
        if let Some(mode) = mode {
            set_file_mode(&path, mode)?;
        }
    } else {
        // The write created the file; undo removes it but keeps any parent
        // directories the commit created.
        match fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Writes bytes via a sibling temp file and rename so readers never observe
/// a partial write.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DriverError> {
    let tmp = path.with_extension("tracegate-tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<(), DriverError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<(), DriverError> {
    Ok(())
}

fn decode_prepared(prepared: &Prepared) -> Result<FileWritePrepared, DriverError> {
    serde_json::from_value(prepared.clone()).map_err(|e| DriverError::RollbackFailed {
        reason: format!("malformed prepared state: {e}"),
    })
}
