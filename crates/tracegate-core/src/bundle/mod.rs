//! Trace bundle engine: create, open, validate, and hash.
//!
//! A bundle is an immutable record of one agent execution. Its seven
//! components live at canonical relative paths under one directory:
//!
//! ```text
//! manifest.json
//! env.json
//! clock.json
//! network.har
//! intents.jsonl
//! fs-diff/base.tar
//! fs-diff/diff/files/<relpath>...
//! fs-diff/diff/deleted.json
//! logs/<filename>...
//! prompts/<NNNN>.json
//! ```
//!
//! The manifest records per-component SHA-256 digests; `validate` recomputes
//! and compares every one, and any mismatch is fatal - there is no partial
//! open. The whole-bundle digest is SHA-256 over the canonical manifest
//! (with `hashes` omitted) followed by `"<component>:<hex>\n"` lines in the
//! fixed component order.

pub mod archive;
mod manifest;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use manifest::{
    COMPONENT_ORDER, ComponentKind, ComponentPaths, MANIFEST_VERSION, Manifest, component_kind,
};

use crate::canonical::{hash_path, to_canonical_string};
use crate::clock::Clock;
use crate::fsdiff::FsDiff;
use crate::har::Har;
use crate::intent::IntentRecord;

/// Errors opening, validating, or hashing a bundle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BundleError {
    /// `manifest.json` is absent.
    #[error("manifest.json is missing")]
    ManifestMissing,

    /// `manifest.json` exists but is not valid JSON.
    #[error("manifest.json is malformed: {reason}")]
    ManifestMalformed {
        /// Parse failure description.
        reason: String,
    },

    /// The manifest parsed but violates the schema.
    #[error("manifest schema violation: {details}")]
    SchemaViolation {
        /// What was violated.
        details: String,
    },

    /// A component named by the manifest is absent.
    #[error("component missing: {name}")]
    ComponentMissing {
        /// The absent component.
        name: String,
    },

    /// A component exists but is a file where a directory was expected, or
    /// vice versa.
    #[error("component kind mismatch: {name}")]
    KindMismatch {
        /// The offending component.
        name: String,
    },

    /// A recomputed component hash differs from the recorded one.
    #[error("hash mismatch for component '{component}': expected {expected}, got {actual}")]
    HashMismatch {
        /// The tampered component.
        component: String,
        /// The digest the manifest recorded.
        expected: String,
        /// The digest computed from disk.
        actual: String,
    },

    /// Underlying filesystem failure.
    #[error("bundle I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to create a bundle.
#[derive(Debug, Clone, Default)]
pub struct BundleInput {
    /// The `env.json` document.
    pub env: Value,
    /// The `clock.json` document.
    pub clock: Value,
    /// The `network.har` document.
    pub network: Value,
    /// The base filesystem snapshot as tar bytes.
    pub base_tar: Vec<u8>,
    /// Post-change files as `(relative path, bytes)`.
    pub changed_files: Vec<(String, Vec<u8>)>,
    /// Relative paths deleted by the run.
    pub deleted: Vec<String>,
    /// Log files as `(name, bytes)`; at minimum stdout.log and stderr.log.
    pub logs: Vec<(String, Vec<u8>)>,
    /// Ordered prompt recordings.
    pub prompts: Vec<Value>,
    /// Ordered intent records.
    pub intents: Vec<IntentRecord>,
    /// Manifest description.
    pub description: Option<String>,
    /// Manifest metadata.
    pub metadata: Option<Value>,
}

/// An opened (validated) bundle rooted at a directory.
#[derive(Debug, Clone)]
pub struct Bundle {
    dir: PathBuf,
    manifest: Manifest,
}

impl Bundle {
    /// Writes a new bundle into `dir` and returns it opened.
    ///
    /// Components are written to their canonical relative paths, per-
    /// component hashes computed, and the manifest written last.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Io`] on write failure.
    pub fn create(
        dir: impl AsRef<Path>,
        input: &BundleInput,
        clock: &dyn Clock,
    ) -> Result<Self, BundleError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let paths = ComponentPaths::canonical();

        write_json(&dir.join(&paths.env), &input.env)?;
        write_json(&dir.join(&paths.clock), &input.clock)?;
        write_json(&dir.join(&paths.network), &input.network)?;

        let mut intents_jsonl = String::new();
        for record in &input.intents {
            let line = serde_json::to_string(record)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            intents_jsonl.push_str(&line);
            intents_jsonl.push('\n');
        }
        fs::write(dir.join(&paths.intents), intents_jsonl)?;

        let fs_diff_dir = dir.join(&paths.fs_diff);
        fs::create_dir_all(fs_diff_dir.join("diff").join("files"))?;
        fs::write(fs_diff_dir.join("base.tar"), &input.base_tar)?;
        for (rel, bytes) in &input.changed_files {
            let target = fs_diff_dir.join("diff").join("files").join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, bytes)?;
        }
        write_json(
            &fs_diff_dir.join("diff").join("deleted.json"),
            &serde_json::json!(input.deleted),
        )?;

        let logs_dir = dir.join(&paths.logs);
        fs::create_dir_all(&logs_dir)?;
        for (name, bytes) in &input.logs {
            fs::write(logs_dir.join(name), bytes)?;
        }

        let prompts_dir = dir.join(&paths.prompts);
        fs::create_dir_all(&prompts_dir)?;
        for (i, recording) in input.prompts.iter().enumerate() {
            write_json(&prompts_dir.join(format!("{i:04}.json")), recording)?;
        }

        let mut hashes = BTreeMap::new();
        for name in COMPONENT_ORDER {
            let rel = paths.get(name).expect("known component");
            hashes.insert(name.to_string(), hash_path(dir.join(rel))?);
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            created_at: clock.now().to_rfc3339(),
            description: input.description.clone(),
            metadata: input.metadata.clone(),
            files: paths,
            hashes: Some(hashes),
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join("manifest.json"), manifest_json + "\n")?;

        Ok(Self { dir, manifest })
    }

    /// Opens the bundle rooted at `dir`, running full validation.
    ///
    /// # Errors
    ///
    /// Any validation failure is fatal; there is no partially opened bundle.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, BundleError> {
        let dir = dir.as_ref().to_path_buf();
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.is_file() {
            return Err(BundleError::ManifestMissing);
        }
        let raw = fs::read_to_string(&manifest_path)?;
        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|e| BundleError::ManifestMalformed {
                reason: e.to_string(),
            })?;
        let bundle = Self { dir, manifest };
        bundle.validate()?;
        Ok(bundle)
    }

    /// The bundle's root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The parsed manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Absolute path of a component.
    #[must_use]
    pub fn component_path(&self, name: &str) -> Option<PathBuf> {
        self.manifest.files.get(name).map(|rel| self.dir.join(rel))
    }

    /// Checks schema, component presence and kind, and recorded hashes.
    ///
    /// # Errors
    ///
    /// The first violation found is returned; a hash mismatch marks the
    /// bundle ineligible for any gate operation.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.manifest.version != MANIFEST_VERSION {
            return Err(BundleError::SchemaViolation {
                details: format!(
                    "unsupported version '{}', expected '{MANIFEST_VERSION}'",
                    self.manifest.version
                ),
            });
        }
        if self.manifest.created_at.is_empty() {
            return Err(BundleError::SchemaViolation {
                details: "createdAt is empty".to_string(),
            });
        }

        for name in COMPONENT_ORDER {
            let rel = self
                .manifest
                .files
                .get(name)
                .expect("component order is exhaustive");
            if rel.is_empty() {
                return Err(BundleError::SchemaViolation {
                    details: format!("files.{name} is empty"),
                });
            }
            let path = self.dir.join(rel);
            if !path.exists() {
                return Err(BundleError::ComponentMissing {
                    name: name.to_string(),
                });
            }
            let is_dir = path.is_dir();
            let want_dir = component_kind(name) == ComponentKind::Dir;
            if is_dir != want_dir {
                return Err(BundleError::KindMismatch {
                    name: name.to_string(),
                });
            }
            if let Some(hashes) = &self.manifest.hashes {
                if let Some(expected) = hashes.get(name) {
                    let actual = hash_path(&path)?;
                    if &actual != expected {
                        return Err(BundleError::HashMismatch {
                            component: name.to_string(),
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Computes the whole-bundle digest.
    ///
    /// SHA-256 over `canonical(manifest without hashes)` followed by
    /// `"<component>:<hex>\n"` for each component in fixed order, with the
    /// component digests recomputed from disk.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Io`] if a component cannot be read.
    pub fn hash(&self) -> Result<String, BundleError> {
        let mut hasher = Sha256::new();
        hasher.update(to_canonical_string(&self.manifest.value_without_hashes()).as_bytes());
        for name in COMPONENT_ORDER {
            let rel = self
                .manifest
                .files
                .get(name)
                .expect("component order is exhaustive");
            let component_hash = hash_path(self.dir.join(rel))?;
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(component_hash.as_bytes());
            hasher.update(b"\n");
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Parses the intents component.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::SchemaViolation`] on malformed intent lines.
    pub fn intents(&self) -> Result<Vec<IntentRecord>, BundleError> {
        let path = self
            .component_path("intents")
            .expect("intents is a known component");
        let raw = fs::read_to_string(path)?;
        crate::intent::parse_intents(&raw).map_err(|e| BundleError::SchemaViolation {
            details: e.to_string(),
        })
    }

    /// Parses the network component.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::SchemaViolation`] on malformed HAR.
    pub fn har(&self) -> Result<Har, BundleError> {
        let path = self
            .component_path("network")
            .expect("network is a known component");
        Har::load(path).map_err(|e| BundleError::SchemaViolation {
            details: e.to_string(),
        })
    }

    /// Loads the filesystem diff component.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::SchemaViolation`] when the diff layout is
    /// incomplete.
    pub fn fs_diff(&self) -> Result<FsDiff, BundleError> {
        let path = self
            .component_path("fsDiff")
            .expect("fsDiff is a known component");
        FsDiff::load(path).map_err(|e| BundleError::SchemaViolation {
            details: e.to_string(),
        })
    }

    /// Reads the env component.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::SchemaViolation`] on malformed JSON.
    pub fn env(&self) -> Result<Value, BundleError> {
        let path = self.component_path("env").expect("env is a known component");
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| BundleError::SchemaViolation {
            details: format!("env.json: {e}"),
        })
    }

    /// Reads one log file by name.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Io`] when the log is absent or unreadable.
    pub fn log(&self, name: &str) -> Result<Vec<u8>, BundleError> {
        let path = self
            .component_path("logs")
            .expect("logs is a known component")
            .join(name);
        Ok(fs::read(path)?)
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), BundleError> {
    let pretty = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, pretty + "\n")?;
    Ok(())
}
