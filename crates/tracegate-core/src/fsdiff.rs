//! Filesystem diff component: base snapshot, changed files, deletions.
//!
//! The `fs-diff/` directory inside a bundle carries the input filesystem as
//! `base.tar`, post-change files under `diff/files/<relpath>`, and a JSON
//! array of deleted relative paths in `diff/deleted.json`. Reconstruction
//! applies `base + files - deleted` into a fresh working directory.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Byte budget scanned for NUL when classifying a file as binary.
const BINARY_SCAN_LIMIT: usize = 1000;

/// Errors loading or applying a filesystem diff.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FsDiffError {
    /// A required component file or directory is absent.
    #[error("fs-diff component missing: {path}")]
    Missing {
        /// The absent path, relative to the diff root.
        path: String,
    },

    /// `deleted.json` is not a JSON array of strings.
    #[error("malformed deleted.json: {0}")]
    MalformedDeleted(#[from] serde_json::Error),

    /// A recorded path would escape the reconstruction root.
    #[error("unsafe path in fs-diff: {path}")]
    UnsafePath {
        /// The offending relative path.
        path: String,
    },

    /// Underlying I/O failure.
    #[error("fs-diff I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A loaded `fs-diff/` component.
#[derive(Debug, Clone)]
pub struct FsDiff {
    base_tar: PathBuf,
    files_dir: PathBuf,
    deleted: Vec<String>,
}

impl FsDiff {
    /// Loads the diff rooted at `dir` (the bundle's `fs-diff` directory).
    ///
    /// # Errors
    ///
    /// Returns [`FsDiffError::Missing`] when `base.tar` is absent and
    /// [`FsDiffError::MalformedDeleted`] when the deletion list is not a
    /// string array. `diff/files` and `diff/deleted.json` are optional; their
    /// absence means "no changes" / "no deletions".
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, FsDiffError> {
        let dir = dir.as_ref();
        let base_tar = dir.join("base.tar");
        if !base_tar.is_file() {
            return Err(FsDiffError::Missing {
                path: "base.tar".to_string(),
            });
        }
        let files_dir = dir.join("diff").join("files");
        let deleted_path = dir.join("diff").join("deleted.json");
        let deleted = if deleted_path.is_file() {
            serde_json::from_str(&fs::read_to_string(&deleted_path)?)?
        } else {
            Vec::new()
        };
        Ok(Self {
            base_tar,
            files_dir,
            deleted,
        })
    }

    /// Relative paths deleted by the recorded run.
    #[must_use]
    pub fn deleted(&self) -> &[String] {
        &self.deleted
    }

    /// Reconstructs the post-run filesystem into `dest`.
    ///
    /// Applies the base snapshot, overlays changed files, then removes
    /// deleted paths. `dest` must already exist and be a directory.
    ///
    /// # Errors
    ///
    /// Returns [`FsDiffError`] on unsafe recorded paths or I/O failure.
    pub fn reconstruct(&self, dest: &Path) -> Result<(), FsDiffError> {
        let mut archive = tar::Archive::new(fs::File::open(&self.base_tar)?);
        archive.unpack(dest)?;

        if self.files_dir.is_dir() {
            overlay_dir(&self.files_dir, &self.files_dir, dest)?;
        }

        for rel in &self.deleted {
            let target = join_checked(dest, rel)?;
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else if target.exists() {
                fs::remove_file(&target)?;
            }
        }
        Ok(())
    }
}

/// Reports whether content should be treated as binary.
///
/// A file is binary when its first 1000 bytes contain a NUL byte. The
/// heuristic is preserved exactly as the recorder applies it.
#[must_use]
pub fn is_binary(bytes: &[u8]) -> bool {
    let scan = &bytes[..bytes.len().min(BINARY_SCAN_LIMIT)];
    scan.contains(&0)
}

fn overlay_dir(root: &Path, dir: &Path, dest: &Path) -> Result<(), FsDiffError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            overlay_dir(root, &path, dest)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let target = join_checked(dest, &rel.to_string_lossy())?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

/// Joins a recorded relative path onto `root`, rejecting traversal.
fn join_checked(root: &Path, rel: &str) -> Result<PathBuf, FsDiffError> {
    let rel_path = Path::new(rel);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {},
            _ => {
                return Err(FsDiffError::UnsafePath {
                    path: rel.to_string(),
                });
            },
        }
    }
    Ok(root.join(rel_path))
}
