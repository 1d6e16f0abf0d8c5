//! Mode-bound prompt store for LLM recordings.
//!
//! Recordings live as zero-padded `NNNN.json` files inside the bundle's
//! `prompts/` directory. In record mode the store assigns the next free
//! index; in replay mode it hands recordings back in ascending index order,
//! one per LLM intent, and never contacts a provider.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;

/// Width of the zero-padded recording index.
const INDEX_WIDTH: usize = 4;

/// Errors from the prompt store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PromptError {
    /// Filesystem failure reading or writing a recording.
    #[error("prompt store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A recording file is not valid JSON.
    #[error("malformed recording {path}: {reason}")]
    Malformed {
        /// The offending file.
        path: String,
        /// Parse failure description.
        reason: String,
    },

    /// Replay requested more recordings than the bundle holds.
    #[error("replay exhausted: no recording at index {index}")]
    ReplayExhausted {
        /// The missing index.
        index: usize,
    },
}

/// Whether the store produces new recordings or replays existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Provider calls happen; each completion is persisted.
    Record,
    /// No provider calls; recordings are consumed in order.
    Replay,
}

/// Ordered store of prompt recordings bound to one directory and mode.
#[derive(Debug)]
pub struct PromptStore {
    dir: PathBuf,
    mode: PromptMode,
    /// Next index to write (record) or consume (replay).
    cursor: Mutex<usize>,
}

impl PromptStore {
    /// Opens the store over `dir`.
    ///
    /// In record mode the cursor starts after the highest existing index so
    /// recordings are never overwritten; in replay mode it starts at zero.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError::Io`] if the directory cannot be created or
    /// scanned.
    pub fn open(dir: impl AsRef<Path>, mode: PromptMode) -> Result<Self, PromptError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let cursor = match mode {
            PromptMode::Replay => 0,
            PromptMode::Record => next_free_index(&dir)?,
        };
        Ok(Self {
            dir,
            mode,
            cursor: Mutex::new(cursor),
        })
    }

    /// The store's mode.
    #[must_use]
    pub const fn mode(&self) -> PromptMode {
        self.mode
    }

    /// Persists a recording at the next free index, returning its path.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError::Io`] on write failure.
    pub fn record(&self, recording: &Value) -> Result<PathBuf, PromptError> {
        let mut cursor = self.cursor.lock().expect("prompt store lock poisoned");
        let path = self.index_path(*cursor);
        let pretty = serde_json::to_string_pretty(recording)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, pretty + "\n")?;
        *cursor += 1;
        Ok(path)
    }

    /// Consumes and returns the next recording in ascending index order.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError::ReplayExhausted`] past the last recording and
    /// [`PromptError::Malformed`] on unparseable files.
    pub fn next_replay(&self) -> Result<(usize, Value), PromptError> {
        let mut cursor = self.cursor.lock().expect("prompt store lock poisoned");
        let index = *cursor;
        let path = self.index_path(index);
        if !path.is_file() {
            return Err(PromptError::ReplayExhausted { index });
        }
        let raw = fs::read_to_string(&path)?;
        let value = serde_json::from_str(&raw).map_err(|e| PromptError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        *cursor += 1;
        Ok((index, value))
    }

    fn index_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{index:0width$}.json", width = INDEX_WIDTH))
    }
}

fn next_free_index(dir: &Path) -> Result<usize, PromptError> {
    let mut max: Option<usize> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        if let Ok(index) = stem.parse::<usize>() {
            max = Some(max.map_or(index, |m| m.max(index)));
        }
    }
    Ok(max.map_or(0, |m| m + 1))
}
