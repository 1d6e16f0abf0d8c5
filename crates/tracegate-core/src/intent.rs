//! Intent records, stable intent IDs, and default labels.
//!
//! An intent describes one externally observable side effect the recorded
//! program wishes to perform. Intents live in the bundle's `intents.jsonl`
//! component in commit order; the order of appearance defines both the
//! commit order and the implicit intent ID when no raw id is present.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors parsing or identifying intents.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IntentError {
    /// A line of `intents.jsonl` is not a valid intent record.
    #[error("malformed intent at line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Parse failure description.
        reason: String,
    },

    /// Two intents computed the same stable ID.
    #[error("duplicate intent id: {id}")]
    DuplicateIntentId {
        /// The colliding ID.
        id: String,
    },
}

/// Driver dispatch classes for intent types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentKind {
    /// `file.write` - writes bytes to a path.
    FileWrite,
    /// `http.post` - POSTs a body to a URL.
    HttpPost,
    /// `llm.call` - invokes (or replays) a model completion.
    LlmCall,
    /// Any other type, dispatched by name through the driver registry.
    Custom(String),
}

impl IntentKind {
    /// Maps a wire type string to its dispatch class.
    #[must_use]
    pub fn from_type(intent_type: &str) -> Self {
        match intent_type {
            "file.write" => Self::FileWrite,
            "http.post" => Self::HttpPost,
            "llm.call" => Self::LlmCall,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// One recorded intent, as stored inside a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRecord {
    /// Position in the bundle's intent sequence.
    #[serde(default)]
    pub index: usize,

    /// Wire type, e.g. `file.write`, `http.post`, `email.send`.
    #[serde(rename = "type")]
    pub intent_type: String,

    /// Capture timestamp (RFC3339), when the recorder stamped one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Driver-specific payload.
    pub payload: Value,

    /// Free-form metadata (labels, raw ids).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// An intent with its stable ID attached and default labels applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedIntent {
    /// Stable intent ID: `metadata.id`, else `payload.id`, else `type:####`.
    pub id: String,
    /// The underlying record, with default labels merged into metadata.
    #[serde(flatten)]
    pub record: IntentRecord,
}

impl PlannedIntent {
    /// All string-typed labels from both payload and metadata.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        collect_labels(&self.record.payload, self.record.metadata.as_ref())
    }
}

/// Parses the `intents.jsonl` component.
///
/// Each non-empty line must be a JSON intent record. The `index` field is
/// normalized to the line's position so downstream ordering never depends on
/// recorder-supplied indices.
///
/// # Errors
///
/// Returns [`IntentError::Malformed`] with the offending line number.
pub fn parse_intents(jsonl: &str) -> Result<Vec<IntentRecord>, IntentError> {
    let mut records = Vec::new();
    for (i, line) in jsonl.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut record: IntentRecord =
            serde_json::from_str(trimmed).map_err(|e| IntentError::Malformed {
                line: i + 1,
                reason: e.to_string(),
            })?;
        record.index = records.len();
        records.push(record);
    }
    Ok(records)
}

/// Attaches stable IDs and default labels, rejecting collisions.
///
/// The ID is taken from `metadata.id`, then `payload.id` (string-typed
/// only), and otherwise synthesized as `<type>:<position>` with the position
/// zero-padded to four digits.
///
/// # Errors
///
/// Returns [`IntentError::DuplicateIntentId`] when two intents compute the
/// same ID; such a bundle is ineligible for any gate operation.
pub fn attach_ids(records: Vec<IntentRecord>) -> Result<Vec<PlannedIntent>, IntentError> {
    let mut seen = std::collections::HashSet::new();
    let mut planned = Vec::with_capacity(records.len());
    for (position, mut record) in records.into_iter().enumerate() {
        let id = raw_id(&record)
            .unwrap_or_else(|| format!("{}:{:04}", record.intent_type, position));
        if !seen.insert(id.clone()) {
            return Err(IntentError::DuplicateIntentId { id });
        }
        apply_default_labels(&mut record);
        planned.push(PlannedIntent { id, record });
    }
    Ok(planned)
}

/// Default metadata labels applied by intent type at plan time.
#[must_use]
pub fn default_labels(intent_type: &str) -> &'static [&'static str] {
    match intent_type {
        "email.send" => &["external_email"],
        "payment.create" => &["payment"],
        _ => &[],
    }
}

fn raw_id(record: &IntentRecord) -> Option<String> {
    if let Some(id) = record
        .metadata
        .as_ref()
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
    {
        return Some(id.to_string());
    }
    record
        .payload
        .get("id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn apply_default_labels(record: &mut IntentRecord) {
    let defaults = default_labels(&record.intent_type);
    if defaults.is_empty() {
        return;
    }
    let metadata = record
        .metadata
        .get_or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(obj) = metadata.as_object_mut() else {
        return;
    };
    let labels = obj
        .entry("labels")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(arr) = labels.as_array_mut() else {
        return;
    };
    for label in defaults {
        let present = arr.iter().any(|v| v.as_str() == Some(label));
        if !present {
            arr.push(Value::String((*label).to_string()));
        }
    }
}

/// Collects string-typed labels from a payload and optional metadata.
#[must_use]
pub fn collect_labels(payload: &Value, metadata: Option<&Value>) -> Vec<String> {
    let mut labels = Vec::new();
    for source in [Some(payload), metadata].into_iter().flatten() {
        if let Some(arr) = source.get("labels").and_then(Value::as_array) {
            for label in arr.iter().filter_map(Value::as_str) {
                if !labels.iter().any(|l| l == label) {
                    labels.push(label.to_string());
                }
            }
        }
    }
    labels
}
