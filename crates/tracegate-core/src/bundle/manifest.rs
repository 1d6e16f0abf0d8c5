//! Bundle manifest schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only manifest version this engine accepts.
pub const MANIFEST_VERSION: &str = "deterministic-agent-lab/trace-bundle@1";

/// Fixed component order for the whole-bundle hash.
pub const COMPONENT_ORDER: [&str; 7] = [
    "env", "clock", "network", "fsDiff", "logs", "prompts", "intents",
];

/// Whether a component is a single file or a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
}

/// The expected kind of each component.
#[must_use]
pub fn component_kind(name: &str) -> ComponentKind {
    match name {
        "fsDiff" | "logs" | "prompts" => ComponentKind::Dir,
        _ => ComponentKind::File,
    }
}

/// Per-component relative paths inside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPaths {
    /// `env.json`
    pub env: String,
    /// `clock.json`
    pub clock: String,
    /// `network.har`
    pub network: String,
    /// `fs-diff/`
    #[serde(rename = "fsDiff")]
    pub fs_diff: String,
    /// `logs/`
    pub logs: String,
    /// `prompts/`
    pub prompts: String,
    /// `intents.jsonl`
    pub intents: String,
}

impl ComponentPaths {
    /// The canonical layout used by `create`.
    #[must_use]
    pub fn canonical() -> Self {
        Self {
            env: "env.json".to_string(),
            clock: "clock.json".to_string(),
            network: "network.har".to_string(),
            fs_diff: "fs-diff".to_string(),
            logs: "logs".to_string(),
            prompts: "prompts".to_string(),
            intents: "intents.jsonl".to_string(),
        }
    }

    /// The relative path for a component name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "env" => Some(&self.env),
            "clock" => Some(&self.clock),
            "network" => Some(&self.network),
            "fsDiff" => Some(&self.fs_diff),
            "logs" => Some(&self.logs),
            "prompts" => Some(&self.prompts),
            "intents" => Some(&self.intents),
            _ => None,
        }
    }
}

/// `manifest.json`: version, creation time, component paths and hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format identifier; must equal [`MANIFEST_VERSION`].
    pub version: String,

    /// Creation time, RFC3339.
    #[serde(rename = "createdAt")]
    pub created_at: String,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// Component relative paths.
    pub files: ComponentPaths,

    /// Per-component hex SHA-256 digests, recorded at create time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// The manifest as a JSON value with the `hashes` field omitted.
    ///
    /// The whole-bundle digest hashes this projection so the digest is
    /// identical whether or not per-component hashes were recorded; the
    /// component digests enter through the `component:hash` lines instead.
    #[must_use]
    pub fn value_without_hashes(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("hashes");
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths_cover_every_component() {
        let paths = ComponentPaths::canonical();
        for name in COMPONENT_ORDER {
            assert!(paths.get(name).is_some(), "{name} has no path");
        }
        assert!(paths.get("bogus").is_none());
    }

    #[test]
    fn kinds_match_layout() {
        assert_eq!(component_kind("env"), ComponentKind::File);
        assert_eq!(component_kind("intents"), ComponentKind::File);
        assert_eq!(component_kind("fsDiff"), ComponentKind::Dir);
        assert_eq!(component_kind("logs"), ComponentKind::Dir);
        assert_eq!(component_kind("prompts"), ComponentKind::Dir);
    }

    #[test]
    fn hashes_are_excluded_from_the_digest_projection() {
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            description: None,
            metadata: None,
            files: ComponentPaths::canonical(),
            hashes: Some(BTreeMap::from([("env".to_string(), "aa".to_string())])),
        };
        let value = manifest.value_without_hashes();
        assert!(value.get("hashes").is_none());
        assert!(value.get("files").is_some());
    }
}
