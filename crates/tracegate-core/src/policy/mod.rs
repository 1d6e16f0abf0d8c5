//! Policy configuration and the pure evaluation engine.
//!
//! A policy is a small structured rule set - network allowlist, amount caps,
//! approval labels, and an optional time window - evaluated over a bundle's
//! intents and recorded network traffic. Evaluation is deterministic and
//! side-effect-free: the same policy, context, intents, and network entries
//! always produce the same [`Evaluation`].

mod engine;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use engine::{
    BundleDecision, EvalContext, Evaluation, IntentDecision, NetworkDecision, Stage, evaluate,
};

/// Errors loading a policy file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The policy file or directory cannot be read.
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),

    /// The policy file is not valid YAML/JSON or violates the schema.
    #[error("malformed policy: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// No policy file was found at or under the given path.
    #[error("no policy file found at {path}")]
    NotFound {
        /// The searched path.
        path: String,
    },

    /// A config field failed semantic validation.
    #[error("invalid policy: {reason}")]
    Invalid {
        /// Failure description.
        reason: String,
    },
}

/// One network allowlist rule. Empty fields mean "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRule {
    /// Hosts this rule covers, compared case-insensitively.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Methods this rule covers; empty matches any method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Path patterns (literal, `prefix*`, or bare `*`); empty matches any.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Numeric caps applied to intent payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Caps {
    /// Maximum allowed `payload.amount`; larger amounts block the intent.
    #[serde(rename = "maxAmount", skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<f64>,
}

/// A daily time window in a named timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Window start, `HH:MM`.
    pub start: String,
    /// Window end, `HH:MM`, inclusive.
    pub end: String,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
}

/// The full policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy version string recorded on approvals.
    #[serde(default)]
    pub version: String,

    /// Network allowlist; an empty list allows all recorded traffic.
    #[serde(default)]
    pub allow: Vec<AllowRule>,

    /// Numeric caps.
    #[serde(default)]
    pub caps: Caps,

    /// Labels whose presence on an intent demands an approval.
    #[serde(rename = "requireApprovalLabels", default)]
    pub require_approval_labels: Vec<String>,

    /// Commit-hours window; outside it every intent requires approval.
    #[serde(rename = "timeWindow", default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
}

impl PolicyConfig {
    /// Loads a policy from a YAML or JSON file, or from a directory
    /// containing `policy.yaml`, `policy.yml`, or `policy.json`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when no policy file exists, it fails to
    /// parse, or semantic validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            ["policy.yaml", "policy.yml", "policy.json"]
                .iter()
                .map(|name| path.join(name))
                .find(|p| p.is_file())
                .ok_or_else(|| PolicyError::NotFound {
                    path: path.display().to_string(),
                })?
        } else if path.is_file() {
            path.to_path_buf()
        } else {
            return Err(PolicyError::NotFound {
                path: path.display().to_string(),
            });
        };

        let raw = std::fs::read_to_string(&file)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond the serde schema.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] on unparseable window times or an
    /// unknown timezone.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if let Some(window) = &self.time_window {
            engine::parse_hhmm(&window.start).ok_or_else(|| PolicyError::Invalid {
                reason: format!("time window start '{}' is not HH:MM", window.start),
            })?;
            engine::parse_hhmm(&window.end).ok_or_else(|| PolicyError::Invalid {
                reason: format!("time window end '{}' is not HH:MM", window.end),
            })?;
            window
                .timezone
                .parse::<chrono_tz::Tz>()
                .map_err(|_| PolicyError::Invalid {
                    reason: format!("unknown timezone '{}'", window.timezone),
                })?;
        }
        Ok(())
    }
}
