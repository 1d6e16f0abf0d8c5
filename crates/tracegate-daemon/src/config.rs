//! Daemon configuration from environment and CLI overrides.
//!
//! - `GATE_POLICY`: path to the policy file or directory. When unset or
//!   absent, a default-permissive policy (version `default`) is used and a
//!   warning is logged - useful for local trials, never for production.
//! - `GATE_DATA_DIR`: persistence root (bundle blobs, gate.db, journal).
//!   Defaults to `./gate-data`.

use std::path::PathBuf;

use thiserror::Error;

use tracegate_core::policy::{PolicyConfig, PolicyError};
use tracegate_core::rollback::{RegistryError, RollbackRuleRegistry};

/// Environment variable naming the policy path.
pub const ENV_POLICY: &str = "GATE_POLICY";

/// Environment variable naming the persistence root.
pub const ENV_DATA_DIR: &str = "GATE_DATA_DIR";

/// Errors resolving the configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The policy file exists but fails to load.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The rollback rule file exists but fails to load.
    #[error(transparent)]
    Rules(#[from] RegistryError),
}

/// Resolved daemon configuration.
#[derive(Debug)]
pub struct GateConfig {
    /// Persistence root.
    pub data_dir: PathBuf,
    /// The loaded policy.
    pub policy: PolicyConfig,
    /// The loaded reversible-HTTP rules.
    pub rules: RollbackRuleRegistry,
}

impl GateConfig {
    /// Resolves configuration from explicit overrides, falling back to the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a named policy or rule file fails to
    /// parse. A missing policy path falls back to the permissive default.
    pub fn resolve(
        policy_override: Option<PathBuf>,
        data_dir_override: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let data_dir = data_dir_override
            .or_else(|| std::env::var_os(ENV_DATA_DIR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("gate-data"));

        let policy_path =
            policy_override.or_else(|| std::env::var_os(ENV_POLICY).map(PathBuf::from));

        let (policy, rules) = match policy_path {
            Some(path) if path.exists() => {
                let policy = PolicyConfig::load(&path)?;
                let rules = RollbackRuleRegistry::load_sibling(&path)?;
                (policy, rules)
            },
            Some(path) => {
                tracing::warn!(
                    path = %path.display(),
                    "policy path does not exist; using permissive default policy"
                );
                (default_policy(), RollbackRuleRegistry::empty())
            },
            None => {
                tracing::warn!("no GATE_POLICY configured; using permissive default policy");
                (default_policy(), RollbackRuleRegistry::empty())
            },
        };

        Ok(Self {
            data_dir,
            policy,
            rules,
        })
    }
}

fn default_policy() -> PolicyConfig {
    PolicyConfig {
        version: "default".to_string(),
        ..Default::default()
    }
}
