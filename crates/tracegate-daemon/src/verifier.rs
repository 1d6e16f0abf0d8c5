//! Replay verifier: re-run a bundle in a collaborator sandbox and diff its
//! observable outputs against the recording.
//!
//! The sandbox itself (container/process isolation) and the allowlist proxy
//! are external collaborators; this module owns the orchestration seam: it
//! reconstructs the recorded input filesystem, prepares the deterministic
//! environment (seed, start time, replay mode, clock file), hands off to a
//! [`SandboxRunner`], and compares stdout/stderr byte-for-byte.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;

use tracegate_core::bundle::{Bundle, BundleError};
use tracegate_core::fsdiff::FsDiffError;
use tracegate_core::replay::ReplayReport;

/// Errors from replay verification (distinct from a replay *mismatch*,
/// which is a successful verification with `success = false`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifierError {
    /// The bundle could not be read.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// The input filesystem could not be reconstructed.
    #[error(transparent)]
    FsDiff(#[from] FsDiffError),

    /// The sandbox collaborator failed to run the agent at all.
    #[error("sandbox failed: {reason}")]
    Sandbox {
        /// Failure description.
        reason: String,
    },

    /// Scratch directory failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the verifier hands to the sandbox collaborator.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// The reconstructed working directory.
    pub workdir: PathBuf,
    /// Deterministic environment for the replayed agent.
    pub env: BTreeMap<String, String>,
    /// The bundle's HAR, for the replay proxy.
    pub har_path: PathBuf,
}

/// What the sandbox reports back.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Process exit code.
    pub exit_code: i32,
}

/// The sandbox collaborator interface.
pub trait SandboxRunner: Send + Sync {
    /// Runs the recorded agent against the prepared request.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::Sandbox`] when the run cannot be started or
    /// observed; output divergence is not an error.
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutcome, VerifierError>;
}

/// Orchestrates one replay verification.
pub struct ReplayVerifier {
    runner: Arc<dyn SandboxRunner>,
}

impl std::fmt::Debug for ReplayVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayVerifier").finish_non_exhaustive()
    }
}

impl ReplayVerifier {
    /// Creates a verifier over a sandbox collaborator.
    #[must_use]
    pub fn new(runner: Arc<dyn SandboxRunner>) -> Self {
        Self { runner }
    }

    /// Replays `bundle` and compares observable outputs to the recording.
    ///
    /// The scratch working directory is removed on every exit path,
    /// including errors, by tying it to this function's scope.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError`] when reconstruction or the sandbox fails;
    /// a diverging replay is reported inside the [`ReplayReport`] instead.
    pub fn verify(&self, bundle: &Bundle) -> Result<ReplayReport, VerifierError> {
        let scratch = TempDir::new()?;
        let workdir = scratch.path().join("workspace");
        std::fs::create_dir_all(&workdir)?;

        bundle.fs_diff()?.reconstruct(&workdir)?;

        let env_doc = bundle.env()?;
        let mut env = BTreeMap::new();
        env.insert("AGENT_DETERMINISTIC".to_string(), "1".to_string());
        env.insert("AGENT_EXECUTION_MODE".to_string(), "replay".to_string());
        if let Some(seed) = env_value(&env_doc, "seed") {
            env.insert("AGENT_SEED".to_string(), seed);
        }
        if let Some(start) = env_value(&env_doc, "startTime") {
            env.insert("AGENT_START_TIME".to_string(), start);
        }
        let clock_path = bundle
            .component_path("clock")
            .expect("clock is a known component");
        env.insert(
            "AGENT_CLOCK_FILE".to_string(),
            clock_path.display().to_string(),
        );

        let request = SandboxRequest {
            workdir,
            env,
            har_path: bundle
                .component_path("network")
                .expect("network is a known component"),
        };
        let outcome = self.runner.run(&request)?;

        let recorded_stdout = bundle.log("stdout.log")?;
        let recorded_stderr = bundle.log("stderr.log")?;
        let report = ReplayReport::compare(
            &recorded_stdout,
            &outcome.stdout,
            &recorded_stderr,
            &outcome.stderr,
            outcome.exit_code,
        );
        if !report.success {
            tracing::warn!(
                stdout_matches = report.stdout_matches,
                stderr_matches = report.stderr_matches,
                exit_code = report.exit_code,
                "replay diverged from recording"
            );
        }
        Ok(report)
    }
}

fn env_value(doc: &Value, key: &str) -> Option<String> {
    match doc.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use tracegate_core::bundle::BundleInput;
    use tracegate_core::clock::FixedClock;
    use tracegate_core::replay::DiffKind;

    /// Replays whatever outputs it was constructed with.
    struct CannedRunner {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: i32,
        saw_env: std::sync::Mutex<Option<BTreeMap<String, String>>>,
    }

    impl CannedRunner {
        fn new(stdout: &[u8], stderr: &[u8], exit_code: i32) -> Self {
            Self {
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
                exit_code,
                saw_env: std::sync::Mutex::new(None),
            }
        }
    }

    impl SandboxRunner for CannedRunner {
        fn run(&self, request: &SandboxRequest) -> Result<SandboxOutcome, VerifierError> {
            assert!(request.workdir.is_dir(), "workdir must be reconstructed");
            *self.saw_env.lock().unwrap() = Some(request.env.clone());
            Ok(SandboxOutcome {
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
                exit_code: self.exit_code,
            })
        }
    }

    fn sample_bundle(dir: &TempDir) -> Bundle {
        let input = BundleInput {
            env: json!({"seed": 1234, "startTime": "2026-01-02T03:04:05Z"}),
            clock: json!({"version": 1, "initialTime": "2026-01-02T03:04:05Z", "sources": {}}),
            network: json!({"log": {"entries": []}}),
            logs: vec![
                ("stdout.log".to_string(), b"hello\n".to_vec()),
                ("stderr.log".to_string(), Vec::new()),
                ("policy.yaml".to_string(), b"version: v1\n".to_vec()),
            ],
            ..Default::default()
        };
        let clock = FixedClock(chrono::Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
        Bundle::create(dir.path(), &input, &clock).unwrap()
    }

    #[test]
    fn matching_replay_succeeds_and_env_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let bundle = sample_bundle(&dir);
        let runner = Arc::new(CannedRunner::new(b"hello\n", b"", 0));
        let verifier = ReplayVerifier::new(runner.clone());

        let report = verifier.verify(&bundle).unwrap();
        assert!(report.success);

        let env = runner.saw_env.lock().unwrap().clone().unwrap();
        assert_eq!(env["AGENT_SEED"], "1234");
        assert_eq!(env["AGENT_START_TIME"], "2026-01-02T03:04:05Z");
        assert_eq!(env["AGENT_EXECUTION_MODE"], "replay");
        assert!(env["AGENT_CLOCK_FILE"].ends_with("clock.json"));
    }

    #[test]
    fn stdout_divergence_is_reported() {
        let dir = TempDir::new().unwrap();
        let bundle = sample_bundle(&dir);
        let verifier = ReplayVerifier::new(Arc::new(CannedRunner::new(b"goodbye\n", b"", 0)));

        let report = verifier.verify(&bundle).unwrap();
        assert!(!report.success);
        let diff = report.first_diff.unwrap();
        assert_eq!(diff.kind, DiffKind::Stdout);
        assert_eq!(diff.line, 1);
    }

    #[test]
    fn nonzero_exit_fails_verification() {
        let dir = TempDir::new().unwrap();
        let bundle = sample_bundle(&dir);
        let verifier = ReplayVerifier::new(Arc::new(CannedRunner::new(b"hello\n", b"", 7)));

        let report = verifier.verify(&bundle).unwrap();
        assert!(!report.success);
        assert_eq!(report.exit_code, 7);
    }
}
