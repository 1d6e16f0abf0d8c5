//! Transactional driver framework.
//!
//! A driver turns one intent into one external side effect through a
//! two-phase contract consumed by the journal:
//!
//! ```text
//! plan -> validate -> prepare -> commit
//!                        |          |
//!                        v          v (failure)
//!                    Prepared    rollback(prepared)
//! ```
//!
//! `prepare` is the only phase allowed to capture compensating state; a
//! driver must not mutate external state during `prepare` unless the
//! mutation is itself recorded in the returned `Prepared` value. `commit`
//! returns an opaque receipt - evidence sufficient to drive the intent's
//! later reversal via [`Driver::revert`].

mod file_write;
mod http_post;
mod llm_call;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use file_write::FileWriteDriver;
pub use http_post::{HttpPostDriver, rollback_plan};
pub use llm_call::{LlmCallDriver, LlmMessage, LlmProvider};

use crate::context::{ContextError, OpContext};
use crate::journal::JournalIntent;

/// Driver-specific state captured by `prepare`, passed to `commit` and
/// `rollback` opaquely.
pub type Prepared = Value;

/// Opaque evidence of a committed intent, persisted alongside the journal
/// entry and the gate's receipt store.
pub type Receipt = Value;

/// Errors produced by drivers and driver resolution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// No driver is registered for the intent type.
    #[error("no driver registered for intent type '{intent_type}'")]
    Unregistered {
        /// The unmapped intent type.
        intent_type: String,
    },

    /// The payload does not describe a usable filesystem path.
    #[error("invalid path: {path}")]
    PathInvalid {
        /// The rejected path.
        path: String,
    },

    /// The target path exists but is not a regular file.
    #[error("not a file: {path}")]
    NotAFile {
        /// The offending path.
        path: String,
    },

    /// The prepare phase failed; nothing was persisted.
    #[error("prepare failed: {reason}")]
    PrepareFailed {
        /// Failure description.
        reason: String,
    },

    /// The commit phase failed after prepare.
    #[error("commit failed: {reason}")]
    CommitFailed {
        /// Failure description.
        reason: String,
    },

    /// A compensating action could not be applied.
    #[error("rollback failed: {reason}")]
    RollbackFailed {
        /// Failure description.
        reason: String,
    },

    /// The intent carries no derivable compensation; manual review required.
    #[error("intent '{intent_id}' is non-reversible")]
    NonReversible {
        /// The stable intent ID.
        intent_id: String,
    },

    /// An HTTP exchange completed with a non-success status.
    #[error("http error: status {status}")]
    Http {
        /// The response status code.
        status: u16,
    },

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation's context expired or was cancelled.
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// The two-phase effect contract.
pub trait Driver: Send + Sync {
    /// Human-readable driver name for logs.
    fn name(&self) -> &str;

    /// Cheap feasibility check; failures are not persisted.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the intent cannot be attempted.
    fn plan(&self, intent: &JournalIntent, ctx: &OpContext) -> Result<(), DriverError> {
        let _ = (intent, ctx);
        Ok(())
    }

    /// Payload validation; failures are not persisted.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the payload is malformed.
    fn validate(&self, intent: &JournalIntent, ctx: &OpContext) -> Result<(), DriverError> {
        let _ = (intent, ctx);
        Ok(())
    }

    /// Captures compensating state for the effect.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::PrepareFailed`] (or a more specific kind) when
    /// the state cannot be captured; the journal records a `rolledback`
    /// entry.
    fn prepare(&self, intent: &JournalIntent, ctx: &OpContext) -> Result<Prepared, DriverError>;

    /// Applies the effect, returning the receipt.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] on failure; the journal then invokes
    /// [`Driver::rollback`] best-effort and persists a `rolledback` entry.
    fn commit(
        &self,
        intent: &JournalIntent,
        prepared: &Prepared,
        ctx: &OpContext,
    ) -> Result<Receipt, DriverError>;

    /// Undoes a failed or unwanted commit using the prepared state.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::RollbackFailed`] when compensation could not
    /// be applied.
    fn rollback(
        &self,
        intent: &JournalIntent,
        prepared: &Prepared,
        ctx: &OpContext,
    ) -> Result<(), DriverError>;

    /// Compensates a previously committed intent from its stored receipt.
    ///
    /// This is the revert path: the original `Prepared` state is gone, so
    /// the receipt must carry everything the reversal needs.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NonReversible`] when the receipt carries no
    /// derivable compensation, or another kind when applying it fails.
    fn revert(
        &self,
        intent: &JournalIntent,
        receipt: &Receipt,
        ctx: &OpContext,
    ) -> Result<(), DriverError>;
}

/// Maps intent type names to driver instances.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("DriverRegistry")
            .field("types", &names)
            .finish()
    }
}

impl DriverRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` for `intent_type`, replacing any prior binding.
    pub fn register(&mut self, intent_type: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(intent_type.into(), driver);
    }

    /// Resolves the driver for an intent type.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unregistered`] for unmapped types.
    pub fn resolve(&self, intent_type: &str) -> Result<Arc<dyn Driver>, DriverError> {
        self.drivers
            .get(intent_type)
            .cloned()
            .ok_or_else(|| DriverError::Unregistered {
                intent_type: intent_type.to_string(),
            })
    }

    /// Registered intent types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.drivers.keys().cloned().collect();
        types.sort_unstable();
        types
    }
}
