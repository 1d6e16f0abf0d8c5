//! Gate orchestrator: the plan/approve/commit/revert state machine.
//!
//! A bundle's status is derived, never stored: `committed` if any receipts
//! exist, else `approved` if an approval exists, else `pending`.
//!
//! ```text
//! ingest -> pending -> (approve) -> approved -> (commit) -> committed
//!                                                              |
//!                                                           (revert)
//!                                                              v
//!                                                  committed (receipts kept)
//! ```
//!
//! Operations on distinct bundles may run in parallel; operations on the
//! same bundle serialize through a bundle-scoped lock. Within one commit,
//! intents execute strictly sequentially in bundle order so receipts
//! persist monotonically, and each intent's idempotency key is
//! `<bundleId>:<intentId>` so retries never double-apply.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;

use tracegate_core::bundle::{Bundle, BundleError, archive};
use tracegate_core::clock::Clock;
use tracegate_core::context::OpContext;
use tracegate_core::driver::{
    Driver, DriverError, DriverRegistry, FileWriteDriver, HttpPostDriver, LlmCallDriver,
    LlmMessage, LlmProvider, rollback_plan,
};
use tracegate_core::har::HarEntry;
use tracegate_core::intent::{IntentError, IntentKind, PlannedIntent, attach_ids};
use tracegate_core::journal::{Journal, JournalError, JournalIntent};
use tracegate_core::policy::{EvalContext, Evaluation, PolicyConfig, Stage, evaluate};
use tracegate_core::prompts::{PromptMode, PromptStore};
use tracegate_core::rollback::RollbackRuleRegistry;

use crate::store::{ApprovalRecord, BundleRow, GateStore, ReceiptRecord, StoreError};

/// Errors surfaced by gate operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
    /// No bundle with the given ID.
    #[error("bundle not found: {id}")]
    NotFound {
        /// The unknown ID.
        id: String,
    },

    /// The bundle computes two identical intent IDs; ingestion refuses it.
    #[error("duplicate intent id in bundle: {id}")]
    DuplicateIntentId {
        /// The colliding intent ID.
        id: String,
    },

    /// Policy evaluation blocked the operation.
    #[error("policy denied: {}", reasons.join("; "))]
    PolicyDenied {
        /// Sorted blocking reasons.
        reasons: Vec<String>,
    },

    /// The bundle requires an approval under the current policy version.
    #[error("approval required")]
    ApprovalRequired,

    /// Commit was requested for an already-committed bundle.
    #[error("bundle already committed: {id}")]
    AlreadyCommitted {
        /// The committed bundle.
        id: String,
    },

    /// Revert was requested but no receipts exist.
    #[error("no receipts recorded for bundle: {id}")]
    NoReceipts {
        /// The receipt-less bundle.
        id: String,
    },

    /// Commit aborted partway; earlier receipts are preserved.
    #[error("commit aborted at intent '{intent_id}': {reason}")]
    CommitAborted {
        /// The intent that failed.
        intent_id: String,
        /// Failure description.
        reason: String,
        /// Receipts persisted before the abort.
        receipts: Vec<CommitReceipt>,
    },

    /// Bundle validation or parsing failed.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Driver resolution failure outside a commit.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<IntentError> for GateError {
    fn from(err: IntentError) -> Self {
        match err {
            IntentError::DuplicateIntentId { id } => Self::DuplicateIntentId { id },
            other => Self::Bundle(BundleError::SchemaViolation {
                details: other.to_string(),
            }),
        }
    }
}

/// Derived bundle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    /// Ingested, not yet approved or committed.
    Pending,
    /// An approval exists.
    Approved,
    /// At least one receipt exists. Revert does not leave this state.
    Committed,
}

/// One committed intent's receipt, as returned by commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitReceipt {
    /// The intent's stable ID.
    #[serde(rename = "intentId")]
    pub intent_id: String,
    /// The driver receipt.
    pub receipt: Value,
}

/// Per-intent revert outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RevertStatus {
    /// The compensating action applied.
    Reverted,
    /// No compensation was derivable; flagged for manual review.
    NonReversible,
    /// The compensating action failed.
    Failed,
}

/// The result of reverting one receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevertOutcome {
    /// The intent the receipt belongs to.
    #[serde(rename = "intentId")]
    pub intent_id: String,
    /// What happened.
    pub status: RevertStatus,
    /// Failure description for non-success outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Plan-time view of one intent.
#[derive(Debug, Clone, Serialize)]
pub struct PlanIntent {
    /// Stable intent ID.
    pub id: String,
    /// Wire type.
    #[serde(rename = "type")]
    pub intent_type: String,
    /// Labels after defaults were applied.
    pub labels: Vec<String>,
    /// Reversibility summary for `http.post` intents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Value>,
}

/// Counts summarizing the planned bundle.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    /// Number of intents.
    pub intents: usize,
    /// Number of recorded network entries.
    #[serde(rename = "networkEntries")]
    pub network_entries: usize,
}

/// The full plan response.
#[derive(Debug, Clone, Serialize)]
pub struct PlanResponse {
    /// The planned bundle.
    #[serde(rename = "bundleId")]
    pub bundle_id: String,
    /// Derived status at plan time.
    pub status: BundleStatus,
    /// Bundle summary.
    pub summary: PlanSummary,
    /// Per-intent plan rows.
    pub intents: Vec<PlanIntent>,
    /// Policy evaluation at stage `plan`.
    pub policy: Evaluation,
}

/// Builds the per-bundle driver registry used by commit and revert.
///
/// The LLM driver is bound to the bundle's own prompt recordings, so the
/// registry is constructed fresh for each opened bundle. Tests substitute
/// their own factory to register mock drivers.
pub trait DriverFactory: Send + Sync {
    /// Builds the registry for one opened bundle.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] when a driver cannot be constructed.
    fn build(&self, bundle: &Bundle) -> Result<DriverRegistry, GateError>;
}

/// The standard driver set: `file.write`, `http.post`, and replay-mode
/// `llm.call`.
pub struct DefaultDriverFactory {
    rules: Arc<RollbackRuleRegistry>,
    clock: Arc<dyn Clock>,
}

impl DefaultDriverFactory {
    /// Creates the default factory.
    #[must_use]
    pub fn new(rules: Arc<RollbackRuleRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { rules, clock }
    }
}

/// Provider stub for replay-only gating: commit never records new calls.
struct ReplayOnlyProvider;

impl LlmProvider for ReplayOnlyProvider {
    fn complete(
        &self,
        _model: &str,
        _messages: &[LlmMessage],
        _params: Option<&Value>,
        _ctx: &OpContext,
    ) -> Result<String, DriverError> {
        Err(DriverError::CommitFailed {
            reason: "gate commits replay recorded completions; no provider is configured"
                .to_string(),
        })
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn build(&self, bundle: &Bundle) -> Result<DriverRegistry, GateError> {
        let prompts_dir = bundle
            .component_path("prompts")
            .expect("prompts is a known component");
        let store = PromptStore::open(prompts_dir, PromptMode::Replay)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let mut registry = DriverRegistry::new();
        registry.register("file.write", Arc::new(FileWriteDriver));
        registry.register(
            "http.post",
            Arc::new(HttpPostDriver::new(Arc::clone(&self.rules))),
        );
        registry.register(
            "llm.call",
            Arc::new(LlmCallDriver::new(
                Arc::new(ReplayOnlyProvider),
                Arc::new(store),
                Arc::clone(&self.clock),
            )),
        );
        Ok(registry)
    }
}

/// An extracted bundle working directory; removed on drop.
struct BundleWorkdir {
    bundle: Bundle,
    _tmp: TempDir,
}

/// The gate orchestrator over store, journal, drivers, and policy.
pub struct GateOrchestrator {
    store: Arc<GateStore>,
    journal: Journal,
    policy: PolicyConfig,
    rules: Arc<RollbackRuleRegistry>,
    factory: Arc<dyn DriverFactory>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for GateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateOrchestrator")
            .field("policy_version", &self.policy.version)
            .finish_non_exhaustive()
    }
}

impl GateOrchestrator {
    /// Opens the orchestrator over `data_dir` with the given policy and
    /// rollback rules.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] if the store or journal cannot be opened.
    pub fn new(
        data_dir: impl AsRef<Path>,
        policy: PolicyConfig,
        rules: Arc<RollbackRuleRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GateError> {
        let data_dir = data_dir.as_ref();
        let store = Arc::new(GateStore::open(data_dir)?);
        let journal = Journal::open(data_dir.join("journal.jsonl"), Arc::clone(&clock))?;
        let factory = Arc::new(DefaultDriverFactory::new(Arc::clone(&rules), Arc::clone(&clock)));
        Ok(Self {
            store,
            journal,
            policy,
            rules,
            factory,
            clock,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the driver factory (used by tests to register mocks).
    #[must_use]
    pub fn with_driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &GateStore {
        &self.store
    }

    /// Accepts bundle bytes, validates them, and persists under a new ID.
    ///
    /// # Errors
    ///
    /// Rejects archives that fail extraction, bundle validation, or intent
    /// ID attachment ([`GateError::DuplicateIntentId`]).
    pub fn ingest(&self, bytes: &[u8]) -> Result<String, GateError> {
        let tmp = TempDir::new()?;
        archive::unpack(bytes, tmp.path())?;
        let bundle = Bundle::open(tmp.path())?;
        let records = bundle.intents()?;
        attach_ids(records)?;

        let id = uuid::Uuid::new_v4().to_string();
        let metadata = bundle.manifest().metadata.clone();
        self.store.persist_bundle(
            &id,
            bytes,
            metadata.as_ref(),
            &self.clock.now().to_rfc3339(),
        )?;
        tracing::info!(bundle_id = %id, "bundle ingested");
        Ok(id)
    }

    /// Derived status for a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NotFound`] for unknown IDs.
    pub fn status(&self, id: &str) -> Result<BundleStatus, GateError> {
        self.require_bundle(id)?;
        self.derived_status(id)
    }

    /// Lists all bundles with their derived status and approval.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Store`] on query failure.
    pub fn list(
        &self,
    ) -> Result<Vec<(BundleRow, BundleStatus, Option<ApprovalRecord>)>, GateError> {
        let rows = self.store.list_bundles()?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status = self.derived_status(&row.id)?;
            let approval = self.store.get_approval(&row.id)?;
            out.push((row, status, approval));
        }
        Ok(out)
    }

    /// Evaluates policy at stage `plan` and summarizes the bundle.
    ///
    /// No state change: plan is a pure read over the stored bundle.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NotFound`] for unknown IDs and bundle errors
    /// for invalid archives.
    pub fn plan(&self, id: &str) -> Result<PlanResponse, GateError> {
        let row = self.require_bundle(id)?;
        let workdir = self.open_workdir(&row)?;
        let (intents, network) = self.load_planned(&workdir.bundle)?;

        let evaluation = evaluate(
            &self.policy,
            &EvalContext {
                stage: Stage::Plan,
                now: self.clock.now(),
            },
            &intents,
            &network,
        );

        let plan_intents = intents
            .iter()
            .map(|intent| PlanIntent {
                id: intent.id.clone(),
                intent_type: intent.record.intent_type.clone(),
                labels: intent.labels(),
                rollback: matches!(
                    IntentKind::from_type(&intent.record.intent_type),
                    IntentKind::HttpPost
                )
                .then(|| rollback_plan(&intent.record.payload, &self.rules)),
            })
            .collect();

        Ok(PlanResponse {
            bundle_id: id.to_string(),
            status: self.derived_status(id)?,
            summary: PlanSummary {
                intents: intents.len(),
                network_entries: network.len(),
            },
            intents: plan_intents,
            policy: evaluation,
        })
    }

    /// Records (or replaces) an approval under the current policy version.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NotFound`] for unknown IDs.
    pub fn approve(&self, id: &str, actor: &str) -> Result<ApprovalRecord, GateError> {
        self.require_bundle(id)?;
        let record = ApprovalRecord {
            bundle_id: id.to_string(),
            actor: actor.to_string(),
            policy_version: self.policy.version.clone(),
            approved_at: self.clock.now().to_rfc3339(),
        };
        self.store.record_approval(&record)?;
        tracing::info!(bundle_id = %id, actor = %actor, "bundle approved");
        Ok(record)
    }

    /// Commits every intent in bundle order through the journal.
    ///
    /// Aborts on the first failure; receipts persisted before the abort are
    /// preserved and reported inside [`GateError::CommitAborted`]. Revert is
    /// the explicit compensating path for them.
    ///
    /// # Errors
    ///
    /// [`GateError::PolicyDenied`], [`GateError::ApprovalRequired`],
    /// [`GateError::AlreadyCommitted`], or [`GateError::CommitAborted`].
    pub fn commit(&self, id: &str, ctx: &OpContext) -> Result<Vec<CommitReceipt>, GateError> {
        let lock = self.bundle_lock(id);
        let _guard = lock.lock().expect("bundle lock poisoned");

        let row = self.require_bundle(id)?;
        if self.derived_status(id)? == BundleStatus::Committed {
            return Err(GateError::AlreadyCommitted { id: id.to_string() });
        }

        let workdir = self.open_workdir(&row)?;
        let (intents, network) = self.load_planned(&workdir.bundle)?;

        let evaluation = evaluate(
            &self.policy,
            &EvalContext {
                stage: Stage::Commit,
                now: self.clock.now(),
            },
            &intents,
            &network,
        );
        if !evaluation.bundle.allowed {
            return Err(GateError::PolicyDenied {
                reasons: evaluation.bundle.reasons,
            });
        }
        if evaluation.bundle.requires_approval {
            let approval = self.store.get_approval(id)?;
            let valid = approval
                .as_ref()
                .is_some_and(|a| a.policy_version == self.policy.version);
            if !valid {
                return Err(GateError::ApprovalRequired);
            }
        }

        let drivers = self.factory.build(&workdir.bundle)?;
        let mut receipts = Vec::new();
        for intent in &intents {
            if let Err(err) = ctx.check() {
                return Err(GateError::CommitAborted {
                    intent_id: intent.id.clone(),
                    reason: err.to_string(),
                    receipts,
                });
            }
            let driver = match drivers.resolve(&intent.record.intent_type) {
                Ok(driver) => driver,
                Err(err) => {
                    return Err(GateError::CommitAborted {
                        intent_id: intent.id.clone(),
                        reason: err.to_string(),
                        receipts,
                    });
                },
            };
            match self.commit_intent(id, intent, driver.as_ref(), ctx) {
                Ok(receipt) => receipts.push(receipt),
                Err(err) => {
                    tracing::warn!(
                        bundle_id = %id,
                        intent_id = %intent.id,
                        error = %err,
                        "commit aborted; earlier receipts preserved"
                    );
                    return Err(GateError::CommitAborted {
                        intent_id: intent.id.clone(),
                        reason: err.to_string(),
                        receipts,
                    });
                },
            }
        }
        tracing::info!(bundle_id = %id, receipts = receipts.len(), "bundle committed");
        Ok(receipts)
    }

    /// Reverts saved receipts in ascending intent-ID order, best-effort.
    ///
    /// Individual failures are reported per intent and do not stop the
    /// pass. Receipts are never deleted - they are history - and the
    /// derived status stays `committed`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NoReceipts`] when nothing was committed.
    pub fn revert(&self, id: &str, ctx: &OpContext) -> Result<Vec<RevertOutcome>, GateError> {
        let lock = self.bundle_lock(id);
        let _guard = lock.lock().expect("bundle lock poisoned");

        let row = self.require_bundle(id)?;
        let receipts = self.store.list_receipts(id)?;
        if receipts.is_empty() {
            return Err(GateError::NoReceipts { id: id.to_string() });
        }

        let workdir = self.open_workdir(&row)?;
        let (intents, _) = self.load_planned(&workdir.bundle)?;
        let drivers = self.factory.build(&workdir.bundle)?;

        let mut outcomes = Vec::with_capacity(receipts.len());
        for receipt in &receipts {
            let outcome = self.revert_receipt(id, receipt, &intents, &drivers, ctx);
            if outcome.status != RevertStatus::Reverted {
                tracing::warn!(
                    bundle_id = %id,
                    intent_id = %receipt.intent_id,
                    status = ?outcome.status,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "revert outcome"
                );
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn revert_receipt(
        &self,
        bundle_id: &str,
        receipt: &ReceiptRecord,
        intents: &[PlannedIntent],
        drivers: &DriverRegistry,
        ctx: &OpContext,
    ) -> RevertOutcome {
        let Some(intent) = intents.iter().find(|i| i.id == receipt.intent_id) else {
            return RevertOutcome {
                intent_id: receipt.intent_id.clone(),
                status: RevertStatus::Failed,
                error: Some("no matching intent in bundle".to_string()),
            };
        };
        let driver = match drivers.resolve(&intent.record.intent_type) {
            Ok(driver) => driver,
            Err(err) => {
                return RevertOutcome {
                    intent_id: receipt.intent_id.clone(),
                    status: RevertStatus::Failed,
                    error: Some(err.to_string()),
                };
            },
        };
        let journal_intent = self.journal_intent(bundle_id, intent);
        match driver.revert(&journal_intent, &receipt.receipt, ctx) {
            Ok(()) => RevertOutcome {
                intent_id: receipt.intent_id.clone(),
                status: RevertStatus::Reverted,
                error: None,
            },
            Err(DriverError::NonReversible { intent_id }) => RevertOutcome {
                intent_id: receipt.intent_id.clone(),
                status: RevertStatus::NonReversible,
                error: Some(format!("intent '{intent_id}' is non-reversible")),
            },
            Err(err) => RevertOutcome {
                intent_id: receipt.intent_id.clone(),
                status: RevertStatus::Failed,
                error: Some(err.to_string()),
            },
        }
    }

    fn commit_intent(
        &self,
        bundle_id: &str,
        intent: &PlannedIntent,
        driver: &dyn Driver,
        ctx: &OpContext,
    ) -> Result<CommitReceipt, GateError> {
        let journal_intent = self.journal_intent(bundle_id, intent);
        let entry = self.journal.append(&journal_intent, driver, ctx)?;
        let receipt = entry.receipt.clone().unwrap_or(Value::Null);
        self.store.save_receipt(&ReceiptRecord {
            bundle_id: bundle_id.to_string(),
            intent_id: intent.id.clone(),
            intent_type: intent.record.intent_type.clone(),
            receipt: receipt.clone(),
            recorded_at: self.clock.now().to_rfc3339(),
        })?;
        Ok(CommitReceipt {
            intent_id: intent.id.clone(),
            receipt,
        })
    }

    /// The journal intent for one planned intent: idempotency key
    /// `<bundleId>:<intentId>`, metadata enriched with the stable ID.
    fn journal_intent(&self, bundle_id: &str, intent: &PlannedIntent) -> JournalIntent {
        let mut metadata = intent
            .record
            .metadata
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        if let Some(obj) = metadata.as_object_mut() {
            obj.entry("id".to_string())
                .or_insert_with(|| Value::String(intent.id.clone()));
        }
        JournalIntent {
            intent_type: intent.record.intent_type.clone(),
            idempotency_key: format!("{bundle_id}:{}", intent.id),
            payload: intent.record.payload.clone(),
            metadata: Some(metadata),
        }
    }

    fn require_bundle(&self, id: &str) -> Result<BundleRow, GateError> {
        self.store
            .get_bundle(id)?
            .ok_or_else(|| GateError::NotFound { id: id.to_string() })
    }

    fn derived_status(&self, id: &str) -> Result<BundleStatus, GateError> {
        if self.store.has_receipts(id)? {
            return Ok(BundleStatus::Committed);
        }
        if self.store.get_approval(id)?.is_some() {
            return Ok(BundleStatus::Approved);
        }
        Ok(BundleStatus::Pending)
    }

    fn open_workdir(&self, row: &BundleRow) -> Result<BundleWorkdir, GateError> {
        let bytes = self.store.read_bundle_bytes(row)?;
        let tmp = TempDir::new()?;
        archive::unpack(&bytes, tmp.path())?;
        let bundle = Bundle::open(tmp.path())?;
        Ok(BundleWorkdir { bundle, _tmp: tmp })
    }

    fn load_planned(
        &self,
        bundle: &Bundle,
    ) -> Result<(Vec<PlannedIntent>, Vec<HarEntry>), GateError> {
        let intents = attach_ids(bundle.intents()?)?;
        let network = bundle.har()?.entries().to_vec();
        Ok((intents, network))
    }

    fn bundle_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}
