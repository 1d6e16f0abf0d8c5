//! LLM-call driver: records completions once, replays them forever.
//!
//! In record mode the driver calls the injected [`LlmProvider`], synthesizes
//! per-character token events with monotonically non-decreasing timestamps
//! derived from the injected clock, and persists the recording through the
//! prompt store. In replay mode the provider is never contacted; the next
//! recording is consumed in ascending index order, one per LLM intent.
//!
//! `rollback` is a no-op: compensation is handled deterministically by never
//! reapplying the call.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Driver, DriverError, Prepared, Receipt};
use crate::clock::Clock;
use crate::context::OpContext;
use crate::journal::JournalIntent;
use crate::prompts::{PromptMode, PromptStore};

/// One chat message inside an LLM prompt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct LlmMessage {
    /// Message role (`system`, `user`, `assistant`).
    pub role: String,
    /// Message text.
    pub content: String,
}

/// A completion backend. The gate only ever calls this in record mode.
pub trait LlmProvider: Send + Sync {
    /// Produces a completion for the given prompt.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the provider call fails.
    fn complete(
        &self,
        model: &str,
        messages: &[LlmMessage],
        params: Option<&Value>,
        ctx: &OpContext,
    ) -> Result<String, DriverError>;
}

#[derive(Debug, Clone, Deserialize)]
struct LlmPayload {
    provider: String,
    model: String,
    prompt: LlmPrompt,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmPrompt {
    #[serde(default)]
    messages: Vec<LlmMessage>,
}

/// Records or replays `llm.call` intents through the prompt store.
pub struct LlmCallDriver {
    provider: Arc<dyn LlmProvider>,
    store: Arc<PromptStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LlmCallDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmCallDriver")
            .field("mode", &self.store.mode())
            .finish_non_exhaustive()
    }
}

impl LlmCallDriver {
    /// Creates a driver over a provider, a mode-bound store, and a clock.
    #[must_use]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<PromptStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
        }
    }

    fn parse(intent: &JournalIntent) -> Result<LlmPayload, DriverError> {
        serde_json::from_value(intent.payload.clone()).map_err(|e| DriverError::PrepareFailed {
            reason: format!("malformed llm.call payload: {e}"),
        })
    }

    /// Synthesizes one token event per character with non-decreasing
    /// millisecond offsets anchored at the clock's current instant.
    fn synthesize_tokens(&self, completion: &str) -> Vec<Value> {
        let base = self.clock.now().timestamp_millis();
        completion
            .chars()
            .enumerate()
            .map(|(i, c)| {
                json!({
                    "text": c.to_string(),
                    "at": base + i as i64,
                })
            })
            .collect()
    }
}

impl Driver for LlmCallDriver {
    fn name(&self) -> &str {
        "llm.call"
    }

    fn validate(&self, intent: &JournalIntent, _ctx: &OpContext) -> Result<(), DriverError> {
        Self::parse(intent).map(|_| ())
    }

    fn prepare(&self, intent: &JournalIntent, ctx: &OpContext) -> Result<Prepared, DriverError> {
        ctx.check()?;
        let payload = Self::parse(intent)?;
        Ok(json!({
            "provider": payload.provider,
            "model": payload.model,
        }))
    }

    fn commit(
        &self,
        intent: &JournalIntent,
        _prepared: &Prepared,
        ctx: &OpContext,
    ) -> Result<Receipt, DriverError> {
        ctx.check()?;
        let payload = Self::parse(intent)?;

        match self.store.mode() {
            PromptMode::Record => {
                let completion = self.provider.complete(
                    &payload.model,
                    &payload.prompt.messages,
                    payload.params.as_ref(),
                    ctx,
                )?;
                let tokens = self.synthesize_tokens(&completion);
                let recorded_at = self.clock.now().to_rfc3339();
                let recording = json!({
                    "provider": payload.provider,
                    "model": payload.model,
                    "prompt": intent.payload.get("prompt"),
                    "completion": completion,
                    "tokens": tokens,
                    "recordedAt": recorded_at,
                });
                let path = self.store.record(&recording).map_err(|e| {
                    DriverError::CommitFailed {
                        reason: format!("failed to persist recording: {e}"),
                    }
                })?;
                Ok(json!({
                    "provider": payload.provider,
                    "model": payload.model,
                    "completion": completion,
                    "tokens": tokens,
                    "recordedAt": recorded_at,
                    "source": "record",
                    "recordingPath": path.display().to_string(),
                }))
            },
            PromptMode::Replay => {
                let (index, recording) =
                    self.store.next_replay().map_err(|e| DriverError::CommitFailed {
                        reason: format!("replay failed: {e}"),
                    })?;
                let mut receipt = if recording.is_object() {
                    recording
                } else {
                    json!({ "recording": recording })
                };
                receipt["source"] = json!("replay");
                receipt["recordingIndex"] = json!(index);
                Ok(receipt)
            },
        }
    }

    fn rollback(
        &self,
        _intent: &JournalIntent,
        _prepared: &Prepared,
        _ctx: &OpContext,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    fn revert(
        &self,
        intent: &JournalIntent,
        _receipt: &Receipt,
        _ctx: &OpContext,
    ) -> Result<(), DriverError> {
        // A model call has no external state to unwind; the deterministic
        // guarantee is that replay never re-contacts the provider.
        tracing::debug!(
            idempotency_key = %intent.idempotency_key,
            "llm.call revert is a no-op"
        );
        Ok(())
    }
}
