//! # tracegate-core
//!
//! Core library for tracegate - a deterministic-execution transaction gate.
//!
//! This crate provides the building blocks for recording an agent program's
//! side effects into a content-addressed trace bundle, replaying that bundle
//! to detect divergence, and gating promotion of its effects to the real
//! world through a durable intent journal with idempotent two-phase commit.
//!
//! ## Features
//!
//! - **Trace Bundles**: canonical container format with per-component SHA-256
//!   hashes and a stable whole-bundle digest
//! - **Intent Journal**: append-only JSONL log enforcing at-most-once commits
//!   per idempotency key
//! - **Transactional Drivers**: plan/validate/prepare/commit/rollback contract
//!   for file writes, HTTP calls, and LLM invocations
//! - **Reversible HTTP**: declarative rules deriving compensating requests
//! - **Policy Evaluation**: pure classification of intents and recorded
//!   network traffic into allow/deny and requires-approval decisions
//!
//! ## Example
//!
//! ```rust,no_run
//! use tracegate_core::bundle::Bundle;
//!
//! # fn example() -> Result<(), tracegate_core::bundle::BundleError> {
//! let bundle = Bundle::open("/path/to/extracted-bundle")?;
//! let digest = bundle.hash()?;
//! println!("bundle digest: {digest}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod canonical;
pub mod clock;
pub mod context;
pub mod driver;
pub mod fsdiff;
pub mod har;
pub mod intent;
pub mod journal;
pub mod policy;
pub mod prompts;
pub mod replay;
pub mod rollback;

pub use bundle::Bundle;
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::OpContext;
pub use driver::{Driver, DriverRegistry};
pub use intent::{IntentRecord, PlannedIntent};
pub use journal::Journal;
pub use policy::{Evaluation, PolicyConfig};
