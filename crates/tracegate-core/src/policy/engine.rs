//! Pure policy evaluation over intents and recorded network traffic.

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{AllowRule, PolicyConfig};
use crate::har::HarEntry;
use crate::intent::PlannedIntent;
use crate::rollback::wildcard_match;

/// Which gate operation is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Advisory evaluation; no state changes.
    Plan,
    /// Enforcement evaluation immediately before committing.
    Commit,
}

/// Evaluation input: the asking stage and the evaluation instant.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    /// The gate operation being decided.
    pub stage: Stage,
    /// "Now" for time-window checks; injected so evaluation stays pure.
    pub now: DateTime<Utc>,
}

/// Per-intent decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentDecision {
    /// Position in the bundle's intent order.
    pub index: usize,
    /// The intent's wire type.
    #[serde(rename = "type")]
    pub intent_type: String,
    /// False when a blocking rule fired.
    pub allowed: bool,
    /// True when an approval must exist before commit.
    #[serde(rename = "requiresApproval")]
    pub requires_approval: bool,
    /// Blocking reasons.
    pub reasons: Vec<String>,
    /// Approval-demanding reasons.
    #[serde(rename = "approvalReasons")]
    pub approval_reasons: Vec<String>,
}

/// Per-network-entry decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkDecision {
    /// The recorded request URL.
    pub url: String,
    /// The recorded request method.
    pub method: String,
    /// False when no allow rule matched a non-empty allowlist.
    pub allowed: bool,
    /// Blocking reasons.
    pub reasons: Vec<String>,
}

/// Bundle-level rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleDecision {
    /// True when no intent or network entry is blocked.
    pub allowed: bool,
    /// True when any intent requires approval.
    #[serde(rename = "requiresApproval")]
    pub requires_approval: bool,
    /// Sorted, deduplicated union of all blocking reasons.
    pub reasons: Vec<String>,
}

/// The complete evaluation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    /// Bundle-level rollup.
    pub bundle: BundleDecision,
    /// Per-intent decisions in bundle order.
    pub intents: Vec<IntentDecision>,
    /// Per-network-entry decisions in capture order.
    pub network: Vec<NetworkDecision>,
}

/// Evaluates a policy over intents and network entries.
///
/// This is a function in the mathematical sense: no I/O, no clock reads, no
/// interior mutation - identical inputs produce identical outputs.
#[must_use]
pub fn evaluate(
    policy: &PolicyConfig,
    ctx: &EvalContext,
    intents: &[PlannedIntent],
    network: &[HarEntry],
) -> Evaluation {
    let outside_window = policy
        .time_window
        .as_ref()
        .map(|window| outside_time_window(window, ctx.now))
        .unwrap_or(Ok(false));

    let intent_decisions: Vec<IntentDecision> = intents
        .iter()
        .map(|intent| evaluate_intent(policy, intent, &outside_window))
        .collect();

    let network_decisions: Vec<NetworkDecision> = network
        .iter()
        .map(|entry| evaluate_network_entry(policy, entry))
        .collect();

    let allowed = intent_decisions.iter().all(|d| d.allowed)
        && network_decisions.iter().all(|d| d.allowed);
    let requires_approval = intent_decisions.iter().any(|d| d.requires_approval);

    let mut reasons: Vec<String> = intent_decisions
        .iter()
        .flat_map(|d| d.reasons.iter().cloned())
        .chain(
            network_decisions
                .iter()
                .flat_map(|d| d.reasons.iter().cloned()),
        )
        .collect();
    reasons.sort();
    reasons.dedup();

    Evaluation {
        bundle: BundleDecision {
            allowed,
            requires_approval,
            reasons,
        },
        intents: intent_decisions,
        network: network_decisions,
    }
}

fn evaluate_intent(
    policy: &PolicyConfig,
    intent: &PlannedIntent,
    outside_window: &Result<bool, String>,
) -> IntentDecision {
    let mut reasons = Vec::new();
    let mut approval_reasons = Vec::new();

    if let Some(cap) = policy.caps.max_amount {
        if let Some(amount) = intent.record.payload.get("amount").and_then(Value::as_f64) {
            if amount > cap {
                reasons.push(format!("amount {amount} exceeds cap {cap}"));
            }
        }
    }

    for label in intent.labels() {
        if policy.require_approval_labels.iter().any(|l| l == &label) {
            approval_reasons.push(format!("label '{label}' requires approval"));
        }
    }

    match outside_window {
        Ok(true) => {
            let window = policy.time_window.as_ref().expect("window checked above");
            approval_reasons.push(format!(
                "outside commit window {}-{} {}",
                window.start, window.end, window.timezone
            ));
        },
        Ok(false) => {},
        Err(reason) => {
            // An unevaluable window fails toward approval, never toward
            // silent allow.
            approval_reasons.push(reason.clone());
        },
    }

    IntentDecision {
        index: intent.record.index,
        intent_type: intent.record.intent_type.clone(),
        allowed: reasons.is_empty(),
        requires_approval: !approval_reasons.is_empty(),
        reasons,
        approval_reasons,
    }
}

fn evaluate_network_entry(policy: &PolicyConfig, entry: &HarEntry) -> NetworkDecision {
    let url = entry.request.url.clone();
    let method = entry.request.method.clone();

    let allowed = policy.allow.is_empty()
        || policy
            .allow
            .iter()
            .any(|rule| allow_rule_matches(rule, &url, &method));

    let reasons = if allowed {
        Vec::new()
    } else {
        vec![format!("{method} {url} not allowed by policy")]
    };

    NetworkDecision {
        url,
        method,
        allowed,
        reasons,
    }
}

fn allow_rule_matches(rule: &AllowRule, url: &str, method: &str) -> bool {
    let (host, path) = split_url(url);

    let host_ok = rule
        .domains
        .iter()
        .any(|domain| domain.eq_ignore_ascii_case(&host));
    if !host_ok {
        return false;
    }

    if !rule.methods.is_empty()
        && !rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    {
        return false;
    }

    if !rule.paths.is_empty()
        && !rule.paths.iter().any(|pattern| wildcard_match(pattern, &path))
    {
        return false;
    }

    true
}

/// Extracts `(host, path)` from a URL without a full parser dependency in
/// the hot evaluation path. Port and userinfo are stripped from the host.
fn split_url(url: &str) -> (String, String) {
    let rest = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest);
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };
    let host = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);
    let host = host.split_once(':').map_or(host, |(host, _)| host);
    let path = path.split(['?', '#']).next().unwrap_or(path);
    (host.to_ascii_lowercase(), path.to_string())
}

/// Parses `HH:MM` into minutes of day.
#[must_use]
pub(super) fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Reports whether `now` falls outside the inclusive window.
///
/// `start > end` describes an overnight window that wraps midnight.
fn outside_time_window(
    window: &super::TimeWindow,
    now: DateTime<Utc>,
) -> Result<bool, String> {
    let start = parse_hhmm(&window.start)
        .ok_or_else(|| format!("time window start '{}' is not HH:MM", window.start))?;
    let end = parse_hhmm(&window.end)
        .ok_or_else(|| format!("time window end '{}' is not HH:MM", window.end))?;
    let tz: chrono_tz::Tz = window
        .timezone
        .parse()
        .map_err(|_| format!("unknown timezone '{}'", window.timezone))?;

    let local = now.with_timezone(&tz);
    let minutes = local.hour() * 60 + local.minute();

    let inside = if start <= end {
        (start..=end).contains(&minutes)
    } else {
        minutes >= start || minutes <= end
    };
    Ok(!inside)
}
