//! Injected clocks and the recorded clock-tick model.
//!
//! The core never reads the system clock directly: components that stamp
//! timestamps take a [`Clock`] at construction so tests can supply constant
//! or stepped clocks and replay stays deterministic.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A source of "now".
pub trait Clock: Send + Sync {
    /// Returns the current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a single instant. Useful in tests and policy evaluation.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(
    /// The instant every read returns.
    pub DateTime<Utc>,
);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A clock that advances by a fixed step on every read.
#[derive(Debug)]
pub struct SteppedClock {
    state: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl SteppedClock {
    /// Creates a stepped clock starting at `start`, advancing `step_ms`
    /// milliseconds per read.
    #[must_use]
    pub fn new(start: DateTime<Utc>, step_ms: i64) -> Self {
        Self {
            state: Mutex::new(start),
            step: Duration::milliseconds(step_ms),
        }
    }
}

impl Clock for SteppedClock {
    fn now(&self) -> DateTime<Utc> {
        let mut state = self.state.lock().expect("clock lock poisoned");
        let now = *state;
        *state += self.step;
        now
    }
}

/// One virtual-time advance recorded by the runtime shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockTick {
    /// Position in the emission order.
    pub sequence: u64,
    /// Operation that advanced time (currently always `"sleep"`).
    pub op: String,
    /// Requested sleep duration in seconds.
    pub seconds: f64,
    /// Virtual offset in milliseconds after the advance.
    pub at: f64,
}

/// Ticks recorded for one language runtime inside the traced program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockSource {
    /// Ordered tick stream.
    #[serde(default)]
    pub ticks: Vec<ClockTick>,
    /// When the source flushed its ticks.
    #[serde(rename = "recordedAt", skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
    /// `record` or `replay`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// The `clock.json` bundle component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockRecording {
    /// Format version, currently 1.
    #[serde(default)]
    pub version: u32,
    /// Virtual start time of the run, RFC3339.
    #[serde(rename = "initialTime", default)]
    pub initial_time: String,
    /// Per-runtime tick streams keyed by source name.
    #[serde(default)]
    pub sources: std::collections::BTreeMap<String, ClockSource>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn fixed_clock_is_constant() {
        let t = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let clock = FixedClock(t);
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn stepped_clock_is_monotonic() {
        let t = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let clock = SteppedClock::new(t, 10);
        let a = clock.now();
        let b = clock.now();
        assert_eq!(b - a, Duration::milliseconds(10));
    }

    #[test]
    fn clock_recording_round_trips() {
        let json = r#"{
            "version": 1,
            "initialTime": "2026-01-02T03:04:05Z",
            "sources": {
                "python": {
                    "ticks": [{"sequence": 0, "op": "sleep", "seconds": 0.5, "at": 500.0}],
                    "recordedAt": "2026-01-02T03:04:06Z",
                    "mode": "record"
                }
            }
        }"#;
        let rec: ClockRecording = serde_json::from_str(json).unwrap();
        assert_eq!(rec.version, 1);
        assert_eq!(rec.sources["python"].ticks.len(), 1);
    }
}
