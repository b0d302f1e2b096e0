//! Phase timing and memory measurement for metric runs.
//!
//! A [`PhaseTimer`] is started when a phase begins and finished when it ends;
//! finishing yields a [`PhaseMeasurement`] that the run aggregates into its
//! [`BenchmarkReport`]. Timers are independent values, so a timer started
//! inside another timer's span does not affect the outer measurement.

use std::{collections::BTreeMap, fmt, time::Duration, time::Instant};

use log::{debug, warn};
use serde_json::{json, Value};

use super::memory::process_rss_bytes;

/// Instrumented phases of a metric run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Snapshot store round trips
    Query,
    /// Raw rows to validated snapshots
    Conversion,
    /// Matrix construction and ranking
    ArrayBuild,
    /// Change computation
    Calculation,
    /// Registry write round trips
    Write,
    /// A whole run, wrapping all of the above
    Total,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Query => "query",
            Phase::Conversion => "conversion",
            Phase::ArrayBuild => "array_build",
            Phase::Calculation => "calculation",
            Phase::Write => "write",
            Phase::Total => "total",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one finished phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMeasurement {
    pub phase: Phase,
    pub duration: Duration,
    /// RSS change over the phase; None where RSS cannot be sampled
    pub memory_delta_bytes: Option<i64>,
}

/// Scoped timer for one phase.
#[must_use = "finish the timer to obtain its measurement"]
pub struct PhaseTimer {
    phase: Phase,
    started: Instant,
    rss_at_start: Option<u64>,
    finished: bool,
}

impl PhaseTimer {
    pub fn start(phase: Phase) -> Self {
        Self {
            phase,
            rss_at_start: process_rss_bytes(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Stop the timer and return what it measured.
    pub fn finish(mut self) -> PhaseMeasurement {
        let duration = self.started.elapsed();
        self.finished = true;

        let memory_delta_bytes = match (self.rss_at_start, process_rss_bytes()) {
            (Some(before), Some(after)) => Some(after as i64 - before as i64),
            _ => None,
        };

        if duration.as_micros() == 0 {
            warn!(
                "Phase '{}' measured zero duration, timer was likely finished before any work ran",
                self.phase
            );
        }

        debug!(
            "Phase '{}' took {:?} (memory delta: {})",
            self.phase,
            duration,
            format_bytes(memory_delta_bytes)
        );

        PhaseMeasurement {
            phase: self.phase,
            duration,
            memory_delta_bytes,
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "Phase '{}' abandoned after {:?}",
                self.phase,
                self.started.elapsed()
            );
        }
    }
}

/// Totals for one phase across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTotals {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
    pub max_memory_delta_bytes: Option<i64>,
}

/// Per-run aggregation of phase measurements.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkReport {
    phases: BTreeMap<Phase, PhaseTotals>,
}

impl BenchmarkReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, measurement: PhaseMeasurement) {
        let totals = self.phases.entry(measurement.phase).or_default();
        totals.count += 1;
        totals.total += measurement.duration;
        totals.max = totals.max.max(measurement.duration);
        if let Some(delta) = measurement.memory_delta_bytes {
            totals.max_memory_delta_bytes =
                Some(totals.max_memory_delta_bytes.map_or(delta, |m| m.max(delta)));
        }
    }

    /// Finish `timer` and record its measurement.
    pub fn finish(&mut self, timer: PhaseTimer) -> PhaseMeasurement {
        let measurement = timer.finish();
        self.record(measurement);
        measurement
    }

    pub fn totals(&self, phase: Phase) -> Option<&PhaseTotals> {
        self.phases.get(&phase)
    }

    /// JSON object keyed by phase name, stored in the run summary.
    pub fn to_json(&self) -> Value {
        let phases = self
            .phases
            .iter()
            .map(|(phase, t)| {
                (
                    phase.as_str().to_string(),
                    json!({
                        "count": t.count,
                        "total_ms": t.total.as_micros() as f64 / 1_000.0,
                        "max_ms": t.max.as_micros() as f64 / 1_000.0,
                        "max_memory_delta_bytes": t.max_memory_delta_bytes,
                    }),
                )
            })
            .collect();
        Value::Object(phases)
    }

    /// One-line summary for the end-of-run log.
    pub fn summary_line(&self) -> String {
        self.phases
            .iter()
            .map(|(phase, t)| format!("{}={:?}/{}", phase, t.total, t.count))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn format_bytes(bytes: Option<i64>) -> String {
    match bytes {
        Some(b) if b.abs() >= 1 << 20 => format!("{:+.1}MiB", b as f64 / (1u64 << 20) as f64),
        Some(b) => format!("{:+}B", b),
        None => "n/a".to_string(),
    }
}
