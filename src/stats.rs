//! Trace quality counters, per-syscall latency statistics and the run summary
//!
//! Nothing here makes a pass/fail judgment about a trace; the counters are
//! surfaced so callers can decide whether the result is usable.

use fnv::FnvHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::context::ContextStats;
use crate::descriptor::ResolutionStats;
use crate::entities::Entities;
use crate::pairing::{PairedSyscall, PairingStats};
use crate::sequence::EventSequence;

/// Line-level ingestion counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Every line read, including blank lines and comments
    pub total_lines: u64,
    pub parsed_events: u64,
    /// Blank lines and `#` comments
    pub ignored_lines: u64,
    /// Lines that did not match the trace grammar
    pub parse_errors: u64,
    /// Timestamp regressions within one CPU's events (midnight wraparound)
    pub monotonic_violations: u64,
}

impl IngestStats {
    /// Fraction of non-ignorable lines that parsed, 1.0 for an empty trace
    pub fn success_rate(&self) -> f64 {
        let candidates = self.total_lines - self.ignored_lines;
        if candidates == 0 {
            1.0
        } else {
            self.parsed_events as f64 / candidates as f64
        }
    }
}

/// Detects per-CPU timestamp regressions
#[derive(Debug, Default)]
pub struct MonotonicCheck {
    last: FnvHashMap<i32, f64>,
}

impl MonotonicCheck {
    /// Record a timestamp; returns true when it is earlier than the previous
    /// one seen on the same CPU
    pub fn observe(&mut self, cpu_id: i32, timestamp: f64) -> bool {
        match self.last.insert(cpu_id, timestamp) {
            Some(prev) => timestamp < prev,
            None => false,
        }
    }
}

/// Latency statistics for one syscall name
#[derive(Debug, Clone, Default)]
pub struct SyscallStats {
    pub count: u64,
    /// Negative return values
    pub errors: u64,
    pub total_time_us: f64,
    /// Individual durations (microseconds) for percentile calculations
    pub durations: Vec<f64>,
}

/// Serializable digest of [`SyscallStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyscallLatency {
    pub count: u64,
    pub errors: u64,
    pub total_time_us: f64,
    pub avg_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

/// Tracks latency of every paired syscall
#[derive(Debug, Default)]
pub struct StatsTracker {
    stats: FnvHashMap<String, SyscallStats>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, syscall_name: &str, result: Option<i64>, duration_us: f64) {
        let entry = self.stats.entry(syscall_name.to_string()).or_default();
        entry.count += 1;
        entry.total_time_us += duration_us;
        entry.durations.push(duration_us);
        if result.is_some_and(|ret| ret < 0) {
            entry.errors += 1;
        }
    }

    pub fn record_pair(&mut self, pair: &PairedSyscall) {
        self.record(&pair.name, pair.return_value, pair.duration() * 1e6);
    }

    pub fn get(&self, syscall_name: &str) -> Option<&SyscallStats> {
        self.stats.get(syscall_name)
    }

    /// Linear interpolation between closest ranks
    fn calculate_percentile(sorted_data: &[f64], percentile: f64) -> f64 {
        if sorted_data.is_empty() {
            return 0.0;
        }
        if sorted_data.len() == 1 {
            return sorted_data[0];
        }

        let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
        let lower = index.floor() as usize;
        let upper = index.ceil() as usize;

        if lower == upper {
            sorted_data[lower]
        } else {
            let weight = index - lower as f64;
            sorted_data[lower] * (1.0 - weight) + sorted_data[upper] * weight
        }
    }

    /// Per-syscall digests keyed by name
    pub fn latencies(&self) -> BTreeMap<String, SyscallLatency> {
        self.stats
            .iter()
            .map(|(name, stats)| {
                let mut sorted = stats.durations.clone();
                sorted.sort_by(f64::total_cmp);
                let avg_us = if stats.count > 0 {
                    stats.total_time_us / stats.count as f64
                } else {
                    0.0
                };
                let latency = SyscallLatency {
                    count: stats.count,
                    errors: stats.errors,
                    total_time_us: stats.total_time_us,
                    avg_us,
                    p50_us: Self::calculate_percentile(&sorted, 50.0),
                    p95_us: Self::calculate_percentile(&sorted, 95.0),
                    p99_us: Self::calculate_percentile(&sorted, 99.0),
                };
                (name.clone(), latency)
            })
            .collect()
    }
}

/// First and last event timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

impl TimeRange {
    pub fn from_bounds(bounds: Option<(f64, f64)>) -> Self {
        match bounds {
            Some((start, end)) => Self {
                start,
                end,
                duration: end - start,
            },
            None => Self::default(),
        }
    }
}

/// Whole-run summary written to `summary.json`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSummary {
    pub total_lines: u64,
    pub total_events: u64,
    pub parse_errors: u64,
    pub ignored_lines: u64,
    pub parse_success_rate: f64,
    pub monotonic_violations: u64,
    pub time_range: TimeRange,
    pub event_types: BTreeMap<String, u64>,
    pub context: ContextStats,
    pub pairing: PairingStats,
    /// Entries still waiting for an exit when the trace ended
    pub pending_at_end: usize,
    pub descriptors: ResolutionStats,
    pub total_sequences: usize,
    pub operations: BTreeMap<String, u64>,
    pub average_durations_ms: BTreeMap<String, f64>,
    pub total_bytes_transferred: i64,
    pub syscalls: BTreeMap<String, SyscallLatency>,
    pub entity_counts: BTreeMap<String, usize>,
}

/// Inputs gathered by the pipeline for [`TraceSummary::build`]
#[derive(Debug)]
pub struct SummaryInputs<'a> {
    pub ingest: &'a IngestStats,
    pub time_bounds: Option<(f64, f64)>,
    pub event_types: &'a BTreeMap<String, u64>,
    pub context: &'a ContextStats,
    pub pairing: &'a PairingStats,
    pub pending_at_end: usize,
    pub descriptors: &'a ResolutionStats,
    pub latency: &'a StatsTracker,
    pub sequences: &'a [EventSequence],
    pub entities: &'a Entities,
}

impl TraceSummary {
    pub fn build(inputs: SummaryInputs<'_>) -> Self {
        let mut operations: BTreeMap<String, u64> = BTreeMap::new();
        let mut durations: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_bytes_transferred = 0;
        for seq in inputs.sequences {
            *operations.entry(seq.operation.clone()).or_default() += 1;
            *durations.entry(seq.operation.clone()).or_default() += seq.duration_ms;
            total_bytes_transferred += seq.bytes_transferred;
        }
        let average_durations_ms = durations
            .into_iter()
            .map(|(op, total)| {
                let count = operations.get(&op).copied().unwrap_or(1).max(1);
                (op, total / count as f64)
            })
            .collect();

        let entities = inputs.entities;
        let entity_counts = BTreeMap::from([
            ("processes".to_string(), entities.processes.len()),
            ("threads".to_string(), entities.threads.len()),
            ("files".to_string(), entities.files.len()),
            ("sockets".to_string(), entities.sockets.len()),
            ("cpus".to_string(), entities.cpus.len()),
        ]);

        let ingest = inputs.ingest;
        Self {
            total_lines: ingest.total_lines,
            total_events: ingest.parsed_events,
            parse_errors: ingest.parse_errors,
            ignored_lines: ingest.ignored_lines,
            parse_success_rate: ingest.success_rate(),
            monotonic_violations: ingest.monotonic_violations,
            time_range: TimeRange::from_bounds(inputs.time_bounds),
            event_types: inputs.event_types.clone(),
            context: inputs.context.clone(),
            pairing: inputs.pairing.clone(),
            pending_at_end: inputs.pending_at_end,
            descriptors: inputs.descriptors.clone(),
            total_sequences: inputs.sequences.len(),
            operations,
            average_durations_ms,
            total_bytes_transferred,
            syscalls: inputs.latency.latencies(),
            entity_counts,
        }
    }

    /// Human-readable report in the style of `strace -c`
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "lines: {}  events: {}  parse errors: {}  success: {:.1}%",
            self.total_lines,
            self.total_events,
            self.parse_errors,
            self.parse_success_rate * 100.0
        );
        let _ = writeln!(
            out,
            "time range: {:.6} - {:.6} ({:.6}s)  monotonic violations: {}",
            self.time_range.start,
            self.time_range.end,
            self.time_range.duration,
            self.monotonic_violations
        );
        let _ = writeln!(
            out,
            "paired: {}  stale entries: {}  unmatched exits: {}  pending at end: {}",
            self.pairing.paired,
            self.pairing.stale_entries,
            self.pairing.unmatched_exits,
            self.pending_at_end
        );
        let _ = writeln!(
            out,
            "descriptors: {} resolved, {} unresolved, {} from snapshot",
            self.descriptors.resolved, self.descriptors.unresolved, self.descriptors.from_snapshot
        );
        let _ = writeln!(out);

        let _ = writeln!(out, "operation          sequences   avg ms");
        let _ = writeln!(out, "---------------- ----------- --------");
        for (op, count) in &self.operations {
            let avg = self.average_durations_ms.get(op).copied().unwrap_or(0.0);
            let _ = writeln!(out, "{:<16} {:>11} {:>8.3}", op, count, avg);
        }
        let _ = writeln!(out);

        // Sort by call count (descending), then name
        let mut sorted: Vec<_> = self.syscalls.iter().collect();
        sorted.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

        let _ = writeln!(out, "     calls    errors    avg us    p95 us syscall");
        let _ = writeln!(out, "--------- --------- --------- --------- ----------------");
        for (name, stats) in sorted {
            let _ = writeln!(
                out,
                "{:>9} {:>9} {:>9.1} {:>9.1} {}",
                stats.count,
                if stats.errors > 0 {
                    stats.errors.to_string()
                } else {
                    String::new()
                },
                stats.avg_us,
                stats.p95_us,
                name
            );
        }
        out
    }
}
