use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use super::rules::{GroupKeyField, GroupingRule, RuleSet};
use crate::descriptor::DescriptorMap;
use crate::event::Value;
use crate::pairing::PairedSyscall;

/// Entry arguments copied into each `event_stream` record by default
pub const DEFAULT_KEY_PARAMS: &[&str] = &["fd", "count", "buf", "flags", "offset"];

/// Syscalls whose return value is the descriptor they create
const CREATES_DESCRIPTOR: &[&str] = &["open", "openat", "openat2", "creat", "socket", "accept", "accept4"];

/// Lightweight projection of one paired syscall inside a sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceEvent {
    pub timestamp: f64,
    pub syscall: String,
    /// Seconds
    pub duration: f64,
    pub return_value: Option<i64>,
    pub key_params: BTreeMap<String, Value>,
}

/// A batch of same-kind syscalls on the same key forming one logical operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSequence {
    pub sequence_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub duration_ms: f64,
    pub count: usize,
    pub event_stream: Vec<SequenceEvent>,
    pub entity_target: Option<String>,
    /// Return value of the last call in the batch
    pub return_value: Option<i64>,
    pub bytes_transferred: i64,
    pub thread_id: i32,
    pub process_id: i32,
    pub process_name: String,
    pub cpu_id: i32,
}

/// Groups paired syscalls into [`EventSequence`]s according to a [`RuleSet`]
#[derive(Debug, Clone)]
pub struct SequenceGrouper {
    key_params: Vec<String>,
}

impl Default for SequenceGrouper {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PARAMS.iter().map(|s| s.to_string()).collect())
    }
}

impl SequenceGrouper {
    pub fn new(key_params: Vec<String>) -> Self {
        Self { key_params }
    }

    /// Build all sequences, sorted by `(start_time, operation, thread_id)`
    ///
    /// `map` must already hold every descriptor interval of the trace, since
    /// each call's descriptor is resolved at that call's own start time.
    /// Lookups here are not counted in the map's resolution stats.
    pub fn build(
        &self,
        pairs: &[PairedSyscall],
        map: &DescriptorMap,
        rules: &RuleSet,
    ) -> Vec<EventSequence> {
        let mut sequences = Vec::new();
        for rule in rules.rules() {
            let before = sequences.len();
            self.group_rule(pairs, map, rule, &mut sequences);
            debug!(
                operation = %rule.operation,
                sequences = sequences.len() - before,
                "Grouped operation"
            );
        }

        sequences.sort_by(output_order);
        for (n, sequence) in sequences.iter_mut().enumerate() {
            sequence.sequence_id = format!("seq_{}_{}", sequence.operation, n + 1);
        }
        sequences
    }

    fn group_rule<'a>(
        &self,
        pairs: &'a [PairedSyscall],
        map: &DescriptorMap,
        rule: &GroupingRule,
        out: &mut Vec<EventSequence>,
    ) {
        let mut partitions: BTreeMap<Vec<String>, Vec<&'a PairedSyscall>> = BTreeMap::new();

        for pair in pairs.iter().filter(|p| rule.matches_syscall(&p.name)) {
            let kind = pair
                .entry_int("fd")
                .and_then(|fd| map.lookup(pair.pid, fd, pair.start_time))
                .map(|iv| iv.kind);
            if !rule.target.accepts(kind) {
                continue;
            }
            let key = rule
                .group_by
                .iter()
                .map(|field| key_part(field, pair, map))
                .collect();
            partitions.entry(key).or_default().push(pair);
        }

        let threshold_ns = (rule.time_gap_ms * 1e6).round() as i64;

        for (_, mut calls) in partitions {
            calls.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

            if rule.immediate {
                for pair in calls {
                    out.push(self.make_sequence(&[pair], rule, map));
                }
                continue;
            }

            let mut batch: Vec<&PairedSyscall> = Vec::new();
            for pair in calls {
                if let Some(last) = batch.last() {
                    let gap_ns = to_ns(pair.start_time) - to_ns(last.end_time);
                    if gap_ns > threshold_ns {
                        out.push(self.make_sequence(&batch, rule, map));
                        batch.clear();
                    }
                }
                batch.push(pair);
            }
            if !batch.is_empty() {
                out.push(self.make_sequence(&batch, rule, map));
            }
        }
    }

    fn make_sequence(
        &self,
        batch: &[&PairedSyscall],
        rule: &GroupingRule,
        map: &DescriptorMap,
    ) -> EventSequence {
        let first = batch[0];
        let last = batch[batch.len() - 1];
        let start_time = first.start_time;
        let end_time = batch
            .iter()
            .map(|p| p.end_time)
            .max_by(f64::total_cmp)
            .unwrap_or(start_time);

        let bytes_transferred = if rule.transfers_bytes {
            batch
                .iter()
                .filter_map(|p| p.return_value)
                .filter(|ret| *ret > 0)
                .sum()
        } else {
            0
        };

        EventSequence {
            sequence_id: String::new(),
            operation: rule.operation.clone(),
            relationship: rule.relationship.clone(),
            start_time,
            end_time,
            duration_ms: (end_time - start_time) * 1000.0,
            count: batch.len(),
            event_stream: batch.iter().map(|p| self.project(p)).collect(),
            entity_target: entity_target(first, map),
            return_value: last.return_value,
            bytes_transferred,
            thread_id: first.tid,
            process_id: first.pid,
            process_name: first.process_name.clone(),
            cpu_id: first.cpu_id,
        }
    }

    fn project(&self, pair: &PairedSyscall) -> SequenceEvent {
        SequenceEvent {
            timestamp: pair.start_time,
            syscall: pair.name.clone(),
            duration: pair.duration(),
            return_value: pair.return_value,
            key_params: pair
                .entry_fields
                .iter()
                .filter(|(k, _)| self.key_params.iter().any(|p| p == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn to_ns(seconds: f64) -> i64 {
    (seconds * 1e9).round() as i64
}

fn key_part(field: &GroupKeyField, pair: &PairedSyscall, map: &DescriptorMap) -> String {
    match field {
        GroupKeyField::Tid => pair.tid.to_string(),
        GroupKeyField::Pid => pair.pid.to_string(),
        GroupKeyField::Cpu => pair.cpu_id.to_string(),
        GroupKeyField::ProcessName => pair.process_name.clone(),
        GroupKeyField::Fd | GroupKeyField::SocketFd => match pair.entry_int("fd") {
            Some(fd) => map.name_at(pair.pid, fd, pair.start_time),
            None => "no_fd".to_string(),
        },
        GroupKeyField::Argument(name) => pair
            .entry_fields
            .get(name)
            .map_or_else(|| "unknown".to_string(), Value::to_string),
    }
}

/// Target of a batch, taken from its first call
///
/// Filename argument first, then the descriptor the call created, then the
/// descriptor argument resolved at call time (or its placeholder).
fn entity_target(pair: &PairedSyscall, map: &DescriptorMap) -> Option<String> {
    if let Some(path) = pair
        .entry_text("filename")
        .or_else(|| pair.entry_text("pathname"))
        .filter(|p| !p.is_empty())
    {
        return Some(path.to_string());
    }

    if CREATES_DESCRIPTOR.contains(&pair.name.as_str()) {
        if let Some(fd) = pair.return_value.filter(|ret| *ret >= 0) {
            if let Some(interval) = map.lookup(pair.pid, fd, pair.start_time) {
                return Some(interval.resolved_name.clone());
            }
        }
    }

    pair.entry_int("fd")
        .map(|fd| map.name_at(pair.pid, fd, pair.start_time))
}

/// Output order of sequences: start time, then operation, then thread
pub fn output_order(a: &EventSequence, b: &EventSequence) -> Ordering {
    a.start_time
        .total_cmp(&b.start_time)
        .then_with(|| a.operation.cmp(&b.operation))
        .then_with(|| a.thread_id.cmp(&b.thread_id))
}
