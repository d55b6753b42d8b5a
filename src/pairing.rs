//! Syscall entry/exit pairing
//!
//! An entry is held per `(tid, syscall)` until the matching exit arrives on
//! the same thread. Events whose thread is unknown are held per CPU instead,
//! so two unidentified threads never share a slot. Lossy cases (a second entry before the exit, an exit with
//! no entry) are counted, never invented around.

use fnv::FnvHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

use crate::event::{KernelEvent, SyscallPhase, Value, UNKNOWN_ID};

/// One syscall invocation with known duration and result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairedSyscall {
    pub name: String,
    pub tid: i32,
    pub pid: i32,
    pub process_name: String,
    pub cpu_id: i32,
    pub start_time: f64,
    pub end_time: f64,
    pub entry_fields: BTreeMap<String, Value>,
    pub exit_fields: BTreeMap<String, Value>,
    pub return_value: Option<i64>,
}

impl PairedSyscall {
    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn entry_int(&self, key: &str) -> Option<i64> {
        self.entry_fields.get(key).and_then(Value::as_i64)
    }

    pub fn entry_text(&self, key: &str) -> Option<&str> {
        self.entry_fields.get(key).and_then(Value::as_str)
    }

    /// Whether the kernel reported failure (negative errno)
    pub fn is_error(&self) -> bool {
        self.return_value.is_some_and(|ret| ret < 0)
    }
}

/// Pairing quality counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PairingStats {
    pub paired: u64,
    /// Entries overwritten by a later entry before their exit arrived
    pub stale_entries: u64,
    /// Exits that arrived with no pending entry
    pub unmatched_exits: u64,
    /// Pairs whose exit timestamp preceded the entry; end clamped to start
    pub clamped: u64,
}

/// Pending slot: thread, CPU (only when the thread is unknown), syscall
type PendingKey = (i32, i32, String);

/// Matches `*syscall_entry_<name>` to the next `*syscall_exit_<name>` per thread
#[derive(Debug, Default)]
pub struct SyscallPairer {
    pending: FnvHashMap<PendingKey, KernelEvent>,
    stats: PairingStats,
}

impl SyscallPairer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns the completed pair when `event` is a matching exit
    pub fn observe(&mut self, event: &KernelEvent) -> Option<PairedSyscall> {
        let (phase, name) = event.syscall()?;
        let key = pending_key(event, name);

        match phase {
            SyscallPhase::Entry => {
                if self.pending.insert(key, event.clone()).is_some() {
                    self.stats.stale_entries += 1;
                    trace!(tid = event.tid, syscall = name, "entry overwrote pending entry");
                }
                None
            }
            SyscallPhase::Exit => {
                let Some(entry) = self.pending.remove(&key) else {
                    self.stats.unmatched_exits += 1;
                    trace!(tid = event.tid, syscall = name, "exit without pending entry");
                    return None;
                };
                Some(self.complete(entry, event, name))
            }
        }
    }

    fn complete(&mut self, entry: KernelEvent, exit: &KernelEvent, name: &str) -> PairedSyscall {
        let mut end_time = exit.timestamp;
        if end_time < entry.timestamp {
            end_time = entry.timestamp;
            self.stats.clamped += 1;
        }
        self.stats.paired += 1;

        let pid = if exit.pid >= 0 { exit.pid } else { entry.pid };
        let cpu_id = if exit.cpu_id >= 0 { exit.cpu_id } else { entry.cpu_id };
        let process_name = if exit.has_identity() {
            exit.process_name.clone()
        } else {
            entry.process_name.clone()
        };

        PairedSyscall {
            name: name.to_string(),
            tid: exit.tid,
            pid,
            process_name,
            cpu_id,
            start_time: entry.timestamp,
            end_time,
            return_value: exit.int_field("ret"),
            entry_fields: entry.fields,
            exit_fields: exit.fields.clone(),
        }
    }

    /// Entries still waiting for an exit
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &PairingStats {
        &self.stats
    }
}

fn pending_key(event: &KernelEvent, name: &str) -> PendingKey {
    let cpu = if event.has_identity() { UNKNOWN_ID } else { event.cpu_id };
    (event.tid, cpu, name.to_string())
}
