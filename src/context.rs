//! Caller identity reconstruction
//!
//! Most syscall events carry only their arguments, not the pid/tid/comm of
//! the thread that issued them. The resolver keeps a rolling
//! `tid -> (pid, comm)` map fed by scheduler, fork and exec events, plus the
//! thread currently running on each CPU, and uses both to backfill identity.

use fnv::FnvHashMap;
use serde::Serialize;

use crate::event::{strip_quotes, KernelEvent, UNKNOWN_ID, UNKNOWN_PROCESS};

/// Last known identity of a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIdentity {
    pub pid: i32,
    pub comm: String,
}

/// How identity was obtained for resolved events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    /// Inserts and changes to the thread-context map
    pub context_updates: u64,
    /// Events whose tid came from their own fields
    pub resolved_direct: u64,
    /// Events whose tid came from the thread scheduled on their CPU
    pub resolved_cpu_fallback: u64,
    /// Events left with sentinel identity
    pub unresolved: u64,
}

/// Authoritative `tid -> pid` facts collected by a pre-scan pass
///
/// Consulted whenever the resolver would otherwise assume `pid == tid`.
#[derive(Debug, Clone, Default)]
pub struct PidHints {
    hints: FnvHashMap<i32, i32>,
}

impl PidHints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the tid/pid pairs an event states explicitly
    pub fn observe(&mut self, event: &KernelEvent) {
        if event.event_type == "sched_process_fork" {
            if let (Some(tid), Some(pid)) = (int(event, "child_tid"), int(event, "child_pid")) {
                self.hints.insert(tid, pid);
            }
            if let Some(pid) = int(event, "parent_pid") {
                let tid = int(event, "parent_tid").unwrap_or(pid);
                self.hints.insert(tid, pid);
            }
        }
        if let (Some(tid), Some(pid)) = (int(event, "vtid"), int(event, "vpid")) {
            self.hints.insert(tid, pid);
        }
    }

    pub fn insert(&mut self, tid: i32, pid: i32) {
        self.hints.insert(tid, pid);
    }

    pub fn get(&self, tid: i32) -> Option<i32> {
        self.hints.get(&tid).copied()
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

/// Rolling thread-context map plus per-CPU current thread
#[derive(Debug, Default)]
pub struct ContextResolver {
    threads: FnvHashMap<i32, ThreadIdentity>,
    cpu_current: FnvHashMap<i32, i32>,
    hints: PidHints,
    stats: ContextStats,
}

impl ContextResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver that consults pre-scanned pid facts before assuming `pid == tid`
    pub fn with_hints(hints: PidHints) -> Self {
        Self {
            hints,
            ..Self::default()
        }
    }

    /// Update context from the event, then fill in its pid/tid/process_name
    ///
    /// Events that cannot be resolved keep the sentinel identity.
    pub fn resolve(&mut self, event: &mut KernelEvent) {
        self.observe(event);

        let is_syscall = event.syscall().is_some();
        let mut from_cpu = false;

        let tid = explicit_tid(event, is_syscall).or_else(|| {
            let current = self.cpu_current.get(&event.cpu_id).copied();
            from_cpu = current.is_some();
            current
        });

        let Some(tid) = tid else {
            self.stats.unresolved += 1;
            return;
        };

        let known = self.threads.get(&tid);
        let pid = explicit_pid(event, is_syscall)
            .or_else(|| known.map(|t| t.pid))
            .or_else(|| self.hints.get(tid))
            .unwrap_or(UNKNOWN_ID);
        let comm = explicit_comm(event, is_syscall)
            .map(str::to_string)
            .or_else(|| known.map(|t| t.comm.clone()))
            .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());

        event.tid = tid;
        event.pid = pid;
        event.process_name = comm;

        if from_cpu {
            self.stats.resolved_cpu_fallback += 1;
        } else {
            self.stats.resolved_direct += 1;
        }
    }

    /// Update the thread-context and CPU maps from one event
    pub fn observe(&mut self, event: &KernelEvent) {
        match event.event_type.as_str() {
            "sched_switch" => {
                if let Some(next_tid) = int(event, "next_tid") {
                    if event.cpu_id >= 0 {
                        self.cpu_current.insert(event.cpu_id, next_tid);
                    }
                    if let Some(comm) = text(event, "next_comm") {
                        self.upsert_assumed(next_tid, comm);
                    }
                }
                if let (Some(prev_tid), Some(comm)) = (int(event, "prev_tid"), text(event, "prev_comm")) {
                    self.upsert_assumed(prev_tid, comm);
                }
            }
            "sched_process_fork" => {
                // Highest-confidence source: overwrite both sides
                if let (Some(tid), Some(pid)) = (int(event, "child_tid"), int(event, "child_pid")) {
                    let comm = text(event, "child_comm").unwrap_or(UNKNOWN_PROCESS);
                    self.set(tid, pid, comm);
                }
                if let Some(pid) = int(event, "parent_pid") {
                    let tid = int(event, "parent_tid").unwrap_or(pid);
                    let comm = text(event, "parent_comm").unwrap_or(UNKNOWN_PROCESS);
                    self.set(tid, pid, comm);
                }
            }
            "sched_process_exec" => {
                if let (Some(tid), Some(filename)) = (int(event, "tid"), text(event, "filename")) {
                    let comm = filename.rsplit('/').next().unwrap_or(filename);
                    let pid = self
                        .threads
                        .get(&tid)
                        .map(|t| t.pid)
                        .or_else(|| self.hints.get(tid))
                        .unwrap_or(tid);
                    self.set(tid, pid, comm);
                }
            }
            name if name.starts_with("sched_waking")
                || name.starts_with("sched_wakeup")
                || name.starts_with("sched_stat_") =>
            {
                if let (Some(tid), Some(comm)) = (int(event, "tid"), text(event, "comm")) {
                    if !self.threads.contains_key(&tid) {
                        self.upsert_assumed(tid, comm);
                    }
                }
            }
            _ => {}
        }

        // LTTng context fields describe the thread that emitted the event
        if let Some(tid) = int(event, "vtid") {
            let known = self.threads.get(&tid);
            let pid = int(event, "vpid")
                .or_else(|| known.map(|t| t.pid))
                .or_else(|| self.hints.get(tid))
                .unwrap_or(tid);
            let comm = text(event, "procname")
                .map(str::to_string)
                .or_else(|| known.map(|t| t.comm.clone()))
                .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());
            self.set(tid, pid, &comm);
        }
    }

    /// Record a thread seen only through scheduling: keep a known pid,
    /// otherwise assume `pid == tid` unless a pre-scan hint says better
    fn upsert_assumed(&mut self, tid: i32, comm: &str) {
        match self.threads.get_mut(&tid) {
            Some(identity) => {
                if identity.comm != comm {
                    identity.comm = comm.to_string();
                    self.stats.context_updates += 1;
                }
            }
            None => {
                let pid = self.hints.get(tid).unwrap_or(tid);
                self.threads.insert(
                    tid,
                    ThreadIdentity {
                        pid,
                        comm: comm.to_string(),
                    },
                );
                self.stats.context_updates += 1;
            }
        }
    }

    fn set(&mut self, tid: i32, pid: i32, comm: &str) {
        let identity = ThreadIdentity {
            pid,
            comm: comm.to_string(),
        };
        if self.threads.get(&tid) != Some(&identity) {
            self.threads.insert(tid, identity);
            self.stats.context_updates += 1;
        }
    }

    pub fn lookup(&self, tid: i32) -> Option<&ThreadIdentity> {
        self.threads.get(&tid)
    }

    /// Thread most recently switched in on `cpu_id`
    pub fn current_tid(&self, cpu_id: i32) -> Option<i32> {
        self.cpu_current.get(&cpu_id).copied()
    }

    pub fn known_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn stats(&self) -> &ContextStats {
        &self.stats
    }
}

fn int(event: &KernelEvent, key: &str) -> Option<i32> {
    event.int_field(key).and_then(|v| i32::try_from(v).ok())
}

fn text<'a>(event: &'a KernelEvent, key: &str) -> Option<&'a str> {
    event.text_field(key).map(strip_quotes)
}

/// Caller tid stated by the event itself
///
/// Syscall payloads use `pid`/`tid` as arguments (kill, wait4, ...), so only
/// the `vtid` context field is trusted for them.
fn explicit_tid(event: &KernelEvent, is_syscall: bool) -> Option<i32> {
    if let Some(tid) = int(event, "vtid") {
        return Some(tid);
    }
    if is_syscall {
        return None;
    }
    if let Some(tid) = int(event, "tid") {
        return Some(tid);
    }
    match event.event_type.as_str() {
        "sched_switch" => int(event, "next_tid").or_else(|| int(event, "prev_tid")),
        "sched_process_fork" => int(event, "parent_tid")
            .or_else(|| int(event, "parent_pid"))
            .or_else(|| int(event, "child_tid")),
        _ => None,
    }
}

fn explicit_pid(event: &KernelEvent, is_syscall: bool) -> Option<i32> {
    if let Some(pid) = int(event, "vpid") {
        return Some(pid);
    }
    if is_syscall {
        return None;
    }
    int(event, "pid").or_else(|| {
        if event.event_type == "sched_process_fork" {
            int(event, "parent_pid")
        } else {
            None
        }
    })
}

fn explicit_comm(event: &KernelEvent, is_syscall: bool) -> Option<&str> {
    if let Some(comm) = text(event, "procname") {
        return Some(comm);
    }
    if is_syscall {
        return None;
    }
    text(event, "comm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use std::collections::BTreeMap;

    fn event(ts: f64, cpu: i32, name: &str, fields: &[(&str, Value)]) -> KernelEvent {
        let fields: BTreeMap<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        KernelEvent::new(ts, cpu, name, fields)
    }

    fn s(v: &str) -> Value {
        Value::Text(v.to_string())
    }

    fn i(v: i64) -> Value {
        Value::Integer(v)
    }

    #[test]
    fn test_cpu_fallback_after_sched_switch() {
        let mut resolver = ContextResolver::new();
        let mut switch = event(
            0.5,
            0,
            "sched_switch",
            &[
                ("prev_tid", i(0)),
                ("prev_comm", s("swapper/0")),
                ("next_tid", i(7)),
                ("next_comm", s("worker")),
            ],
        );
        resolver.resolve(&mut switch);

        let mut read = event(0.6, 0, "syscall_entry_read", &[("fd", i(3))]);
        resolver.resolve(&mut read);

        assert_eq!(read.tid, 7);
        assert_eq!(read.pid, 7);
        assert_eq!(read.process_name, "worker");
        assert_eq!(resolver.stats().resolved_cpu_fallback, 1);
    }

    #[test]
    fn test_other_cpu_not_used() {
        let mut resolver = ContextResolver::new();
        let mut switch = event(0.5, 0, "sched_switch", &[("next_tid", i(7)), ("next_comm", s("w"))]);
        resolver.resolve(&mut switch);

        let mut read = event(0.6, 1, "syscall_entry_read", &[("fd", i(3))]);
        resolver.resolve(&mut read);

        assert_eq!(read.tid, UNKNOWN_ID);
        assert_eq!(read.pid, UNKNOWN_ID);
        assert_eq!(read.process_name, UNKNOWN_PROCESS);
        assert_eq!(resolver.stats().unresolved, 1);
    }

    #[test]
    fn test_fork_overrides_assumed_pid() {
        let mut resolver = ContextResolver::new();
        let mut switch = event(1.0, 0, "sched_switch", &[("next_tid", i(101)), ("next_comm", s("redis"))]);
        resolver.resolve(&mut switch);
        assert_eq!(resolver.lookup(101).unwrap().pid, 101);

        let mut fork = event(
            1.1,
            0,
            "sched_process_fork",
            &[
                ("parent_comm", s("redis")),
                ("parent_tid", i(100)),
                ("parent_pid", i(100)),
                ("child_comm", s("redis-bio")),
                ("child_tid", i(101)),
                ("child_pid", i(100)),
            ],
        );
        resolver.resolve(&mut fork);

        let child = resolver.lookup(101).unwrap();
        assert_eq!(child.pid, 100);
        assert_eq!(child.comm, "redis-bio");
        assert_eq!(fork.tid, 100);
        assert_eq!(fork.pid, 100);
    }

    #[test]
    fn test_exec_updates_comm_only() {
        let mut resolver = ContextResolver::new();
        let mut fork = event(
            1.0,
            0,
            "sched_process_fork",
            &[
                ("parent_tid", i(1)),
                ("parent_pid", i(1)),
                ("parent_comm", s("bash")),
                ("child_tid", i(50)),
                ("child_pid", i(50)),
                ("child_comm", s("bash")),
            ],
        );
        resolver.resolve(&mut fork);

        let mut exec = event(
            1.2,
            0,
            "sched_process_exec",
            &[("filename", s("/usr/bin/ls")), ("tid", i(50)), ("old_tid", i(50))],
        );
        resolver.resolve(&mut exec);

        let identity = resolver.lookup(50).unwrap();
        assert_eq!(identity.pid, 50);
        assert_eq!(identity.comm, "ls");
    }

    #[test]
    fn test_syscall_pid_argument_not_trusted() {
        let mut resolver = ContextResolver::new();
        let mut kill = event(1.0, 3, "syscall_entry_kill", &[("pid", i(999)), ("sig", i(9))]);
        resolver.resolve(&mut kill);
        assert_eq!(kill.pid, UNKNOWN_ID);
        assert_eq!(kill.tid, UNKNOWN_ID);
    }

    #[test]
    fn test_vtid_context_is_authoritative() {
        let mut resolver = ContextResolver::new();
        let mut read = event(
            1.0,
            0,
            "syscall_entry_read",
            &[
                ("vtid", i(12)),
                ("vpid", i(10)),
                ("procname", s("nginx")),
                ("fd", i(4)),
            ],
        );
        resolver.resolve(&mut read);
        assert_eq!((read.pid, read.tid), (10, 12));
        assert_eq!(read.process_name, "nginx");
        assert_eq!(resolver.lookup(12).unwrap().pid, 10);
    }

    #[test]
    fn test_hints_replace_pid_assumption() {
        let mut hints = PidHints::new();
        hints.insert(21, 20);
        let mut resolver = ContextResolver::with_hints(hints);

        let mut switch = event(1.0, 0, "sched_switch", &[("next_tid", i(21)), ("next_comm", s("t"))]);
        resolver.resolve(&mut switch);
        let mut write = event(1.1, 0, "syscall_entry_write", &[("fd", i(1))]);
        resolver.resolve(&mut write);

        assert_eq!(write.tid, 21);
        assert_eq!(write.pid, 20);
    }

    #[test]
    fn test_pid_hints_from_fork_and_context() {
        let mut hints = PidHints::new();
        hints.observe(&event(
            1.0,
            0,
            "sched_process_fork",
            &[("parent_pid", i(5)), ("child_tid", i(6)), ("child_pid", i(5))],
        ));
        hints.observe(&event(1.0, 0, "syscall_entry_read", &[("vtid", i(9)), ("vpid", i(8))]));
        assert_eq!(hints.get(6), Some(5));
        assert_eq!(hints.get(5), Some(5));
        assert_eq!(hints.get(9), Some(8));
        assert_eq!(hints.len(), 3);
    }

    #[test]
    fn test_wakeup_only_inserts_unknown() {
        let mut resolver = ContextResolver::new();
        resolver.observe(&event(
            1.0,
            0,
            "sched_process_fork",
            &[("parent_pid", i(1)), ("child_tid", i(31)), ("child_pid", i(30)), ("child_comm", s("a"))],
        ));
        resolver.observe(&event(1.1, 0, "sched_wakeup", &[("tid", i(31)), ("comm", s("b"))]));
        resolver.observe(&event(1.1, 0, "sched_waking", &[("tid", i(40)), ("comm", s("c"))]));

        assert_eq!(resolver.lookup(31).unwrap().comm, "a");
        assert_eq!(resolver.lookup(40).unwrap().pid, 40);
        assert_eq!(resolver.known_threads(), 3);
    }
}
