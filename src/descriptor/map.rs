use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::pairing::PairedSyscall;

/// What a descriptor refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    File,
    Socket,
}

impl DescriptorKind {
    /// Classify a name from an lsof listing by its shape
    ///
    /// Paths, pipes and anon inodes are files; `host:port`, `a->b`,
    /// `socket:[ino]` and `*:port` forms are sockets.
    pub fn classify(name: &str) -> Self {
        if name.starts_with('/') || name.starts_with("pipe") || name.starts_with("anon_inode") {
            return DescriptorKind::File;
        }
        if name.contains("->")
            || name.starts_with("socket:")
            || name.starts_with("*:")
            || name.contains(':')
        {
            return DescriptorKind::Socket;
        }
        DescriptorKind::File
    }
}

/// One period during which `(pid, fd)` referred to `resolved_name`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescriptorInterval {
    pub start: f64,
    /// `None` while still open as of the last observation
    pub end: Option<f64>,
    pub resolved_name: String,
    pub kind: DescriptorKind,
}

impl DescriptorInterval {
    /// Both ends inclusive
    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && self.end.map_or(true, |end| t <= end)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// Descriptor bookkeeping counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionStats {
    /// Intervals created from trace open/socket/accept/dup calls
    pub created: u64,
    /// Intervals seeded from a pre-trace snapshot
    pub from_snapshot: u64,
    /// Intervals ended by a successful close
    pub closed: u64,
    /// Open intervals ended because a new mapping arrived for the same key
    pub implicit_closes: u64,
    /// Successful closes with no open interval to end
    pub ignored_closes: u64,
    /// Descriptor references (one per fd-carrying syscall) that hit an interval
    pub resolved: u64,
    /// Descriptor references that fell outside every known interval
    pub unresolved: u64,
}

/// Append-only `(pid, fd) -> [interval]` map with point-in-time lookup
///
/// At most one interval per key is open at a time: a new mapping for a key
/// whose previous interval is still open ends that interval at the new
/// mapping's start. Lookups scan newest-first, so at a shared boundary the
/// newer mapping wins.
#[derive(Debug, Default)]
pub struct DescriptorMap {
    intervals: FnvHashMap<(i32, i64), Vec<DescriptorInterval>>,
    stats: ResolutionStats,
}

const OPEN_SYSCALLS: &[&str] = &["open", "openat", "openat2", "creat"];
const ACCEPT_SYSCALLS: &[&str] = &["accept", "accept4"];
const DUP_SYSCALLS: &[&str] = &["dup", "dup2", "dup3"];

impl DescriptorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new mapping for `(pid, fd)` at `start`
    pub fn open(&mut self, pid: i32, fd: i64, start: f64, name: impl Into<String>, kind: DescriptorKind) {
        self.push(pid, fd, start, name.into(), kind);
        self.stats.created += 1;
    }

    /// Seed a descriptor that was already open before the trace started
    pub fn seed(&mut self, pid: i32, fd: i64, name: impl Into<String>, kind: DescriptorKind) {
        self.push(pid, fd, 0.0, name.into(), kind);
        self.stats.from_snapshot += 1;
    }

    fn push(&mut self, pid: i32, fd: i64, start: f64, resolved_name: String, kind: DescriptorKind) {
        let list = self.intervals.entry((pid, fd)).or_default();
        if let Some(prev) = list.iter_mut().rev().find(|iv| iv.is_open()) {
            prev.end = Some(start.max(prev.start));
            self.stats.implicit_closes += 1;
        }
        list.push(DescriptorInterval {
            start,
            end: None,
            resolved_name,
            kind,
        });
    }

    /// End the most recent open interval for `(pid, fd)`
    ///
    /// Returns false (and changes nothing) when no interval is open.
    pub fn close(&mut self, pid: i32, fd: i64, end: f64) -> bool {
        let open = self
            .intervals
            .get_mut(&(pid, fd))
            .and_then(|list| list.iter_mut().rev().find(|iv| iv.is_open()));
        match open {
            Some(interval) => {
                interval.end = Some(end.max(interval.start));
                self.stats.closed += 1;
                true
            }
            None => {
                self.stats.ignored_closes += 1;
                false
            }
        }
    }

    /// Update intervals from one paired syscall
    pub fn apply(&mut self, pair: &PairedSyscall) {
        let name = pair.name.as_str();
        let Some(ret) = pair.return_value else {
            return;
        };

        if OPEN_SYSCALLS.contains(&name) && ret >= 0 {
            if let Some(filename) = pair.entry_text("filename").or_else(|| pair.entry_text("pathname")) {
                self.open(pair.pid, ret, pair.start_time, filename, DescriptorKind::File);
            }
        } else if (name == "socket" || ACCEPT_SYSCALLS.contains(&name)) && ret >= 0 {
            self.open(
                pair.pid,
                ret,
                pair.start_time,
                socket_id(pair.pid, pair.start_time),
                DescriptorKind::Socket,
            );
        } else if DUP_SYSCALLS.contains(&name) && ret >= 0 {
            let source = pair
                .entry_int("oldfd")
                .or_else(|| pair.entry_int("fildes"))
                .and_then(|oldfd| self.lookup(pair.pid, oldfd, pair.start_time))
                .map(|iv| (iv.resolved_name.clone(), iv.kind));
            if let Some((resolved, kind)) = source {
                self.open(pair.pid, ret, pair.start_time, resolved, kind);
            }
        } else if name == "close" && ret == 0 {
            if let Some(fd) = pair.entry_int("fd") {
                if !self.close(pair.pid, fd, pair.end_time) {
                    trace!(pid = pair.pid, fd, "close of untracked descriptor");
                }
            }
        }
    }

    /// Interval that `(pid, fd)` referred to at time `t`, without counting
    pub fn lookup(&self, pid: i32, fd: i64, t: f64) -> Option<&DescriptorInterval> {
        self.intervals
            .get(&(pid, fd))?
            .iter()
            .rev()
            .find(|iv| iv.contains(t))
    }

    /// Interval that `(pid, fd)` referred to at time `t`, counting hit or miss
    pub fn resolve(&mut self, pid: i32, fd: i64, t: f64) -> Option<&DescriptorInterval> {
        let found = self
            .intervals
            .get(&(pid, fd))
            .and_then(|list| list.iter().rposition(|iv| iv.contains(t)));
        match found {
            Some(idx) => {
                self.stats.resolved += 1;
                self.intervals.get(&(pid, fd)).and_then(|list| list.get(idx))
            }
            None => {
                self.stats.unresolved += 1;
                None
            }
        }
    }

    /// Name `(pid, fd)` referred to at `t`, or the `fd:<N>` placeholder, without counting
    pub fn name_at(&self, pid: i32, fd: i64, t: f64) -> String {
        self.lookup(pid, fd, t)
            .map(|iv| iv.resolved_name.clone())
            .unwrap_or_else(|| placeholder(fd))
    }

    /// Resolved name, or the `fd:<N>` placeholder
    pub fn resolve_name(&mut self, pid: i32, fd: i64, t: f64) -> String {
        self.resolve(pid, fd, t)
            .map(|iv| iv.resolved_name.clone())
            .unwrap_or_else(|| placeholder(fd))
    }

    pub fn intervals(&self, pid: i32, fd: i64) -> &[DescriptorInterval] {
        self.intervals
            .get(&(pid, fd))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of `(pid, fd)` keys with at least one interval
    pub fn key_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn stats(&self) -> &ResolutionStats {
        &self.stats
    }
}

/// Identity used for a descriptor that could not be resolved
pub fn placeholder(fd: i64) -> String {
    format!("fd:{}", fd)
}

/// Stable socket identity: creating pid plus creation timestamp
pub fn socket_id(pid: i32, start_time: f64) -> String {
    format!("socket_{}_{:?}", pid, start_time)
}
