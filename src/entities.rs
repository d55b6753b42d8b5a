//! Long-lived entities derived from the event stream
//!
//! Processes, threads and CPUs come straight from resolved event identity.
//! Files and sockets are keyed by the name a descriptor resolved to, so
//! descriptor references are recorded during the pass and resolved against
//! the complete [`DescriptorMap`] once the input is exhausted.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::descriptor::{socket_id, DescriptorKind, DescriptorMap};
use crate::event::{strip_quotes, KernelEvent, SyscallPhase, Value, UNKNOWN_PROCESS};
use crate::pairing::PairedSyscall;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Process {
    pub pid: i32,
    pub name: String,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<i32>,
    pub thread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub tid: i32,
    pub pid: i32,
    pub name: String,
    pub start_time: f64,
    pub end_time: f64,
    pub syscall_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct File {
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub first_access: f64,
    pub last_access: f64,
    pub access_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Socket {
    pub socket_id: String,
    pub address: String,
    pub port: i64,
    pub protocol: String,
    pub family: String,
    #[serde(rename = "type")]
    pub socket_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<i64>,
    pub first_access: f64,
    pub last_access: f64,
    pub access_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cpu {
    pub cpu_id: i32,
    pub event_count: u64,
}

/// Final entity tables, each sorted by natural key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Entities {
    pub processes: Vec<Process>,
    pub threads: Vec<Thread>,
    pub files: Vec<File>,
    pub sockets: Vec<Socket>,
    pub cpus: Vec<Cpu>,
}

impl Entities {
    pub fn process(&self, pid: i32) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    pub fn file(&self, path: &str) -> Option<&File> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn socket(&self, socket_id: &str) -> Option<&Socket> {
        self.sockets.iter().find(|s| s.socket_id == socket_id)
    }
}

#[derive(Debug, Clone)]
enum RefKind {
    Access,
    Connect { address: Option<String>, port: Option<i64> },
    Bind { address: Option<String>, port: Option<i64> },
}

/// A descriptor use waiting for the complete interval map
#[derive(Debug, Clone)]
struct DescriptorRef {
    pid: i32,
    fd: i64,
    timestamp: f64,
    kind: RefKind,
}

const OPEN_SYSCALLS: &[&str] = &["open", "openat", "openat2", "creat"];

/// Folds events into entity tables
#[derive(Debug, Default)]
pub struct EntityBuilder {
    processes: BTreeMap<i32, Process>,
    threads: BTreeMap<(i32, i32), Thread>,
    pid_threads: BTreeMap<i32, BTreeSet<i32>>,
    files: BTreeMap<String, File>,
    sockets: BTreeMap<String, Socket>,
    cpus: BTreeMap<i32, Cpu>,
    refs: Vec<DescriptorRef>,
}

impl EntityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one identity-resolved event
    pub fn observe(&mut self, event: &KernelEvent) {
        let ts = event.timestamp;

        if event.cpu_id >= 0 {
            self.cpus
                .entry(event.cpu_id)
                .or_insert(Cpu {
                    cpu_id: event.cpu_id,
                    event_count: 0,
                })
                .event_count += 1;
        }

        if event.pid > 0 {
            self.touch_process(event.pid, &event.process_name, ts);
        }
        if event.tid > 0 && event.pid > 0 {
            self.touch_thread(event.tid, event.pid, &event.process_name, ts);
        }

        match event.event_type.as_str() {
            "sched_process_fork" => self.observe_fork(event),
            "sched_process_exec" => self.observe_exec(event),
            _ => {}
        }

        if let Some((SyscallPhase::Entry, name)) = event.syscall() {
            if let Some(thread) = self.threads.get_mut(&(event.tid, event.pid)) {
                thread.syscall_count += 1;
            }
            self.observe_syscall_entry(event, name);
        }
    }

    fn touch_process(&mut self, pid: i32, name: &str, ts: f64) {
        let process = self.processes.entry(pid).or_insert_with(|| Process {
            pid,
            name: name.to_string(),
            start_time: ts,
            end_time: ts,
            parent_pid: None,
            thread_count: 0,
        });
        process.start_time = process.start_time.min(ts);
        process.end_time = process.end_time.max(ts);
        if process.name == UNKNOWN_PROCESS && name != UNKNOWN_PROCESS {
            process.name = name.to_string();
        }
    }

    fn touch_thread(&mut self, tid: i32, pid: i32, name: &str, ts: f64) {
        let thread = self.threads.entry((tid, pid)).or_insert_with(|| Thread {
            tid,
            pid,
            name: name.to_string(),
            start_time: ts,
            end_time: ts,
            syscall_count: 0,
        });
        thread.start_time = thread.start_time.min(ts);
        thread.end_time = thread.end_time.max(ts);
        if thread.name == UNKNOWN_PROCESS && name != UNKNOWN_PROCESS {
            thread.name = name.to_string();
        }
        self.pid_threads.entry(pid).or_default().insert(tid);
    }

    fn observe_fork(&mut self, event: &KernelEvent) {
        let ts = event.timestamp;
        let parent_pid = int(event, "parent_pid").or((event.pid > 0).then_some(event.pid));
        let Some(child_pid) = int(event, "child_pid").filter(|pid| *pid > 0) else {
            return;
        };
        let child_tid = int(event, "child_tid").unwrap_or(child_pid);
        let comm = event
            .text_field("child_comm")
            .map(strip_quotes)
            .unwrap_or(UNKNOWN_PROCESS);

        // A new thread in the same process is not a new process
        if Some(child_pid) != parent_pid {
            self.touch_process(child_pid, comm, ts);
            if let Some(process) = self.processes.get_mut(&child_pid) {
                process.parent_pid = parent_pid;
            }
        }
        self.touch_thread(child_tid, child_pid, comm, ts);
    }

    fn observe_exec(&mut self, event: &KernelEvent) {
        let Some(filename) = event.text_field("filename") else {
            return;
        };
        let comm = filename.rsplit('/').next().unwrap_or(filename);
        if let Some(process) = self.processes.get_mut(&event.pid) {
            process.name = comm.to_string();
        }
        if let Some(thread) = self.threads.get_mut(&(event.tid, event.pid)) {
            thread.name = comm.to_string();
        }
    }

    fn observe_syscall_entry(&mut self, event: &KernelEvent, name: &str) {
        let ts = event.timestamp;

        if OPEN_SYSCALLS.contains(&name) {
            if let Some(path) = event
                .text_field("filename")
                .or_else(|| event.text_field("pathname"))
                .filter(|p| !p.is_empty())
            {
                self.touch_file(path, ts);
            }
            return;
        }

        if name == "socket" {
            return;
        }

        let Some(fd) = event.int_field("fd").filter(|fd| *fd >= 0) else {
            return;
        };
        let kind = match name {
            "connect" => RefKind::Connect {
                address: ip_address(event),
                port: event.int_field("dport"),
            },
            "bind" => RefKind::Bind {
                address: ip_address(event),
                port: event.int_field("sport").or_else(|| event.int_field("dport")),
            },
            _ => RefKind::Access,
        };
        self.refs.push(DescriptorRef {
            pid: event.pid,
            fd,
            timestamp: ts,
            kind,
        });
    }

    /// Fold one completed syscall
    ///
    /// Sockets are created from the pair so the id matches the descriptor
    /// interval the map opened for the same call.
    pub fn observe_pair(&mut self, pair: &PairedSyscall) {
        if pair.name != "socket" || pair.return_value.map_or(true, |ret| ret < 0) {
            return;
        }
        let id = socket_id(pair.pid, pair.start_time);
        let family = pair.entry_int("family");
        let sock_type = pair.entry_int("type");
        let protocol = pair.entry_int("protocol");
        self.sockets.entry(id.clone()).or_insert_with(|| Socket {
            socket_id: id,
            address: "0.0.0.0".to_string(),
            port: 0,
            protocol: protocol_name(protocol, sock_type),
            family: family_name(family),
            socket_type: type_name(sock_type),
            remote_address: None,
            remote_port: None,
            first_access: pair.start_time,
            last_access: pair.start_time,
            access_count: 0,
        });
    }

    fn touch_file(&mut self, path: &str, ts: f64) {
        let file = self.files.entry(path.to_string()).or_insert_with(|| File {
            path: path.to_string(),
            file_type: file_type(path).to_string(),
            first_access: ts,
            last_access: ts,
            access_count: 0,
        });
        file.first_access = file.first_access.min(ts);
        file.last_access = file.last_access.max(ts);
        file.access_count += 1;
    }

    fn touch_socket(&mut self, name: &str, ts: f64) -> &mut Socket {
        let socket = self
            .sockets
            .entry(name.to_string())
            .or_insert_with(|| snapshot_socket(name, ts));
        socket.first_access = socket.first_access.min(ts);
        socket.last_access = socket.last_access.max(ts);
        socket.access_count += 1;
        socket
    }

    /// Resolve deferred descriptor references and produce sorted tables
    pub fn finish(mut self, map: &mut DescriptorMap) -> Entities {
        for r in std::mem::take(&mut self.refs) {
            let Some(interval) = map.resolve(r.pid, r.fd, r.timestamp) else {
                continue;
            };
            let name = interval.resolved_name.clone();
            match interval.kind {
                DescriptorKind::File => self.touch_file(&name, r.timestamp),
                DescriptorKind::Socket => {
                    let socket = self.touch_socket(&name, r.timestamp);
                    match r.kind {
                        RefKind::Access => {}
                        RefKind::Connect { address, port } => {
                            if address.is_some() {
                                socket.remote_address = address;
                            }
                            if port.is_some() {
                                socket.remote_port = port;
                            }
                        }
                        RefKind::Bind { address, port } => {
                            if let Some(address) = address {
                                socket.address = address;
                            }
                            if let Some(port) = port {
                                socket.port = port;
                            }
                        }
                    }
                }
            }
        }

        for (pid, tids) in &self.pid_threads {
            if let Some(process) = self.processes.get_mut(pid) {
                process.thread_count = tids.len();
            }
        }

        Entities {
            processes: self.processes.into_values().collect(),
            threads: self.threads.into_values().collect(),
            files: self.files.into_values().collect(),
            sockets: self.sockets.into_values().collect(),
            cpus: self.cpus.into_values().collect(),
        }
    }
}

fn int(event: &KernelEvent, key: &str) -> Option<i32> {
    event.int_field(key).and_then(|v| i32::try_from(v).ok())
}

/// Classify a path by where it lives
pub fn file_type(path: &str) -> &'static str {
    if path.starts_with("/dev/") {
        "device"
    } else if path.starts_with("/proc/") {
        "procfs"
    } else if path.starts_with("/sys/") {
        "sysfs"
    } else if path.starts_with("pipe") {
        "pipe"
    } else if path.starts_with("anon_inode") {
        "anon_inode"
    } else {
        "file"
    }
}

fn family_name(family: Option<i64>) -> String {
    match family {
        Some(1) => "AF_UNIX".to_string(),
        Some(2) => "AF_INET".to_string(),
        Some(10) => "AF_INET6".to_string(),
        Some(16) => "AF_NETLINK".to_string(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}

fn type_name(sock_type: Option<i64>) -> String {
    // SOCK_NONBLOCK and SOCK_CLOEXEC are or'ed into the type argument
    match sock_type.map(|t| t & 0xf) {
        Some(1) => "SOCK_STREAM".to_string(),
        Some(2) => "SOCK_DGRAM".to_string(),
        Some(3) => "SOCK_RAW".to_string(),
        Some(5) => "SOCK_SEQPACKET".to_string(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}

fn protocol_name(protocol: Option<i64>, sock_type: Option<i64>) -> String {
    match (protocol, sock_type.map(|t| t & 0xf)) {
        (Some(6), _) | (Some(0), Some(1)) => "tcp".to_string(),
        (Some(17), _) | (Some(0), Some(2)) => "udp".to_string(),
        (Some(other), _) => other.to_string(),
        (None, _) => "0".to_string(),
    }
}

/// Address from LTTng's extended socket fields (`v4addr` / `v6addr`)
fn ip_address(event: &KernelEvent) -> Option<String> {
    if let Some(octets) = event.field("v4addr").and_then(array_values) {
        if octets.len() == 4 {
            let parts: Vec<String> = octets.iter().map(i64::to_string).collect();
            return Some(parts.join("."));
        }
    }
    if let Some(bytes) = event.field("v6addr").and_then(array_values) {
        if bytes.len() == 16 {
            let groups: Vec<String> = bytes
                .chunks(2)
                .map(|pair| format!("{:x}", (pair[0] << 8) | pair[1]))
                .collect();
            return Some(groups.join(":"));
        }
    }
    None
}

/// Values of a babeltrace array like `[ [0] = 127, [1] = 0 ]`
fn array_values(value: &Value) -> Option<Vec<i64>> {
    let text = value.as_str()?;
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    inner
        .split(',')
        .map(|item| {
            let (_, v) = item.split_once('=')?;
            v.trim().parse().ok()
        })
        .collect()
}

/// Socket entity for a name that only appeared in a descriptor snapshot
fn snapshot_socket(name: &str, ts: f64) -> Socket {
    let (local, remote) = match name.split_once("->") {
        Some((l, r)) => (l, Some(r)),
        None => (name, None),
    };
    let (address, port) = split_host_port(local);
    let (remote_address, remote_port) = match remote.map(split_host_port) {
        Some((a, p)) => (Some(a), Some(p)),
        None => (None, None),
    };
    Socket {
        socket_id: name.to_string(),
        address,
        port,
        protocol: "unknown".to_string(),
        family: "unknown".to_string(),
        socket_type: "unknown".to_string(),
        remote_address,
        remote_port,
        first_access: ts,
        last_access: ts,
        access_count: 0,
    }
}

fn split_host_port(addr: &str) -> (String, i64) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (addr.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::SyscallPairer;

    fn event(ts: f64, cpu: i32, name: &str, pid: i32, tid: i32, comm: &str, fields: &[(&str, Value)]) -> KernelEvent {
        let mut e = KernelEvent::new(
            ts,
            cpu,
            name,
            fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        );
        e.pid = pid;
        e.tid = tid;
        e.process_name = comm.to_string();
        e
    }

    fn i(v: i64) -> Value {
        Value::Integer(v)
    }

    fn s(v: &str) -> Value {
        Value::Text(v.to_string())
    }

    #[test]
    fn test_process_thread_lifetimes() {
        let mut builder = EntityBuilder::new();
        builder.observe(&event(1.0, 0, "syscall_entry_read", 10, 10, "app", &[]));
        builder.observe(&event(2.0, 1, "syscall_entry_read", 10, 11, "app", &[]));
        builder.observe(&event(3.0, 0, "syscall_exit_read", 10, 10, "app", &[]));
        let entities = builder.finish(&mut DescriptorMap::new());

        let process = entities.process(10).unwrap();
        assert_eq!(process.start_time, 1.0);
        assert_eq!(process.end_time, 3.0);
        assert_eq!(process.thread_count, 2);

        assert_eq!(entities.threads.len(), 2);
        assert_eq!(entities.threads[0].syscall_count, 1);
        assert_eq!(entities.cpus, vec![
            Cpu { cpu_id: 0, event_count: 2 },
            Cpu { cpu_id: 1, event_count: 1 },
        ]);
    }

    #[test]
    fn test_unresolved_identity_skipped() {
        let mut builder = EntityBuilder::new();
        builder.observe(&event(1.0, 0, "syscall_entry_read", -1, -1, "unknown", &[]));
        let entities = builder.finish(&mut DescriptorMap::new());
        assert!(entities.processes.is_empty());
        assert!(entities.threads.is_empty());
        assert_eq!(entities.cpus.len(), 1);
    }

    #[test]
    fn test_fork_creates_child_with_parent() {
        let mut builder = EntityBuilder::new();
        builder.observe(&event(
            1.0,
            0,
            "sched_process_fork",
            100,
            100,
            "bash",
            &[
                ("parent_pid", i(100)),
                ("child_pid", i(200)),
                ("child_tid", i(200)),
                ("child_comm", s("bash")),
            ],
        ));
        builder.observe(&event(
            1.5,
            0,
            "sched_process_exec",
            200,
            200,
            "ls",
            &[("filename", s("/bin/ls")), ("tid", i(200))],
        ));
        let entities = builder.finish(&mut DescriptorMap::new());

        let child = entities.process(200).unwrap();
        assert_eq!(child.parent_pid, Some(100));
        assert_eq!(child.name, "ls");
        assert_eq!(child.start_time, 1.0);
        assert!(entities.process(100).unwrap().parent_pid.is_none());
    }

    #[test]
    fn test_thread_fork_not_a_process() {
        let mut builder = EntityBuilder::new();
        builder.observe(&event(
            1.0,
            0,
            "sched_process_fork",
            100,
            100,
            "srv",
            &[("parent_pid", i(100)), ("child_pid", i(100)), ("child_tid", i(101))],
        ));
        let entities = builder.finish(&mut DescriptorMap::new());
        assert_eq!(entities.processes.len(), 1);
        assert_eq!(entities.process(100).unwrap().thread_count, 2);
    }

    #[test]
    fn test_file_access_counts_resolved_references() {
        let mut map = DescriptorMap::new();
        map.open(10, 5, 1.0, "/tmp/a", DescriptorKind::File);
        map.close(10, 5, 1.05);

        let mut builder = EntityBuilder::new();
        builder.observe(&event(1.0, 0, "syscall_entry_openat", 10, 10, "app", &[("filename", s("/tmp/a"))]));
        builder.observe(&event(1.01, 0, "syscall_entry_read", 10, 10, "app", &[("fd", i(5))]));
        builder.observe(&event(1.02, 0, "syscall_entry_read", 10, 10, "app", &[("fd", i(5))]));
        // After close: unresolved, not counted
        builder.observe(&event(2.0, 0, "syscall_entry_read", 10, 10, "app", &[("fd", i(5))]));
        let entities = builder.finish(&mut map);

        let file = entities.file("/tmp/a").unwrap();
        assert_eq!(file.access_count, 3);
        assert_eq!(file.first_access, 1.0);
        assert_eq!(file.last_access, 1.02);
        assert_eq!(file.file_type, "file");
        assert_eq!(map.stats().unresolved, 1);
    }

    /// Pair a socket() entry/exit, feeding both the map and the builder
    fn create_socket(
        map: &mut DescriptorMap,
        builder: &mut EntityBuilder,
        entry: KernelEvent,
        exit: KernelEvent,
    ) {
        let mut pairer = SyscallPairer::new();
        for e in [&entry, &exit] {
            builder.observe(e);
            if let Some(pair) = pairer.observe(e) {
                map.apply(&pair);
                builder.observe_pair(&pair);
            }
        }
    }

    #[test]
    fn test_socket_creation_and_connect() {
        let mut map = DescriptorMap::new();
        let mut builder = EntityBuilder::new();
        create_socket(
            &mut map,
            &mut builder,
            event(
                1.0,
                0,
                "syscall_entry_socket",
                10,
                10,
                "app",
                &[("family", i(2)), ("type", i(2049)), ("protocol", i(0))],
            ),
            event(1.0001, 0, "syscall_exit_socket", 10, 10, "app", &[("ret", i(3))]),
        );
        builder.observe(&event(
            1.1,
            0,
            "syscall_entry_connect",
            10,
            10,
            "app",
            &[
                ("fd", i(3)),
                ("family", i(2)),
                ("dport", i(6379)),
                ("v4addr", s("[ [0] = 127, [1] = 0, [2] = 0, [3] = 1 ]")),
            ],
        ));
        let entities = builder.finish(&mut map);

        let socket = entities.socket("socket_10_1.0").unwrap();
        assert_eq!(socket.family, "AF_INET");
        assert_eq!(socket.socket_type, "SOCK_STREAM");
        assert_eq!(socket.protocol, "tcp");
        assert_eq!(socket.remote_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(socket.remote_port, Some(6379));
        assert_eq!(socket.access_count, 1);
    }

    #[test]
    fn test_socket_id_matches_descriptor_when_exit_pid_differs() {
        let mut map = DescriptorMap::new();
        let mut builder = EntityBuilder::new();
        // Entry resolved to the thread's pid before a fork hint corrected it
        create_socket(
            &mut map,
            &mut builder,
            event(2.0, 0, "syscall_entry_socket", 20, 21, "app", &[("family", i(2)), ("type", i(1))]),
            event(2.0001, 0, "syscall_exit_socket", 30, 21, "app", &[("ret", i(4))]),
        );
        builder.observe(&event(2.5, 0, "syscall_entry_sendto", 30, 21, "app", &[("fd", i(4))]));
        let entities = builder.finish(&mut map);

        assert_eq!(entities.sockets.len(), 1);
        let socket = &entities.sockets[0];
        assert_eq!(socket.socket_id, "socket_30_2.0");
        assert_eq!(socket.family, "AF_INET");
        assert_eq!(socket.access_count, 1);
    }

    #[test]
    fn test_failed_socket_creates_nothing() {
        let mut map = DescriptorMap::new();
        let mut builder = EntityBuilder::new();
        create_socket(
            &mut map,
            &mut builder,
            event(1.0, 0, "syscall_entry_socket", 10, 10, "app", &[("family", i(2))]),
            event(1.1, 0, "syscall_exit_socket", 10, 10, "app", &[("ret", i(-97))]),
        );
        let entities = builder.finish(&mut map);
        assert!(entities.sockets.is_empty());
    }

    #[test]
    fn test_snapshot_socket_materialised_on_use() {
        let mut map = DescriptorMap::new();
        map.seed(10, 4, "10.0.0.1:6379->10.0.0.2:41000", DescriptorKind::Socket);

        let mut builder = EntityBuilder::new();
        builder.observe(&event(5.0, 0, "syscall_entry_recvfrom", 10, 10, "redis", &[("fd", i(4))]));
        let entities = builder.finish(&mut map);

        let socket = &entities.sockets[0];
        assert_eq!(socket.address, "10.0.0.1");
        assert_eq!(socket.port, 6379);
        assert_eq!(socket.remote_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(socket.remote_port, Some(41000));
    }

    #[test]
    fn test_file_types() {
        assert_eq!(file_type("/dev/null"), "device");
        assert_eq!(file_type("/proc/self/stat"), "procfs");
        assert_eq!(file_type("/sys/kernel/mm"), "sysfs");
        assert_eq!(file_type("pipe:[1234]"), "pipe");
        assert_eq!(file_type("/etc/hosts"), "file");
    }

    #[test]
    fn test_v6_address() {
        let mut bytes = vec![0i64; 16];
        bytes[15] = 1;
        let text = format!(
            "[ {} ]",
            bytes
                .iter()
                .enumerate()
                .map(|(n, b)| format!("[{}] = {}", n, b))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let e = event(1.0, 0, "syscall_entry_connect", 1, 1, "a", &[("v6addr", s(&text))]);
        assert_eq!(ip_address(&e).as_deref(), Some("0:0:0:0:0:0:0:1"));
    }
}
