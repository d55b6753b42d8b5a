use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::map::{DescriptorKind, DescriptorMap};
use crate::error::{Result, TraceError};

/// Descriptors that were already open when tracing began
///
/// Built from a JSON object mapping pid (as a string) to the raw `lsof -Fn`
/// output captured for that process:
///
/// ```json
/// { "1234": "p1234\nf3\nn/var/log/app.log\nf4\nn127.0.0.1:6379->127.0.0.1:50123\n" }
/// ```
#[derive(Debug, Clone, Default)]
pub struct DescriptorSnapshot {
    entries: BTreeMap<(i32, i64), String>,
}

impl DescriptorSnapshot {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| TraceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let listings: BTreeMap<String, String> = serde_json::from_str(content)?;
        let mut snapshot = Self::default();
        for (pid, raw) in &listings {
            snapshot.add_listing(pid.trim().parse().ok(), raw);
        }
        info!(
            processes = listings.len(),
            descriptors = snapshot.len(),
            "Loaded descriptor snapshot"
        );
        Ok(snapshot)
    }

    /// Parse one `lsof -Fn` listing
    ///
    /// `p<pid>` lines switch process, `f<fd>` lines select a descriptor and
    /// `n<name>` lines name it. Non-numeric descriptors (cwd, txt, mem) and
    /// `type=` pseudo names are skipped. `default_pid` applies until the
    /// first `p` line.
    pub fn add_listing(&mut self, default_pid: Option<i32>, raw: &str) {
        let mut pid = default_pid;
        let mut fd: Option<i64> = None;

        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut chars = line.chars();
            let tag = chars.next();
            let rest = chars.as_str();
            match tag {
                Some('p') => {
                    pid = rest.parse().ok();
                    fd = None;
                    if pid.is_none() {
                        debug!(line, "unparseable pid in snapshot listing");
                    }
                }
                Some('f') => fd = rest.parse().ok(),
                Some('n') => {
                    if let (Some(pid), Some(fd)) = (pid, fd) {
                        if !rest.is_empty() && !rest.starts_with("type=") {
                            self.entries.insert((pid, fd), rest.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Seed every entry into `map` as an interval starting at 0.0
    pub fn seed_into(&self, map: &mut DescriptorMap) {
        for ((pid, fd), name) in &self.entries {
            map.seed(*pid, *fd, name.as_str(), DescriptorKind::classify(name));
        }
    }

    pub fn get(&self, pid: i32, fd: i64) -> Option<&str> {
        self.entries.get(&(pid, fd)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
