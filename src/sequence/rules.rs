use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::descriptor::DescriptorKind;
use crate::error::{Result, TraceError};

const DEFAULT_RULES_TOML: &str = include_str!("../../rules-default.toml");

/// One component of a sequence grouping key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GroupKeyField {
    Tid,
    Pid,
    Cpu,
    ProcessName,
    /// Descriptor argument, resolved to its name at each call's start time
    Fd,
    /// Same as `Fd`; kept distinct so configs can say what they mean
    SocketFd,
    /// Any other entry argument, compared by its printed value
    Argument(String),
}

impl From<String> for GroupKeyField {
    fn from(name: String) -> Self {
        match name.as_str() {
            "tid" => GroupKeyField::Tid,
            "pid" => GroupKeyField::Pid,
            "cpu" | "cpu_id" => GroupKeyField::Cpu,
            "process_name" | "comm" => GroupKeyField::ProcessName,
            "fd" => GroupKeyField::Fd,
            "socket_fd" => GroupKeyField::SocketFd,
            _ => GroupKeyField::Argument(name),
        }
    }
}

impl From<GroupKeyField> for String {
    fn from(field: GroupKeyField) -> Self {
        field.to_string()
    }
}

impl fmt::Display for GroupKeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKeyField::Tid => f.write_str("tid"),
            GroupKeyField::Pid => f.write_str("pid"),
            GroupKeyField::Cpu => f.write_str("cpu"),
            GroupKeyField::ProcessName => f.write_str("process_name"),
            GroupKeyField::Fd => f.write_str("fd"),
            GroupKeyField::SocketFd => f.write_str("socket_fd"),
            GroupKeyField::Argument(name) => f.write_str(name),
        }
    }
}

/// Which descriptor kinds a rule accepts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Any,
    File,
    Socket,
}

impl TargetKind {
    /// Whether a call whose fd resolved to `kind` belongs to this rule
    ///
    /// Unresolved descriptors (`None`) count as files.
    pub fn accepts(self, kind: Option<DescriptorKind>) -> bool {
        match self {
            TargetKind::Any => true,
            TargetKind::File => kind != Some(DescriptorKind::Socket),
            TargetKind::Socket => kind == Some(DescriptorKind::Socket),
        }
    }
}

fn default_group_by() -> Vec<GroupKeyField> {
    vec![GroupKeyField::Tid]
}

fn default_time_gap_ms() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

/// Grouping rule for one operation class
///
/// # Example TOML
/// ```toml
/// [[rule]]
/// operation = "read"
/// syscalls = ["read", "pread64"]
/// group_by = ["tid", "fd"]
/// time_gap_ms = 100
/// target = "file"
/// relationship = "READ_FROM"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupingRule {
    /// Operation name, also the `EventSequence.operation` value
    pub operation: String,

    /// Syscall names this rule matches
    pub syscalls: Vec<String>,

    #[serde(default = "default_group_by")]
    pub group_by: Vec<GroupKeyField>,

    /// Largest gap (previous end to next start) still batched together
    #[serde(default = "default_time_gap_ms")]
    pub time_gap_ms: f64,

    /// One sequence per syscall regardless of timing
    #[serde(default)]
    pub immediate: bool,

    #[serde(default)]
    pub target: TargetKind,

    /// Whether positive return values are byte counts
    #[serde(default = "default_true")]
    pub transfers_bytes: bool,

    /// Graph relationship label copied onto each sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

impl GroupingRule {
    pub fn matches_syscall(&self, name: &str) -> bool {
        self.syscalls.iter().any(|s| s == name)
    }

    /// Reject rules that could never produce a sensible sequence
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| TraceError::InvalidRule {
            operation: self.operation.clone(),
            reason: reason.to_string(),
        };

        if self.operation.trim().is_empty() {
            return Err(invalid("operation name is empty"));
        }
        if self.syscalls.is_empty() {
            return Err(invalid("no syscalls listed"));
        }
        if self.syscalls.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("empty syscall name"));
        }
        if !self.time_gap_ms.is_finite() || self.time_gap_ms < 0.0 {
            return Err(invalid("time_gap_ms must be a finite, non-negative number"));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<GroupingRule>,
}

/// Ordered table of grouping rules, unique by operation name
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: Vec<GroupingRule>,
}

impl RuleSet {
    /// Built-in rules compiled into the binary from `rules-default.toml`
    pub fn default_rules() -> Result<Self> {
        Self::from_toml_str(DEFAULT_RULES_TOML)
    }

    /// Load a standalone `[[rule]]` file
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| TraceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(content)?;
        Self::from_rules(file.rule)
    }

    /// Validate rules and reject duplicate operation names
    pub fn from_rules(rules: Vec<GroupingRule>) -> Result<Self> {
        for (i, rule) in rules.iter().enumerate() {
            rule.validate()?;
            if rules[..i].iter().any(|r| r.operation == rule.operation) {
                return Err(TraceError::DuplicateRule(rule.operation.clone()));
            }
        }
        Ok(Self { rules })
    }

    /// Apply overrides: same operation name replaces, new names append
    pub fn with_overrides(mut self, overrides: Vec<GroupingRule>) -> Result<Self> {
        let overrides = Self::from_rules(overrides)?;
        for rule in overrides.rules {
            match self.rules.iter_mut().find(|r| r.operation == rule.operation) {
                Some(existing) => *existing = rule,
                None => self.rules.push(rule),
            }
        }
        Ok(self)
    }

    pub fn get(&self, operation: &str) -> Option<&GroupingRule> {
        self.rules.iter().find(|r| r.operation == operation)
    }

    pub fn rules(&self) -> &[GroupingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
