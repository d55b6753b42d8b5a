//! Typed kernel events and field coercion
//!
//! Every `key = value` pair produced by the tokenizer is coerced into a
//! [`Value`]. Coercion never fails: anything that is not a number is kept as
//! text, so no field is ever dropped because of its type.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::tokenizer::FieldGroup;

/// Sentinel pid/tid for events whose caller identity could not be resolved
pub const UNKNOWN_ID: i32 = -1;

/// Sentinel process name for events whose caller identity could not be resolved
pub const UNKNOWN_PROCESS: &str = "unknown";

/// A coerced trace field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    HexInteger(u64),
    Text(String),
    Null,
}

impl Value {
    /// Coerce a raw field value, trying integer, hex integer, float, then text
    ///
    /// # Example
    /// ```
    /// use tracelift::event::Value;
    ///
    /// assert_eq!(Value::coerce("42"), Value::Integer(42));
    /// assert_eq!(Value::coerce("0x1f"), Value::HexInteger(31));
    /// assert_eq!(Value::coerce("\"/tmp/a\""), Value::Text("/tmp/a".to_string()));
    /// ```
    pub fn coerce(raw: &str) -> Value {
        let raw = raw.trim();
        if raw.is_empty() {
            return Value::Null;
        }

        if is_integer(raw) {
            // Out-of-range integers stay as text rather than being truncated
            return raw
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::Text(raw.to_string()));
        }

        if let Some(digits) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            return u64::from_str_radix(digits, 16)
                .map(Value::HexInteger)
                .unwrap_or_else(|_| Value::Text(raw.to_string()));
        }

        if is_decimal(raw) {
            if let Ok(v) = raw.parse::<f64>() {
                return Value::Float(v);
            }
        }

        Value::Text(strip_quotes(raw).to_string())
    }

    /// Integer view of the value (decimal or hex that fits in i64)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::HexInteger(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::HexInteger(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::HexInteger(v) => write!(f, "0x{:x}", v),
            Value::Text(s) => f.write_str(s),
            Value::Null => f.write_str("null"),
        }
    }
}

fn is_integer(raw: &str) -> bool {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_decimal(raw: &str) -> bool {
    let body = raw.strip_prefix('-').unwrap_or(raw);
    let mut dots = 0;
    let mut digits = 0;
    for b in body.bytes() {
        match b {
            b'.' => dots += 1,
            b'0'..=b'9' => digits += 1,
            _ => return false,
        }
    }
    dots == 1 && digits > 0
}

/// Strip surrounding double and single quotes from a text value
pub fn strip_quotes(raw: &str) -> &str {
    raw.trim_matches('"').trim_matches('\'')
}

/// Coerce ordered field groups into one field map
///
/// Groups are applied in order, so a key repeated in a later group (event
/// payload after stream context) overwrites the earlier one.
pub fn coerce_groups(groups: &[FieldGroup]) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for group in groups {
        for (key, raw) in group {
            fields.insert(key.clone(), Value::coerce(raw));
        }
    }
    fields
}

/// Whether a syscall event marks the start or the end of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallPhase {
    Entry,
    Exit,
}

/// Split an event name like `syscall_entry_openat` into phase and syscall name
///
/// Accepts any prefix ending in `syscall` (e.g. `compat_syscall_exit_read`).
pub fn split_syscall_event(event_type: &str) -> Option<(SyscallPhase, &str)> {
    for (marker, phase) in [("_entry_", SyscallPhase::Entry), ("_exit_", SyscallPhase::Exit)] {
        if let Some(idx) = event_type.find(marker) {
            let prefix = &event_type[..idx];
            let name = &event_type[idx + marker.len()..];
            if prefix.ends_with("syscall") && !name.is_empty() {
                return Some((phase, name));
            }
        }
    }
    None
}

/// A single parsed kernel event with resolved caller identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelEvent {
    /// Seconds since midnight
    pub timestamp: f64,
    pub cpu_id: i32,
    pub event_type: String,
    pub pid: i32,
    pub tid: i32,
    pub process_name: String,
    pub fields: BTreeMap<String, Value>,
}

impl KernelEvent {
    /// Create an event with sentinel identity; the context resolver fills it in
    pub fn new(
        timestamp: f64,
        cpu_id: i32,
        event_type: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            timestamp,
            cpu_id,
            event_type: event_type.into(),
            pid: UNKNOWN_ID,
            tid: UNKNOWN_ID,
            process_name: UNKNOWN_PROCESS.to_string(),
            fields,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn text_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Phase and syscall name if this is a syscall entry/exit event
    pub fn syscall(&self) -> Option<(SyscallPhase, &str)> {
        split_syscall_event(&self.event_type)
    }

    pub fn has_identity(&self) -> bool {
        self.tid != UNKNOWN_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_integer() {
        assert_eq!(Value::coerce("7"), Value::Integer(7));
        assert_eq!(Value::coerce("-22"), Value::Integer(-22));
        assert_eq!(Value::coerce(" 10 "), Value::Integer(10));
    }

    #[test]
    fn test_coerce_integer_overflow_kept_as_text() {
        let raw = "18446744073709551615";
        assert_eq!(Value::coerce(raw), Value::Text(raw.to_string()));
    }

    #[test]
    fn test_coerce_hex() {
        assert_eq!(Value::coerce("0x7ffd1234"), Value::HexInteger(0x7ffd1234));
        assert_eq!(
            Value::coerce("0xffffffff81000000"),
            Value::HexInteger(0xffffffff81000000)
        );
        assert_eq!(Value::coerce("0xzz"), Value::Text("0xzz".to_string()));
    }

    #[test]
    fn test_coerce_float() {
        assert_eq!(Value::coerce("1.5"), Value::Float(1.5));
        assert_eq!(Value::coerce("-0.25"), Value::Float(-0.25));
        // Two dots is not a number (e.g. a version string)
        assert_eq!(Value::coerce("1.2.3"), Value::Text("1.2.3".to_string()));
    }

    #[test]
    fn test_coerce_text_strips_quotes() {
        assert_eq!(
            Value::coerce("\"redis-server\""),
            Value::Text("redis-server".to_string())
        );
        assert_eq!(Value::coerce("'x'"), Value::Text("x".to_string()));
    }

    #[test]
    fn test_coerce_unparseable_preserved() {
        let raw = "[ [0] = 127, [1] = 0 ]";
        assert_eq!(Value::coerce(raw), Value::Text(raw.to_string()));
    }

    #[test]
    fn test_coerce_empty_is_null() {
        assert!(Value::coerce("").is_null());
        assert!(Value::coerce("   ").is_null());
    }

    #[test]
    fn test_value_views() {
        assert_eq!(Value::HexInteger(16).as_i64(), Some(16));
        assert_eq!(Value::HexInteger(u64::MAX).as_i64(), None);
        assert_eq!(Value::Float(2.5).as_i64(), None);
        assert_eq!(Value::Integer(3).as_f64(), Some(3.0));
        assert_eq!(Value::Text("a".into()).as_str(), Some("a"));
    }

    #[test]
    fn test_value_serializes_untagged() {
        let json = serde_json::to_string(&vec![
            Value::Integer(1),
            Value::Float(0.5),
            Value::HexInteger(255),
            Value::Text("a".into()),
            Value::Null,
        ])
        .unwrap();
        assert_eq!(json, r#"[1,0.5,255,"a",null]"#);
    }

    #[test]
    fn test_split_syscall_event() {
        assert_eq!(
            split_syscall_event("syscall_entry_openat"),
            Some((SyscallPhase::Entry, "openat"))
        );
        assert_eq!(
            split_syscall_event("syscall_exit_read"),
            Some((SyscallPhase::Exit, "read"))
        );
        assert_eq!(
            split_syscall_event("compat_syscall_exit_write"),
            Some((SyscallPhase::Exit, "write"))
        );
        assert_eq!(split_syscall_event("sched_switch"), None);
        assert_eq!(split_syscall_event("irq_handler_entry"), None);
        assert_eq!(split_syscall_event("syscall_entry_"), None);
    }

    #[test]
    fn test_coerce_groups_later_wins() {
        let groups = vec![
            vec![("cpu_id".to_string(), "0".to_string())],
            vec![
                ("fd".to_string(), "3".to_string()),
                ("cpu_id".to_string(), "2".to_string()),
            ],
        ];
        let fields = coerce_groups(&groups);
        assert_eq!(fields.get("cpu_id"), Some(&Value::Integer(2)));
        assert_eq!(fields.get("fd"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_new_event_has_sentinel_identity() {
        let event = KernelEvent::new(1.0, 0, "syscall_entry_read", BTreeMap::new());
        assert_eq!(event.pid, UNKNOWN_ID);
        assert_eq!(event.tid, UNKNOWN_ID);
        assert_eq!(event.process_name, UNKNOWN_PROCESS);
        assert!(!event.has_identity());
    }
}
