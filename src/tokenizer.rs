//! Line tokenizer for babeltrace-style LTTng text output
//!
//! Turns one line like
//!
//! ```text
//! [18:59:58.921449123] (+0.000000234) host syscall_entry_read: { cpu_id = 0 }, { fd = 3, count = 4096 }
//! ```
//!
//! into a timestamp, CPU, event name and the ordered `{ ... }` field groups.
//! The tokenizer has no knowledge of what events mean.

use regex::Regex;

use crate::error::Result;

/// Raw `key = value` pairs of one `{ ... }` group, in line order
pub type FieldGroup = Vec<(String, String)>;

const LINE_PATTERN: &str = concat!(
    r"^\[(\d{2}:\d{2}:\d{2}(?:\.\d+)?)\]\s+",     // timestamp
    r"(?:\([^)]*\)\s+)?",                          // optional delta
    r"(\S+)\s+",                                   // hostname
    r"(\S+):\s*",                                  // event name
    r"(.*)$",                                      // field groups
);

/// One successfully tokenized trace line
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizedLine {
    /// Seconds since midnight
    pub timestamp: f64,
    /// CPU from the `cpu_id` context field, or -1
    pub cpu_id: i32,
    pub hostname: String,
    pub event_name: String,
    pub groups: Vec<FieldGroup>,
}

/// Compiled trace line grammar
#[derive(Debug, Clone)]
pub struct LineTokenizer {
    pattern: Regex,
}

impl LineTokenizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(LINE_PATTERN)?,
        })
    }

    /// Tokenize one line
    ///
    /// Returns `None` for blank lines, `#` comments and lines that do not
    /// match the grammar. Use [`is_ignorable`] to tell the first two apart
    /// from malformed input.
    pub fn tokenize(&self, line: &str) -> Option<TokenizedLine> {
        let line = line.trim();
        if is_ignorable(line) {
            return None;
        }

        let caps = self.pattern.captures(line)?;
        let timestamp = seconds_since_midnight(&caps[1])?;
        let groups = field_groups(&caps[4]);

        let cpu_id = groups
            .iter()
            .flatten()
            .find(|(key, _)| key == "cpu_id")
            .and_then(|(_, value)| value.parse::<i32>().ok())
            .unwrap_or(-1);

        Some(TokenizedLine {
            timestamp,
            cpu_id,
            hostname: caps[2].to_string(),
            event_name: caps[3].to_string(),
            groups,
        })
    }
}

/// Blank lines and `#` comments carry no event and are not parse errors
pub fn is_ignorable(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with('#')
}

/// Convert `HH:MM:SS.fraction` into seconds since midnight
///
/// Returns `None` for malformed fields or an hour count that overflows.
pub fn seconds_since_midnight(stamp: &str) -> Option<f64> {
    let mut parts = stamp.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
    Some(whole as f64 + seconds)
}

/// Extract every top-level `{ ... }` group from the event body
///
/// Quoted strings and nested `{}`/`[]` values are kept intact. A group left
/// open by a truncated line is still returned with whatever it contains.
fn field_groups(body: &str) -> Vec<FieldGroup> {
    let mut groups = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = None;

    for (i, c) in body.char_indices() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '{' => {
                if depth == 0 {
                    start = Some(i + 1);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        groups.push(key_value_pairs(&body[s..i]));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(s) = start {
        groups.push(key_value_pairs(&body[s..]));
    }
    groups
}

fn key_value_pairs(content: &str) -> FieldGroup {
    split_top_level(content)
        .into_iter()
        .filter_map(|item| {
            let (key, value) = item.split_once('=')?;
            let key = key.trim();
            let valid = !key.is_empty()
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            valid.then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Split on commas that are not inside quotes, braces or brackets
fn split_top_level(content: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in content.char_indices() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(&content[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&content[start..]);
    items
}
