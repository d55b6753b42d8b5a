//! Error types for trace ingestion
//!
//! Only conditions that stop a run are errors. Malformed lines, missing
//! identity, unmatched syscalls and unresolved descriptors are quality
//! signals and are reported through [`crate::stats::TraceSummary`] instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading inputs or configuration
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid descriptor snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Failed to serialize {file}: {source}")]
    Serialize {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid grouping rule '{operation}': {reason}")]
    InvalidRule { operation: String, reason: String },

    #[error("Duplicate grouping rule '{0}'")]
    DuplicateRule(String),

    #[error("Invalid trace line pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;
