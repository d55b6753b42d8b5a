//! TOML configuration
//!
//! ```toml
//! [pipeline]
//! prescan_context = true
//! key_params = ["fd", "count", "buf", "flags", "offset"]
//!
//! [[rule]]
//! operation = "read"
//! syscalls = ["read", "pread64"]
//! group_by = ["tid", "fd"]
//! time_gap_ms = 20
//! ```
//!
//! Every section is optional. `[[rule]]` entries override built-in rules of
//! the same operation name and append new ones.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TraceError};
use crate::pipeline::PipelineConfig;
use crate::sequence::{GroupingRule, RuleSet, DEFAULT_KEY_PARAMS};

fn default_key_params() -> Vec<String> {
    DEFAULT_KEY_PARAMS.iter().map(|s| s.to_string()).collect()
}

/// `[pipeline]` section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    /// Run a first pass collecting tid -> pid facts before the main pass
    #[serde(default)]
    pub prescan_context: bool,

    /// Entry arguments copied into each sequence's `event_stream`
    #[serde(default = "default_key_params")]
    pub key_params: Vec<String>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            prescan_context: false,
            key_params: default_key_params(),
        }
    }
}

/// Parsed configuration file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub rule: Vec<GroupingRule>,
}

impl TraceConfig {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| TraceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            rules = config.rule.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Built-in rules with this file's `[[rule]]` entries applied
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::default_rules()?.with_overrides(self.rule.clone())
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        Ok(PipelineConfig {
            prescan_context: self.pipeline.prescan_context,
            key_params: self.pipeline.key_params.clone(),
            rules: self.rule_set()?,
        })
    }
}
