//! JSON output for a parsed trace
//!
//! One pretty-printed array per entity kind plus the sequence list and the
//! summary, written into an output directory:
//!
//! ```text
//! out/
//!   processes.json  threads.json  files.json  sockets.json  cpus.json
//!   event_sequences.json  summary.json  [events.json]
//! ```

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, TraceError};
use crate::pipeline::TraceModel;

pub const PROCESSES_FILE: &str = "processes.json";
pub const THREADS_FILE: &str = "threads.json";
pub const FILES_FILE: &str = "files.json";
pub const SOCKETS_FILE: &str = "sockets.json";
pub const CPUS_FILE: &str = "cpus.json";
pub const SEQUENCES_FILE: &str = "event_sequences.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const EVENTS_FILE: &str = "events.json";

/// Writes a [`TraceModel`] as a directory of JSON documents
#[derive(Debug, Clone)]
pub struct JsonOutput {
    dir: PathBuf,
    emit_events: bool,
}

impl JsonOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            emit_events: false,
        }
    }

    /// Also write the full resolved event list (large)
    pub fn with_events(mut self, emit_events: bool) -> Self {
        self.emit_events = emit_events;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write every document, returning the paths written
    pub fn write(&self, model: &TraceModel) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir)?;

        let entities = &model.entities;
        let mut written = vec![
            self.write_file(PROCESSES_FILE, &entities.processes)?,
            self.write_file(THREADS_FILE, &entities.threads)?,
            self.write_file(FILES_FILE, &entities.files)?,
            self.write_file(SOCKETS_FILE, &entities.sockets)?,
            self.write_file(CPUS_FILE, &entities.cpus)?,
            self.write_file(SEQUENCES_FILE, &model.sequences)?,
            self.write_file(SUMMARY_FILE, &model.summary)?,
        ];
        if self.emit_events {
            written.push(self.write_file(EVENTS_FILE, &model.events)?);
        }
        Ok(written)
    }

    fn write_file<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let json = to_json(name, value)?;
        fs::write(&path, json)?;
        debug!(path = %path.display(), "Wrote output file");
        Ok(path)
    }
}

/// Pretty-print one output document
pub fn to_json<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|source| TraceError::Serialize {
        file: name.to_string(),
        source,
    })
}
