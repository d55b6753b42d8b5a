//! Tracelift - LTTng kernel trace text to a time-ordered system model
//!
//! This library turns babeltrace text output into resolved kernel events,
//! long-lived entities (processes, threads, files, sockets, CPUs) and
//! batched syscall sequences, with time-aware descriptor resolution and
//! per-run data-quality statistics.

pub mod cli;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod entities;
pub mod error;
pub mod event;
pub mod json_output;
pub mod pairing;
pub mod pipeline;
pub mod sequence;
pub mod stats;
pub mod tokenizer;

pub use error::{Result, TraceError};
pub use pipeline::{parse, PipelineConfig, TraceModel, TraceParser};
