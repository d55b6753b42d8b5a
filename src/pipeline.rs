//! End-to-end trace processing
//!
//! One sequential pass over the input drives every stage:
//!
//! ```text
//! line -> tokenizer -> coercer -> context resolver -> pairer -> descriptor map
//!                                        |                \-> latency stats
//!                                        \-> entity builder
//! ```
//!
//! Sequences are grouped after the pass, once the descriptor map holds every
//! interval. With `prescan_context` an extra pass over the input first
//! collects authoritative tid -> pid facts.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

use crate::context::{ContextResolver, PidHints};
use crate::descriptor::{DescriptorMap, DescriptorSnapshot};
use crate::entities::{Entities, EntityBuilder};
use crate::error::{Result, TraceError};
use crate::event::{coerce_groups, KernelEvent};
use crate::pairing::{PairedSyscall, SyscallPairer};
use crate::sequence::{EventSequence, RuleSet, SequenceGrouper, DEFAULT_KEY_PARAMS};
use crate::stats::{IngestStats, MonotonicCheck, StatsTracker, SummaryInputs, TraceSummary};
use crate::tokenizer::{is_ignorable, LineTokenizer};

/// Pipeline settings
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Run a context pre-scan pass before the main pass
    pub prescan_context: bool,
    /// Entry arguments kept in each sequence's `event_stream`
    pub key_params: Vec<String>,
    pub rules: RuleSet,
}

impl PipelineConfig {
    /// Single pass, default key parameters and the built-in rule table
    pub fn with_default_rules() -> Result<Self> {
        Ok(Self {
            prescan_context: false,
            key_params: DEFAULT_KEY_PARAMS.iter().map(|s| s.to_string()).collect(),
            rules: RuleSet::default_rules()?,
        })
    }
}

/// Everything derived from one trace
#[derive(Debug, Clone, Serialize)]
pub struct TraceModel {
    pub events: Vec<KernelEvent>,
    pub entities: Entities,
    pub sequences: Vec<EventSequence>,
    pub summary: TraceSummary,
}

/// Parse a trace file with the built-in pipeline settings
///
/// `rules` extends the built-in rule table: a rule whose operation matches a
/// built-in one replaces it, any other rule is appended.
///
/// # Example
/// ```no_run
/// let model = tracelift::parse("trace.txt", None, None)?;
/// println!("{} sequences", model.sequences.len());
/// # Ok::<(), tracelift::TraceError>(())
/// ```
pub fn parse(
    trace_path: impl AsRef<Path>,
    snapshot: Option<&DescriptorSnapshot>,
    rules: Option<&RuleSet>,
) -> Result<TraceModel> {
    let mut config = PipelineConfig::with_default_rules()?;
    if let Some(rules) = rules {
        config.rules = config.rules.with_overrides(rules.rules().to_vec())?;
    }
    TraceParser::new(config)?.parse_file(trace_path, snapshot)
}

/// Reusable pipeline with fixed settings
#[derive(Debug, Clone)]
pub struct TraceParser {
    config: PipelineConfig,
    tokenizer: LineTokenizer,
}

impl TraceParser {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Ok(Self {
            config,
            tokenizer: LineTokenizer::new()?,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn parse_file(
        &self,
        trace_path: impl AsRef<Path>,
        snapshot: Option<&DescriptorSnapshot>,
    ) -> Result<TraceModel> {
        let path = trace_path.as_ref();
        info!(path = %path.display(), prescan = self.config.prescan_context, "Parsing trace");

        let hints = if self.config.prescan_context {
            self.prescan(open_trace(path)?)
                .map_err(|source| read_error(path, source))?
        } else {
            PidHints::new()
        };
        self.run(open_trace(path)?, hints, snapshot)
            .map_err(|source| read_error(path, source))
    }

    pub fn parse_str(&self, content: &str, snapshot: Option<&DescriptorSnapshot>) -> Result<TraceModel> {
        let hints = if self.config.prescan_context {
            self.prescan(content.as_bytes())?
        } else {
            PidHints::new()
        };
        Ok(self.run(content.as_bytes(), hints, snapshot)?)
    }

    /// Collect tid -> pid facts without resolving anything
    fn prescan<R: BufRead>(&self, reader: R) -> std::io::Result<PidHints> {
        let mut hints = PidHints::new();
        for_each_line(reader, |line| {
            if let Some(tok) = self.tokenizer.tokenize(line) {
                let event = KernelEvent::new(tok.timestamp, tok.cpu_id, tok.event_name, coerce_groups(&tok.groups));
                hints.observe(&event);
            }
        })?;
        debug!(hints = hints.len(), "Context pre-scan complete");
        Ok(hints)
    }

    fn run<R: BufRead>(
        &self,
        reader: R,
        hints: PidHints,
        snapshot: Option<&DescriptorSnapshot>,
    ) -> std::io::Result<TraceModel> {
        let mut pass = Pass::new(hints);
        if let Some(snapshot) = snapshot {
            snapshot.seed_into(&mut pass.descriptors);
        }

        for_each_line(reader, |line| pass.line(&self.tokenizer, line))?;
        Ok(self.finish(pass))
    }

    fn finish(&self, pass: Pass) -> TraceModel {
        let Pass {
            mut ingest,
            monotonic: _,
            resolver,
            pairer,
            mut descriptors,
            entities,
            latency,
            events,
            pairs,
            event_types,
            bounds,
        } = pass;

        let entities = entities.finish(&mut descriptors);
        let grouper = SequenceGrouper::new(self.config.key_params.clone());
        let sequences = grouper.build(&pairs, &descriptors, &self.config.rules);

        ingest.parsed_events = events.len() as u64;
        let summary = TraceSummary::build(SummaryInputs {
            ingest: &ingest,
            time_bounds: bounds,
            event_types: &event_types,
            context: resolver.stats(),
            pairing: pairer.stats(),
            pending_at_end: pairer.pending_count(),
            descriptors: descriptors.stats(),
            latency: &latency,
            sequences: &sequences,
            entities: &entities,
        });

        info!(
            lines = summary.total_lines,
            events = summary.total_events,
            parse_errors = summary.parse_errors,
            pairs = pairs.len(),
            sequences = sequences.len(),
            "Trace parsed"
        );

        TraceModel {
            events,
            entities,
            sequences,
            summary,
        }
    }
}

/// State owned by one processing pass
struct Pass {
    ingest: IngestStats,
    monotonic: MonotonicCheck,
    resolver: ContextResolver,
    pairer: SyscallPairer,
    descriptors: DescriptorMap,
    entities: EntityBuilder,
    latency: StatsTracker,
    events: Vec<KernelEvent>,
    pairs: Vec<PairedSyscall>,
    event_types: BTreeMap<String, u64>,
    bounds: Option<(f64, f64)>,
}

impl Pass {
    fn new(hints: PidHints) -> Self {
        Self {
            ingest: IngestStats::default(),
            monotonic: MonotonicCheck::default(),
            resolver: ContextResolver::with_hints(hints),
            pairer: SyscallPairer::new(),
            descriptors: DescriptorMap::new(),
            entities: EntityBuilder::new(),
            latency: StatsTracker::new(),
            events: Vec::new(),
            pairs: Vec::new(),
            event_types: BTreeMap::new(),
            bounds: None,
        }
    }

    fn line(&mut self, tokenizer: &LineTokenizer, line: &str) {
        self.ingest.total_lines += 1;
        if is_ignorable(line) {
            self.ingest.ignored_lines += 1;
            return;
        }
        let Some(tok) = tokenizer.tokenize(line) else {
            self.ingest.parse_errors += 1;
            debug!(line = self.ingest.total_lines, "Unparseable trace line");
            return;
        };

        if self.monotonic.observe(tok.cpu_id, tok.timestamp) {
            self.ingest.monotonic_violations += 1;
        }
        self.bounds = Some(match self.bounds {
            Some((lo, hi)) => (lo.min(tok.timestamp), hi.max(tok.timestamp)),
            None => (tok.timestamp, tok.timestamp),
        });

        let mut event = KernelEvent::new(tok.timestamp, tok.cpu_id, tok.event_name, coerce_groups(&tok.groups));
        self.resolver.resolve(&mut event);
        *self.event_types.entry(event.event_type.clone()).or_default() += 1;

        self.entities.observe(&event);
        if let Some(pair) = self.pairer.observe(&event) {
            self.descriptors.apply(&pair);
            self.entities.observe_pair(&pair);
            self.latency.record_pair(&pair);
            self.pairs.push(pair);
        }
        self.events.push(event);
    }
}

fn open_trace(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| read_error(path, source))
}

fn read_error(path: &Path, source: std::io::Error) -> TraceError {
    TraceError::Read {
        path: path.to_path_buf(),
        source,
    }
}

/// Call `f` for every line, decoding invalid UTF-8 lossily
fn for_each_line<R: BufRead>(mut reader: R, mut f: impl FnMut(&str)) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        f(line.trim_end_matches(['\n', '\r']));
    }
}
