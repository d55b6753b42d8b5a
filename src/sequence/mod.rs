// Syscall Sequence Grouping
//
// Individual paired syscalls are too fine-grained to be useful graph nodes:
// a process reading a file in 4 KiB chunks produces hundreds of reads that
// are really one operation. This module clusters them into EventSequence
// records using a configurable rule table.
//
// Each rule names the syscalls it covers, the key a batch must share (thread,
// descriptor, ...), the largest inter-call gap still counted as the same
// operation, and whether every call stands alone ("immediate"). Descriptor
// keys are resolved per call through the temporal descriptor map, so a batch
// never spans two different files that happened to reuse one fd number.

mod grouper;
mod rules;

pub use grouper::{output_order, EventSequence, SequenceEvent, SequenceGrouper, DEFAULT_KEY_PARAMS};
pub use rules::{GroupKeyField, GroupingRule, RuleSet, TargetKind};
