// Temporal File Descriptor Resolution
//
// Descriptor numbers are reused by the kernel across open/close cycles, so a
// plain fd -> path table misattributes any event that happened before the
// number was reused. This module keeps, per (pid, fd), the ordered list of
// intervals during which the descriptor named a given file or socket, and
// answers "what did fd F mean for process P at time T".
//
// Intervals come from paired open/socket/close syscalls and, optionally, from
// an lsof snapshot taken just before tracing started (seeded at t = 0.0).

mod map;
mod snapshot;

pub use map::{
    placeholder, socket_id, DescriptorInterval, DescriptorKind, DescriptorMap, ResolutionStats,
};
pub use snapshot::DescriptorSnapshot;
