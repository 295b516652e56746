#![forbid(unsafe_code)]

//! Coalescing of the configuration fragments tracers report for each
//! process into one update per quiet period.

mod debouncer;
mod probe;

pub use debouncer::{ConfigFragment, Debouncer, ProcessUpdate};
pub use probe::{JsonProbeParser, ProbeDefinition, ProbeKind, ProbeParseError, ProbeParser};
