#![forbid(unsafe_code)]

mod ids;
mod process;
mod tracer;

pub use ids::{ProcessId, Ticks};
pub use process::{DiscoveredProcess, Executable, FileKey};
pub use tracer::TracerMetadata;
