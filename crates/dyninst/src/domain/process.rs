#![forbid(unsafe_code)]

use crate::domain::{ProcessId, Ticks, TracerMetadata};
use std::path::PathBuf;

/// Identity of an executable file, used to notice when the binary behind a
/// path has been replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Executable {
    /// Path the executable was opened through. This may be rewritten to go
    /// through `<procfs>/<pid>/root` when the process lives in another mount
    /// namespace.
    pub path: PathBuf,
    pub key: FileKey,
}

/// A process that became eligible for instrumentation during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredProcess {
    pub pid: ProcessId,
    pub start_time: Ticks,
    pub tracer: TracerMetadata,
    pub executable: Executable,
}
