#![forbid(unsafe_code)]

mod procfs_source;
mod scanner;
mod tracer_metadata;

pub use procfs_source::ProcfsSource;
pub use scanner::{ScanReport, Scanner};
pub use tracer_metadata::{MEMFD_NAME_PREFIX, MemfdTracerMetadataReader};

use crate::domain::{Executable, ProcessId, Ticks, TracerMetadata};
use nix::errno::Errno;
use std::io;

/// Enumeration and per-process introspection of the process table.
pub trait ProcessSource: Send {
    /// Lazily enumerate the PIDs currently present. Every call starts a new,
    /// finite pass over the table.
    fn list_pids(&self) -> Box<dyn Iterator<Item = Result<ProcessId, IntrospectError>> + '_>;

    fn read_start_time(&self, pid: ProcessId) -> Result<Ticks, IntrospectError>;

    fn read_tracer_metadata(&self, pid: ProcessId) -> Result<TracerMetadata, IntrospectError>;

    fn resolve_executable(&self, pid: ProcessId) -> Result<Executable, IntrospectError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IntrospectError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("no such process")]
    NoSuchProcess,

    #[error("invalid tracer metadata: {0}")]
    Metadata(#[from] rmp_serde::decode::Error),

    #[error(transparent)]
    Io(io::Error),

    #[error("{0}")]
    Other(String),
}

impl IntrospectError {
    /// Errors that routinely happen while a process exits or when the agent
    /// lacks access to it. These are not worth reporting.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::PermissionDenied | Self::NoSuchProcess
        )
    }
}

impl From<io::Error> for IntrospectError {
    fn from(err: io::Error) -> Self {
        if err.raw_os_error() == Some(Errno::ESRCH as i32) {
            return Self::NoSuchProcess;
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

impl From<procfs::ProcError> for IntrospectError {
    fn from(err: procfs::ProcError) -> Self {
        match err {
            procfs::ProcError::NotFound(_) => Self::NotFound,
            procfs::ProcError::PermissionDenied(_) => Self::PermissionDenied,
            procfs::ProcError::Io(err, _) => err.into(),
            other => Self::Other(other.to_string()),
        }
    }
}
