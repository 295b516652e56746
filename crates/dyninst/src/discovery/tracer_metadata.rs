#![forbid(unsafe_code)]

use crate::discovery::IntrospectError;
use crate::domain::{ProcessId, TracerMetadata};
use std::path::{Path, PathBuf};

/// Name prefix of the anonymous memory file a tracer publishes its metadata
/// in, as it appears in the target of `/proc/<pid>/fd/<n>`.
pub const MEMFD_NAME_PREFIX: &str = "/memfd:datadog-tracer-info-";

/// Reads [`TracerMetadata`] from the memfd a tracer library keeps open in
/// its own process.
#[derive(Debug, Clone)]
pub struct MemfdTracerMetadataReader {
    root: PathBuf,
}

impl MemfdTracerMetadataReader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn read(&self, pid: ProcessId) -> Result<TracerMetadata, IntrospectError> {
        let fd = self.find_memfd(pid)?.ok_or(IntrospectError::NotFound)?;
        let bytes = std::fs::read(fd)?;
        Ok(TracerMetadata::decode(&bytes)?)
    }

    /// Path of the fd entry whose link target names the tracer memfd.
    pub fn find_memfd(&self, pid: ProcessId) -> Result<Option<PathBuf>, IntrospectError> {
        let fd_dir = self.root.join(pid.to_string()).join("fd");
        for entry in std::fs::read_dir(&fd_dir)? {
            // Descriptors come and go while we look.
            let Ok(entry) = entry else {
                continue;
            };
            let Ok(target) = std::fs::read_link(entry.path()) else {
                continue;
            };
            if target
                .to_str()
                .is_some_and(|target| target.starts_with(MEMFD_NAME_PREFIX))
            {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}
