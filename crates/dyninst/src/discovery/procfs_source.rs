#![forbid(unsafe_code)]

use crate::discovery::{IntrospectError, MemfdTracerMetadataReader, ProcessSource};
use crate::domain::{Executable, FileKey, ProcessId, Ticks, TracerMetadata};
use procfs::process::Process;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use tracing::trace;

/// [`ProcessSource`] backed by a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
    metadata: MemfdTracerMetadataReader,
}

impl ProcfsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            metadata: MemfdTracerMetadataReader::new(&root),
            root,
        }
    }

    fn pid_dir(&self, pid: ProcessId) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn process(&self, pid: ProcessId) -> Result<Process, IntrospectError> {
        Ok(Process::new_with_root(self.pid_dir(pid))?)
    }

    /// Open the executable, first by the path the process sees and then
    /// through the process's root directory, which is what works when the
    /// process runs in a different mount namespace.
    fn open_executable(&self, pid: ProcessId, exe: PathBuf) -> Result<(PathBuf, File), io::Error> {
        let err = match File::open(&exe) {
            Ok(file) => return Ok((exe, file)),
            Err(err) => err,
        };
        if !matches!(
            err.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
        ) {
            return Err(err);
        }
        let relative = exe.strip_prefix("/").unwrap_or(&exe);
        if relative.as_os_str().is_empty() {
            return Err(err);
        }
        let through_root = self.pid_dir(pid).join("root").join(relative);
        trace!(%pid, path = ?through_root, "opening executable through process root");
        let file = File::open(&through_root)?;
        Ok((through_root, file))
    }
}

impl ProcessSource for ProcfsSource {
    fn list_pids(&self) -> Box<dyn Iterator<Item = Result<ProcessId, IntrospectError>> + '_> {
        let processes = match procfs::process::all_processes_with_root(&self.root) {
            Ok(processes) => processes,
            Err(err) => return Box::new(std::iter::once(Err(err.into()))),
        };
        Box::new(processes.filter_map(|process| match process {
            Ok(process) => Some(Ok(ProcessId(process.pid as u32))),
            Err(err) => {
                // Entries vanish between readdir and open.
                let err = IntrospectError::from(err);
                if err.is_expected() { None } else { Some(Err(err)) }
            }
        }))
    }

    fn read_start_time(&self, pid: ProcessId) -> Result<Ticks, IntrospectError> {
        let stat = self.process(pid)?.stat()?;
        Ok(Ticks(stat.starttime))
    }

    fn read_tracer_metadata(&self, pid: ProcessId) -> Result<TracerMetadata, IntrospectError> {
        self.metadata.read(pid)
    }

    fn resolve_executable(&self, pid: ProcessId) -> Result<Executable, IntrospectError> {
        let exe = self.process(pid)?.exe()?;
        let (path, file) = self.open_executable(pid, exe)?;
        let metadata = file.metadata()?;
        Ok(Executable {
            path,
            key: FileKey {
                dev: metadata.dev(),
                ino: metadata.ino(),
                mtime_sec: metadata.mtime(),
                mtime_nsec: metadata.mtime_nsec(),
            },
        })
    }
}
