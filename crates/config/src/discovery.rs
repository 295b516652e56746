use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Discovery {
    /// Root of the procfs mount to scan. Point this at the host's procfs when
    /// running inside a container, e.g. `/host/proc`.
    pub procfs_root: PathBuf,

    /// How long a process must have been alive before it is analyzed.
    /// **Measured in milliseconds**.
    ///
    /// ## Note
    ///
    /// Processes that exit before this delay elapses are never analyzed. A
    /// delay that is too short risks inspecting a runtime before it has
    /// published its tracer metadata.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub start_delay: Duration,

    /// Interval between scans of the process table. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub scan_interval: Duration,

    /// Only processes whose tracer reports this language are discovered.
    pub tracer_language: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            procfs_root: PathBuf::from("/proc"),
            start_delay: Duration::from_secs(2),
            scan_interval: Duration::from_secs(1),
            tracer_language: "go".to_owned(),
        }
    }
}
