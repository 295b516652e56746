#![forbid(unsafe_code)]

use crate::discovery::IntrospectError;

/// Failures that invalidate a whole operation. Per-process and per-item
/// failures are absorbed and logged where they happen instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read clock: {0}")]
    Clock(#[source] std::io::Error),

    #[error("failed to list processes: {0}")]
    ListProcesses(#[source] IntrospectError),
}
