#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

/// OS process identifier. PIDs are reused, so identity across time is always
/// established together with the process start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

/// Clock ticks (`CLK_TCK`) elapsed since boot. This is the unit the kernel
/// reports process start times in, and it does not follow wall-clock
/// adjustments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    pub fn from_duration(duration: Duration, clk_tck: u64) -> Self {
        Self::from_nanos(duration.as_nanos(), clk_tck)
    }

    pub fn from_nanos(nanos: u128, clk_tck: u64) -> Self {
        let ticks = nanos.saturating_mul(u128::from(clk_tck)) / 1_000_000_000;
        Self(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    pub fn checked_sub(self, rhs: Ticks) -> Option<Ticks> {
        self.0.checked_sub(rhs.0).map(Ticks)
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
