#![forbid(unsafe_code)]

use crate::domain::Ticks;
use crate::error::Error;
use nix::time::{ClockId, clock_gettime};

pub trait TickClock: Send {
    /// Current time in clock ticks since boot.
    fn now_ticks(&self) -> Result<Ticks, Error>;
}

/// Reads `CLOCK_BOOTTIME`, the clock process start times are measured
/// against.
#[derive(Debug, Clone, Copy)]
pub struct BootTimeClock {
    clk_tck: u64,
}

impl BootTimeClock {
    pub fn new() -> Self {
        Self {
            clk_tck: procfs::ticks_per_second(),
        }
    }

    pub fn clk_tck(&self) -> u64 {
        self.clk_tck
    }
}

impl Default for BootTimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for BootTimeClock {
    fn now_ticks(&self) -> Result<Ticks, Error> {
        let now = clock_gettime(ClockId::CLOCK_BOOTTIME)
            .map_err(|errno| Error::Clock(errno.into()))?;
        let nanos = u128::try_from(now.tv_sec()).unwrap_or(0) * 1_000_000_000
            + u128::try_from(now.tv_nsec()).unwrap_or(0);
        Ok(Ticks::from_nanos(nanos, self.clk_tck))
    }
}
