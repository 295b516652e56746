#![forbid(unsafe_code)]

use crate::clock::{BootTimeClock, TickClock};
use crate::discovery::{IntrospectError, ProcessSource, ProcfsSource};
use crate::domain::{DiscoveredProcess, ProcessId, Ticks};
use crate::error::Error;
use crate::ratelimit::{LogLimiter, TokenBucket};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Result of one pass over the process table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Processes that became eligible since the previous scan.
    pub discovered: Vec<DiscoveredProcess>,
    /// Previously discovered processes that are gone, in ascending PID order.
    pub removed: Vec<ProcessId>,
}

/// Finds processes to instrument by repeatedly polling the process table.
///
/// Each scan considers the processes whose start time falls in
/// `[last_watermark, now - start_delay]` and then advances the watermark to
/// the upper bound. Consecutive windows are contiguous, so every process that
/// stays alive for at least `start_delay` is analyzed in exactly one scan.
/// Processes that exit sooner are never analyzed, and processes that were
/// already running before the first window are never analyzed
/// retroactively.
///
/// A scanner is driven from one task at a time; [`Scanner::scan`] takes
/// `&mut self` and holds no locks. A scan abandoned half-way (for example by
/// a caller-side timeout) leaves the scanner unchanged.
pub struct Scanner {
    start_delay: Ticks,
    last_watermark: Ticks,
    tracer_language: String,
    live: BTreeSet<ProcessId>,
    clock: Box<dyn TickClock>,
    source: Box<dyn ProcessSource>,
    log_limiter: Box<dyn LogLimiter>,
}

impl Scanner {
    /// Scanner over the configured procfs root, using the boot-time clock.
    pub fn new(config: &config::Discovery) -> Self {
        let clock = BootTimeClock::new();
        let start_delay = Ticks::from_duration(config.start_delay, clock.clk_tck());
        Self::with_parts(
            start_delay,
            config.tracer_language.clone(),
            Box::new(clock),
            Box::new(ProcfsSource::new(&config.procfs_root)),
        )
    }

    pub fn with_parts(
        start_delay: Ticks,
        tracer_language: impl Into<String>,
        clock: Box<dyn TickClock>,
        source: Box<dyn ProcessSource>,
    ) -> Self {
        Self {
            start_delay,
            last_watermark: Ticks::ZERO,
            tracer_language: tracer_language.into(),
            live: BTreeSet::new(),
            clock,
            source,
            log_limiter: Box::new(TokenBucket::new(Duration::from_secs(600), 10)),
        }
    }

    pub fn with_log_limiter(mut self, limiter: Box<dyn LogLimiter>) -> Self {
        self.log_limiter = limiter;
        self
    }

    /// Upper bound of the last committed scan window.
    pub fn watermark(&self) -> Ticks {
        self.last_watermark
    }

    /// Processes currently considered discovered and alive.
    pub fn live(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.live.iter().copied()
    }

    /// Discover new processes and detect exited ones since the last scan.
    ///
    /// Fails only when the clock cannot be read or the process table cannot
    /// be enumerated. In that case no state is changed and the next call
    /// covers the same window again.
    pub fn scan(&mut self) -> Result<ScanReport, Error> {
        let now = self.clock.now_ticks()?;

        // Right after boot, or when the clock went backwards, fall back to now.
        let next_watermark = match now.checked_sub(self.start_delay) {
            Some(watermark) if watermark >= self.last_watermark => watermark,
            _ => now,
        };

        let mut no_longer_live = self.live.clone();
        let mut fresh = BTreeSet::new();
        let mut discovered = Vec::new();

        for pid in self.source.list_pids() {
            let pid = pid.map_err(Error::ListProcesses)?;

            if no_longer_live.remove(&pid) || self.live.contains(&pid) || fresh.contains(&pid) {
                continue;
            }

            let start_time = match self.source.read_start_time(pid) {
                Ok(start_time) => start_time,
                Err(err) => {
                    report(self.log_limiter.as_mut(), pid, "read start time", &err);
                    continue;
                }
            };
            // Too young: picked up by a later window. Too old: predates the
            // first window and is left alone.
            if start_time < self.last_watermark || start_time > next_watermark {
                continue;
            }

            let tracer = match self.source.read_tracer_metadata(pid) {
                Ok(tracer) => tracer,
                Err(err) => {
                    trace!(%pid, %err, "no tracer metadata");
                    continue;
                }
            };
            if tracer.tracer_language != self.tracer_language {
                trace!(%pid, language = %tracer.tracer_language, "unsupported tracer language");
                continue;
            }

            let executable = match self.source.resolve_executable(pid) {
                Ok(executable) => executable,
                Err(err) => {
                    report(self.log_limiter.as_mut(), pid, "resolve executable", &err);
                    continue;
                }
            };

            fresh.insert(pid);
            discovered.push(DiscoveredProcess {
                pid,
                start_time,
                tracer,
                executable,
            });
        }

        for pid in &no_longer_live {
            self.live.remove(pid);
        }
        self.live.extend(fresh);
        self.last_watermark = next_watermark;

        let removed: Vec<ProcessId> = no_longer_live.into_iter().collect();
        if !discovered.is_empty() || !removed.is_empty() {
            debug!(
                discovered = discovered.len(),
                removed = removed.len(),
                live = self.live.len(),
                watermark = %next_watermark,
                "scan complete"
            );
        }
        Ok(ScanReport {
            discovered,
            removed,
        })
    }
}

fn report(limiter: &mut dyn LogLimiter, pid: ProcessId, what: &str, err: &IntrospectError) {
    if err.is_expected() {
        return;
    }
    if limiter.allow() {
        warn!(%pid, %err, "scanner: {what}");
    } else {
        trace!(%pid, %err, "scanner: {what}");
    }
}
