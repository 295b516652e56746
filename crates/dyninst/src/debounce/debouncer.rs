#![forbid(unsafe_code)]

use crate::debounce::{JsonProbeParser, ProbeDefinition, ProbeParseError, ProbeParser};
use crate::domain::{DiscoveredProcess, ProcessId};
use crate::ratelimit::{LogLimiter, TokenBucket};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One configuration blob observed for a process. Blobs arrive out of order,
/// possibly duplicated, and without any marker for the end of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFragment {
    pub config_path: String,
    pub config_content: String,
    pub runtime_id: String,
}

/// Coalesced result for one process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessUpdate {
    pub process: DiscoveredProcess,
    /// Sorted and deduplicated by probe identity.
    pub probes: Vec<ProbeDefinition>,
    pub runtime_id: String,
    pub should_upload_symdb: bool,
}

#[derive(Debug)]
struct DebouncerProcess {
    process: DiscoveredProcess,
    runtime_id: Option<String>,
    last_updated: Option<Instant>,
    fragments: Vec<ConfigFragment>,
    symdb_enabled: bool,
}

impl DebouncerProcess {
    fn new(process: DiscoveredProcess) -> Self {
        Self {
            process,
            runtime_id: None,
            last_updated: None,
            fragments: Vec::new(),
            symdb_enabled: false,
        }
    }

    /// Record activity under `runtime_id`. Returns the previous runtime id
    /// when it differs, in which case pending fragments belong to another
    /// incarnation and have been discarded.
    fn touch(&mut self, now: Instant, runtime_id: &str) -> Option<String> {
        self.last_updated = Some(now);
        let previous = match self.runtime_id.as_deref() {
            Some(previous) if previous != runtime_id => {
                self.fragments.clear();
                Some(previous.to_owned())
            }
            Some(_) => return None,
            None => None,
        };
        self.runtime_id = Some(runtime_id.to_owned());
        previous
    }
}

/// Turns the stream of configuration fragments for each tracked process into
/// one update once the process has been quiet for the idle period.
///
/// Callers serialize all calls; there is no internal locking.
pub struct Debouncer {
    idle_period: Duration,
    processes: FxHashMap<ProcessId, DebouncerProcess>,
    parser: Box<dyn ProbeParser>,
    log_limiter: Box<dyn LogLimiter>,
}

impl Debouncer {
    pub fn new(config: &config::Debounce) -> Self {
        Self {
            idle_period: config.idle_period,
            processes: FxHashMap::default(),
            parser: Box::new(JsonProbeParser),
            log_limiter: Box::new(TokenBucket::new(Duration::from_secs(60), 10)),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ProbeParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_log_limiter(mut self, limiter: Box<dyn LogLimiter>) -> Self {
        self.log_limiter = limiter;
        self
    }

    pub fn idle_period(&self) -> Duration {
        self.idle_period
    }

    /// Start tracking a process. Tracking the same pid again replaces any
    /// state kept for the previous incarnation.
    pub fn track(&mut self, process: DiscoveredProcess) {
        trace!(pid = %process.pid, "tracking process");
        self.processes.insert(process.pid, DebouncerProcess::new(process));
    }

    pub fn untrack(&mut self, pid: ProcessId) {
        if self.processes.remove(&pid).is_some() {
            trace!(%pid, "untracked process");
        }
    }

    pub fn is_tracked(&self, pid: ProcessId) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn add_in_flight(&mut self, now: Instant, pid: ProcessId, fragment: ConfigFragment) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if let Some(previous) = process.touch(now, &fragment.runtime_id) {
            runtime_id_changed(
                self.log_limiter.as_mut(),
                pid,
                &previous,
                &fragment.runtime_id,
            );
        }
        // Empty content still counts as activity: it is how a process with
        // no probes reports in.
        if fragment.config_content.is_empty() {
            return;
        }
        trace!(%pid, path = %fragment.config_path, "got config fragment");
        process.fragments.push(fragment);
    }

    pub fn add_symdb_enabled(
        &mut self,
        now: Instant,
        pid: ProcessId,
        runtime_id: &str,
        enabled: bool,
    ) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if let Some(previous) = process.touch(now, runtime_id) {
            runtime_id_changed(self.log_limiter.as_mut(), pid, &previous, runtime_id);
        }
        trace!(%pid, enabled, "symdb flag updated");
        process.symdb_enabled = enabled;
    }

    /// Emit an update for every process that has been updated since the last
    /// coalesce and has been idle for at least the idle period. Updates are
    /// sorted by pid.
    pub fn coalesce(&mut self, now: Instant) -> Vec<ProcessUpdate> {
        let mut updates = Vec::new();
        for (&pid, process) in &mut self.processes {
            let Some(last_updated) = process.last_updated else {
                continue;
            };
            if last_updated
                .checked_add(self.idle_period)
                .is_none_or(|idle_since| idle_since > now)
            {
                continue;
            }
            let fragments = std::mem::take(&mut process.fragments);
            process.last_updated = None;
            let probes = compute_probes(
                pid,
                fragments,
                self.parser.as_ref(),
                self.log_limiter.as_mut(),
            );
            updates.push(ProcessUpdate {
                process: process.process.clone(),
                probes,
                runtime_id: process.runtime_id.clone().unwrap_or_default(),
                should_upload_symdb: process.symdb_enabled,
            });
        }
        updates.sort_by_key(|update| update.process.pid);
        if !updates.is_empty() {
            debug!(count = updates.len(), "coalesced process updates");
        }
        updates
    }
}

fn runtime_id_changed(limiter: &mut dyn LogLimiter, pid: ProcessId, previous: &str, current: &str) {
    if limiter.allow() {
        warn!(%pid, previous, current, "runtime id changed, discarding pending fragments");
    } else {
        trace!(%pid, previous, current, "runtime id changed, discarding pending fragments");
    }
}

/// Collapse fragments to one per config path, parse them in path order, then
/// sort and deduplicate by probe identity.
///
/// Among the distinct contents seen for one path, a parsable probe beats a
/// malformed one, then the highest version wins, then the greatest content.
/// Arrival order never decides.
fn compute_probes(
    pid: ProcessId,
    mut fragments: Vec<ConfigFragment>,
    parser: &dyn ProbeParser,
    limiter: &mut dyn LogLimiter,
) -> Vec<ProbeDefinition> {
    fragments.sort_by(|a, b| {
        (&a.config_path, &a.config_content).cmp(&(&b.config_path, &b.config_content))
    });
    fragments.dedup_by(|a, b| {
        a.config_path == b.config_path && a.config_content == b.config_content
    });

    let mut probes = Vec::with_capacity(fragments.len());
    for same_path in fragments.chunk_by(|a, b| a.config_path == b.config_path) {
        let winner = same_path
            .iter()
            .map(|fragment| (fragment, parser.parse_probe(&fragment.config_content)))
            .max_by(|(a, parsed_a), (b, parsed_b)| {
                parsed_version(parsed_a)
                    .cmp(&parsed_version(parsed_b))
                    .then_with(|| a.config_content.cmp(&b.config_content))
            });
        match winner {
            Some((_, Ok(probe))) => probes.push(probe),
            Some((fragment, Err(err))) => {
                if limiter.allow() {
                    warn!(%pid, path = %fragment.config_path, %err, "dropping malformed probe");
                } else {
                    debug!(%pid, path = %fragment.config_path, %err, "dropping malformed probe");
                }
            }
            None => {}
        }
    }
    probes.sort_by(ProbeDefinition::cmp_identity);
    probes.dedup_by(|a, b| a.identity() == b.identity());
    probes
}

fn parsed_version(parsed: &Result<ProbeDefinition, ProbeParseError>) -> Option<u64> {
    parsed.as_ref().ok().map(|probe| probe.version)
}
