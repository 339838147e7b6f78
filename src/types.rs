use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

/// Set to `true` by the ctrlc handler; the feeder loop exits on next iteration.
pub type ShutdownFlag = Arc<AtomicBool>;

/// Running totals for the session, reported in the shutdown summary.
///
/// All counters are atomics so every worker can increment them without
/// coordination; the summary reads them once after all workers have signalled
/// completion.
pub struct SessionStats {
    /// Flows accepted by the profiler and recorded into a time window.
    pub flows_profiled:   AtomicU64,
    /// Records dropped before profiling: non-flow payloads, unparsable rows,
    /// MAC-only sources, and sources outside the configured home networks.
    pub records_skipped:  AtomicU64,
    /// Time windows opened across all profiles.
    pub windows_opened:   AtomicU64,
    /// ARP events published on the bus for detection modules.
    pub arp_events:       AtomicU64,
    /// Evidence entries published through the profile store.
    pub evidence_emitted: AtomicU64,
}

pub type SharedStats = Arc<SessionStats>;

impl SessionStats {
    pub fn new() -> SharedStats {
        Arc::new(Self {
            flows_profiled:   AtomicU64::new(0),
            records_skipped:  AtomicU64::new(0),
            windows_opened:   AtomicU64::new(0),
            arp_events:       AtomicU64::new(0),
            evidence_emitted: AtomicU64::new(0),
        })
    }
}
