//! Profile store interface and the in-memory implementation.
//!
//! The rest of the engine only ever talks to [`ProfileStore`]; the trait is
//! injected at construction so components never reach for a process-wide
//! handle. All operations are idempotent and safe under concurrent callers —
//! the profiler worker and every detection module hold the same `Arc` and
//! write from their own threads.
//!
//! [`MemoryStore`] backs the trait with sharded concurrent maps. It exists so
//! the binary runs end-to-end and tests can observe writes; durable retention
//! is a different system's job.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::logger::{Event, SharedLogger};
use crate::types::SharedStats;

/// Profile identifier: `profile|<ip>`.
pub type ProfileId = String;

/// Window identifier within a profile: `tw<ordinal>`, ordinals start at 1.
pub type WindowId = String;

/// Returns the address part of a `profile|<ip>` identifier.
pub fn profile_address(profileid: &str) -> &str {
    profileid.splitn(2, '|').nth(1).unwrap_or(profileid)
}

// ── Time windows ─────────────────────────────────────────────────────────────

/// One fixed-width bucket of a profile's activity.
///
/// Windows of a profile are contiguous, non-overlapping and ordered by start
/// time; the width never changes for the lifetime of the profile.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub profile: ProfileId,
    pub id:      WindowId,
    /// Unix seconds, inclusive lower bound.
    pub start:   f64,
    /// Window width in seconds.
    pub width:   f64,
    /// 1-based position in the profile's window sequence.
    pub ordinal: u64,
}

impl TimeWindow {
    /// Exclusive upper bound of the window.
    pub fn end(&self) -> f64 {
        self.start + self.width
    }

    /// Whether `ts` falls within `[start, start + width)`.
    pub fn contains(&self, ts: f64) -> bool {
        ts >= self.start && ts < self.end()
    }

    /// Combined `profileid_twid` identity used as cache key and in
    /// window-close notifications.
    pub fn key(&self) -> String {
        format!("{}_{}", self.profile, self.id)
    }
}

// ── Evidence ─────────────────────────────────────────────────────────────────

/// The detection types this core can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvidenceKind {
    ArpScan,
    UnsolicitedArp,
    MitmArp,
    ArpOutsideLocalnet,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::ArpScan            => "ARPScan",
            EvidenceKind::UnsolicitedArp     => "UnsolicitedARP",
            EvidenceKind::MitmArp            => "MITM-ARP-attack",
            EvidenceKind::ArpOutsideLocalnet => "ARPOutsideLocalnet",
        }
    }
}

/// A structured detection output. Append-only from this core's perspective.
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub kind:         EvidenceKind,
    /// The IP address the evidence is about.
    pub subject:      String,
    pub threat_level: u8,
    /// In `[0, 1]`.
    pub confidence:   f64,
    pub description:  String,
    /// Unix seconds of the flow that triggered the detection.
    pub timestamp:    f64,
    pub profile:      ProfileId,
    pub window:       WindowId,
    /// Id of the triggering flow; opaque.
    pub flow_id:      String,
}

// ── Store interface ──────────────────────────────────────────────────────────

/// The operations the engine consumes from its backing store.
///
/// Every method is idempotent or append-only; none of them distinguishes
/// "already present" from "created" except through its return value.
pub trait ProfileStore: Send + Sync {
    /// Creates the profile for `addr` if it does not exist; returns its id.
    fn ensure_profile(&self, addr: IpAddr) -> ProfileId;

    /// The most recent window of the profile, if any window exists yet.
    fn latest_window(&self, profile: &str) -> Option<TimeWindow>;

    /// Appends a new window to the profile's sequence and returns it.
    fn create_window(&self, profile: &str, start: f64, width: f64, ordinal: u64) -> TimeWindow;

    /// Records a destination address contacted within the given window.
    fn record_destination(&self, profile: &str, window: &str, daddr: &str);

    /// Binds a MAC to the profile. The profile's own binding is refreshed;
    /// the MAC→address reverse entry is first-owner-wins so later claims on
    /// the same MAC remain visible as conflicts.
    fn bind_mac(&self, profile: &str, mac: &str);

    /// The MAC bound to this profile, if one was observed.
    fn mac_of(&self, profile: &str) -> Option<String>;

    /// The address that first announced ownership of this MAC.
    fn owner_of_mac(&self, mac: &str) -> Option<String>;

    /// Appends evidence to the sink.
    fn publish_evidence(&self, evidence: Evidence);
}

pub type SharedStore = Arc<dyn ProfileStore>;

// ── In-memory implementation ─────────────────────────────────────────────────

#[derive(Default)]
struct ProfileRecord {
    windows: Vec<TimeWindow>,
}

/// Concurrent in-memory store.
pub struct MemoryStore {
    profiles:   DashMap<ProfileId, ProfileRecord>,
    /// Destinations per combined `profileid_twid` key.
    dst_ips:    DashMap<String, HashSet<String>>,
    /// Profile → bound MAC.
    macs:       DashMap<ProfileId, String>,
    /// MAC → first owning address.
    mac_owners: DashMap<String, String>,
    evidence:   Mutex<Vec<Evidence>>,
    logger:     SharedLogger,
    stats:      SharedStats,
}

impl MemoryStore {
    pub fn new(logger: SharedLogger, stats: SharedStats) -> Arc<Self> {
        Arc::new(Self {
            profiles:   DashMap::new(),
            dst_ips:    DashMap::new(),
            macs:       DashMap::new(),
            mac_owners: DashMap::new(),
            evidence:   Mutex::new(Vec::new()),
            logger,
            stats,
        })
    }

    /// Snapshot of all evidence published so far.
    pub fn evidence(&self) -> Vec<Evidence> {
        self.evidence
            .lock()
            .map(|sink| sink.clone())
            .unwrap_or_default()
    }

    /// Destinations recorded for one `profileid_twid` key.
    pub fn destinations(&self, profile: &str, window: &str) -> HashSet<String> {
        self.dst_ips
            .get(&format!("{}_{}", profile, window))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}

impl ProfileStore for MemoryStore {
    fn ensure_profile(&self, addr: IpAddr) -> ProfileId {
        let profileid = format!("profile|{}", addr);
        self.profiles.entry(profileid.clone()).or_default();
        profileid
    }

    fn latest_window(&self, profile: &str) -> Option<TimeWindow> {
        self.profiles
            .get(profile)
            .and_then(|rec| rec.windows.last().cloned())
    }

    fn create_window(&self, profile: &str, start: f64, width: f64, ordinal: u64) -> TimeWindow {
        let window = TimeWindow {
            profile: profile.to_string(),
            id:      format!("tw{}", ordinal),
            start,
            width,
            ordinal,
        };
        if let Some(mut rec) = self.profiles.get_mut(profile) {
            rec.windows.push(window.clone());
        }
        self.logger.log(&Event::WindowOpened {
            profile: &window.profile,
            window:  &window.id,
        });
        window
    }

    fn record_destination(&self, profile: &str, window: &str, daddr: &str) {
        self.dst_ips
            .entry(format!("{}_{}", profile, window))
            .or_default()
            .insert(daddr.to_string());
    }

    fn bind_mac(&self, profile: &str, mac: &str) {
        self.macs.insert(profile.to_string(), mac.to_string());
        // First owner wins: a later claim on the same MAC must still resolve
        // to the original address so the conflict stays observable.
        self.mac_owners
            .entry(mac.to_string())
            .or_insert_with(|| profile_address(profile).to_string());
    }

    fn mac_of(&self, profile: &str) -> Option<String> {
        self.macs.get(profile).map(|entry| entry.value().clone())
    }

    fn owner_of_mac(&self, mac: &str) -> Option<String> {
        self.mac_owners.get(mac).map(|entry| entry.value().clone())
    }

    fn publish_evidence(&self, evidence: Evidence) {
        self.logger.log(&Event::Evidence {
            kind:         evidence.kind.as_str(),
            subject:      &evidence.subject,
            threat_level: evidence.threat_level,
            confidence:   evidence.confidence,
            description:  &evidence.description,
            profile:      &evidence.profile,
            window:       &evidence.window,
        });
        self.stats.evidence_emitted.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sink) = self.evidence.lock() {
            sink.push(evidence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::types::SessionStats;
    use std::net::Ipv4Addr;

    fn store() -> Arc<MemoryStore> {
        let logger = Arc::new(Logger::new(false, None).expect("logger"));
        MemoryStore::new(logger, SessionStats::new())
    }

    #[test]
    fn ensure_profile_is_idempotent() {
        let s = store();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let a = s.ensure_profile(addr);
        let b = s.ensure_profile(addr);
        assert_eq!(a, "profile|10.0.0.5");
        assert_eq!(a, b);
        assert_eq!(s.profile_count(), 1);
    }

    #[test]
    fn reverse_mac_binding_keeps_first_owner() {
        let s = store();
        s.bind_mac("profile|10.0.0.5", "2e:a4:18:f8:3d:02");
        s.bind_mac("profile|10.0.0.9", "2e:a4:18:f8:3d:02");

        // Both profiles carry the MAC, but the reverse lookup still names
        // the address that announced it first.
        assert_eq!(s.mac_of("profile|10.0.0.9").as_deref(), Some("2e:a4:18:f8:3d:02"));
        assert_eq!(s.owner_of_mac("2e:a4:18:f8:3d:02").as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn windows_accumulate_in_order() {
        let s = store();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let pid = s.ensure_profile(addr);
        assert!(s.latest_window(&pid).is_none());

        s.create_window(&pid, 100.0, 60.0, 1);
        let w2 = s.create_window(&pid, 160.0, 60.0, 2);
        let latest = s.latest_window(&pid).expect("latest window");
        assert_eq!(latest, w2);
        assert_eq!(latest.key(), "profile|10.0.0.5_tw2");
    }

    #[test]
    fn destinations_are_deduplicated_per_window() {
        let s = store();
        s.record_destination("profile|10.0.0.5", "tw1", "10.0.0.10");
        s.record_destination("profile|10.0.0.5", "tw1", "10.0.0.10");
        s.record_destination("profile|10.0.0.5", "tw1", "10.0.0.11");
        assert_eq!(s.destinations("profile|10.0.0.5", "tw1").len(), 2);
    }
}
