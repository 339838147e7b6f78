//! ARP scan/spoof detection.
//!
//! Four independent heuristics run over every profiled ARP flow, in order:
//!
//! 1. Gratuitous-ARP / MITM — a self-announcing broadcast binds the sender's
//!    MAC; a later announcement of a bound MAC from a different address is a
//!    cache-poisoning indicator.
//! 2. ARP scan — three or more distinct destinations from one profile within
//!    one window, with at most 30 seconds between the earliest and latest
//!    cached requests.
//! 3. Outside-local-network — an ARP request for a destination that is in no
//!    home range and not plausibly on the sender's subnet.
//! 4. Unsolicited ARP — a broadcast request from a fully identified sender,
//!    used to seed neighbours' caches.
//!
//! Several heuristics can fire on the same flow. The destination cache is
//! keyed by the combined `profileid_twid` identity and cleared either when a
//! scan fires (so the next burst is detected fresh) or when the window
//! closes; there is no size cap, since a fixed-width window bounds how many
//! distinct destinations one source can accumulate per key.

use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use crate::bus::Topic;
use crate::profiler::types::{ArpEvent, ArpOperation};
use crate::store::{profile_address, Evidence, EvidenceKind, SharedStore};

use super::{key_belongs_to, DetectionModule};

pub const MODULE_NAME: &str = "arp-anomaly";

const TOPICS: &[Topic] = &[Topic::NewArp, Topic::WindowClosed];

/// Minimum distinct destinations before the scan check can fire.
const SCAN_MIN_DESTINATIONS: usize = 3;

/// Maximum seconds between the earliest and latest cached requests for the
/// burst to count as a scan.
const SCAN_WINDOW_SECS: f64 = 30.0;

const BROADCAST_MAC: &str = "ff:ff:ff:ff:ff:ff";
const ZERO_MAC: &str = "00:00:00:00:00:00";

/// Address used by ARP probes (duplicate-address detection).
const PROBE_ADDR: &str = "0.0.0.0";

/// Most recent request seen for one destination.
struct CachedRequest {
    uid: String,
    ts:  f64,
}

/// Insertion-ordered destination cache for one (profile, window) key.
///
/// Holds at most one record per distinct destination — the most recent one —
/// while keeping each destination's original insertion slot, so "earliest"
/// and "latest" mean arrival order, not timestamp order.
#[derive(Default)]
struct RequestGroup {
    entries: Vec<(String, CachedRequest)>,
}

impl RequestGroup {
    fn upsert(&mut self, daddr: &str, request: CachedRequest) {
        if let Some(entry) = self.entries.iter_mut().find(|(d, _)| d == daddr) {
            entry.1 = request;
        } else {
            self.entries.push((daddr.to_string(), request));
        }
    }
}

/// The concrete ARP detection module.
pub struct ArpDetector {
    store:     SharedStore,
    home_nets: Vec<IpNetwork>,
    cache:     HashMap<String, RequestGroup>,
}

impl ArpDetector {
    /// `home_nets` is the configured home ranges; when empty the detector
    /// falls back to the RFC1918 private ranges.
    pub fn new(store: SharedStore, home_nets: Vec<IpNetwork>) -> Self {
        let home_nets = if home_nets.is_empty() {
            default_home_nets()
        } else {
            home_nets
        };
        Self {
            store,
            home_nets,
            cache: HashMap::new(),
        }
    }

    fn handle_event(&mut self, ev: &ArpEvent) {
        let flow = &ev.flow;

        // A gratuitous ARP announces the sender's own mapping to the whole
        // segment: source and destination address match and the destination
        // MAC is broadcast, zero, or the sender's own.
        let gratuitous = flow.saddr == flow.daddr
            && (flow.dst_mac == BROADCAST_MAC
                || flow.dst_mac == ZERO_MAC
                || flow.dst_mac == flow.src_mac);

        if gratuitous {
            // First announcement binds the profile's MAC.
            if self.store.mac_of(&ev.profileid).is_none() {
                self.store.bind_mac(&ev.profileid, &flow.src_mac);
            }
            // Only gratuitous flows are eligible for the MITM check.
            self.check_mitm(ev);
        } else {
            // Announcements are not scan traffic.
            self.check_arp_scan(ev);
        }

        if flow.operation == ArpOperation::Request {
            self.check_dst_outside_localnet(ev);
            self.check_unsolicited(ev);
        }
    }

    /// Fires when a gratuitous ARP claims a MAC that a different address
    /// announced earlier: either an ARP cache attack in progress or a
    /// genuine re-address, hence the low confidence and high threat level.
    fn check_mitm(&self, ev: &ArpEvent) -> bool {
        let owner = match self.store.owner_of_mac(&ev.flow.src_mac) {
            Some(owner) => owner,
            None => return false,
        };
        if owner == ev.flow.saddr {
            return false;
        }
        self.publish(ev, EvidenceKind::MitmArp, 90, 0.2, "performing MITM attack".to_string());
        true
    }

    /// Upserts the destination into the per-(profile, window) cache and
    /// fires once the group holds three distinct destinations whose earliest
    /// and latest entries lie within the scan window. Firing clears the key
    /// so a subsequent burst is detected fresh; a miss keeps the group.
    fn check_arp_scan(&mut self, ev: &ArpEvent) -> bool {
        let key = format!("{}_{}", ev.profileid, ev.twid);
        let fired = {
            let group = self.cache.entry(key.clone()).or_default();
            group.upsert(
                &ev.flow.daddr,
                CachedRequest { uid: ev.flow.uid.clone(), ts: ev.flow.ts },
            );
            if group.entries.len() >= SCAN_MIN_DESTINATIONS {
                // Earliest and latest by insertion order, deliberately not
                // sorted by timestamp.
                let first = &group.entries[0].1;
                let last = &group.entries[group.entries.len() - 1].1;
                last.ts - first.ts <= SCAN_WINDOW_SECS
            } else {
                false
            }
        };
        if fired {
            self.publish(
                ev,
                EvidenceKind::ArpScan,
                60,
                0.8,
                "performing an ARP scan. Threat level 60. Confidence 0.8.".to_string(),
            );
            self.cache.remove(&key);
        }
        fired
    }

    /// Fires for requests whose destination is outside every home range and
    /// not plausibly on the sender's own subnet.
    fn check_dst_outside_localnet(&self, ev: &ArpEvent) -> bool {
        let flow = &ev.flow;

        // ARP probes announce from 0.0.0.0; not outside traffic.
        if flow.saddr.contains(PROBE_ADDR) || flow.daddr.contains(PROBE_ADDR) {
            return false;
        }
        let daddr: Ipv4Addr = match flow.daddr.parse() {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        if daddr.is_multicast() || daddr.is_link_local() {
            return false;
        }
        if self.home_nets.iter().any(|net| net.contains(IpAddr::V4(daddr))) {
            return false;
        }
        // Same-subnet heuristic: a shared first octet is treated as local.
        if let Ok(saddr) = flow.saddr.parse::<Ipv4Addr>() {
            if saddr.octets()[0] == daddr.octets()[0] {
                return false;
            }
        }
        self.publish(
            ev,
            EvidenceKind::ArpOutsideLocalnet,
            50,
            0.8,
            format!(
                "sending ARP packet to a destination address outside of local network: {}",
                flow.daddr
            ),
        );
        true
    }

    /// Fires for broadcast requests from a fully identified sender — the
    /// shape used to push entries into neighbours' ARP caches unasked.
    /// Evaluated independently of the gratuitous classification.
    fn check_unsolicited(&self, ev: &ArpEvent) -> bool {
        let flow = &ev.flow;
        if flow.dst_mac == BROADCAST_MAC
            && flow.dst_hw == BROADCAST_MAC
            && flow.src_mac != ZERO_MAC
            && flow.src_hw != ZERO_MAC
        {
            self.publish(
                ev,
                EvidenceKind::UnsolicitedArp,
                50,
                0.8,
                "detected sending unsolicited ARP".to_string(),
            );
            return true;
        }
        false
    }

    fn publish(
        &self,
        ev: &ArpEvent,
        kind: EvidenceKind,
        threat_level: u8,
        confidence: f64,
        description: String,
    ) {
        self.store.publish_evidence(Evidence {
            kind,
            subject: profile_address(&ev.profileid).to_string(),
            threat_level,
            confidence,
            description,
            timestamp: ev.flow.ts,
            profile: ev.profileid.clone(),
            window: ev.twid.clone(),
            flow_id: ev.flow.uid.clone(),
        });
    }
}

impl DetectionModule for ArpDetector {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn topics(&self) -> &'static [Topic] {
        TOPICS
    }

    fn on_event(&mut self, topic: Topic, payload: &str) -> Result<(), String> {
        match topic {
            Topic::NewArp => {
                let ev: ArpEvent = serde_json::from_str(payload)
                    .map_err(|e| format!("bad new_arp payload: {}", e))?;
                self.handle_event(&ev);
                Ok(())
            }
            // Routed to on_window_closed by the framework.
            Topic::WindowClosed => Ok(()),
        }
    }

    fn on_window_closed(&mut self, closed: &str) {
        self.cache.retain(|key, _| !key_belongs_to(key, closed));
    }
}

fn default_home_nets() -> Vec<IpNetwork> {
    ["192.168.0.0/16", "172.16.0.0/12", "10.0.0.0/8"]
        .iter()
        .filter_map(|net| net.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::profiler::types::ArpFlow;
    use crate::store::MemoryStore;
    use crate::types::SessionStats;
    use std::sync::Arc;

    fn detector() -> (ArpDetector, Arc<MemoryStore>) {
        let logger = Arc::new(Logger::new(false, None).expect("logger"));
        let store = MemoryStore::new(logger, SessionStats::new());
        (ArpDetector::new(store.clone(), Vec::new()), store)
    }

    fn event(saddr: &str, daddr: &str, ts: f64) -> ArpEvent {
        ArpEvent {
            profileid: format!("profile|{}", saddr),
            twid:      "tw1".to_string(),
            flow: ArpFlow {
                ts,
                operation: ArpOperation::Request,
                saddr:     saddr.to_string(),
                daddr:     daddr.to_string(),
                src_mac:   "2e:a4:18:f8:3d:02".to_string(),
                dst_mac:   BROADCAST_MAC.to_string(),
                src_hw:    "2e:a4:18:f8:3d:02".to_string(),
                dst_hw:    ZERO_MAC.to_string(),
                uid:       format!("uid-{}", ts),
            },
        }
    }

    fn gratuitous(saddr: &str, src_mac: &str, ts: f64) -> ArpEvent {
        let mut ev = event(saddr, saddr, ts);
        ev.flow.src_mac = src_mac.to_string();
        ev.flow.src_hw = src_mac.to_string();
        ev
    }

    fn kinds(store: &MemoryStore, kind: EvidenceKind) -> usize {
        store.evidence().iter().filter(|e| e.kind == kind).count()
    }

    #[test]
    fn three_destinations_within_window_fire_one_scan() {
        let (mut det, store) = detector();
        let t = 1636305825.0;
        det.handle_event(&event("10.0.0.5", "10.0.0.10", t));
        det.handle_event(&event("10.0.0.5", "10.0.0.11", t + 5.0));
        assert_eq!(kinds(&store, EvidenceKind::ArpScan), 0);

        det.handle_event(&event("10.0.0.5", "10.0.0.12", t + 12.0));

        let scans: Vec<_> = store
            .evidence()
            .into_iter()
            .filter(|e| e.kind == EvidenceKind::ArpScan)
            .collect();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].subject, "10.0.0.5");
        assert_eq!(scans[0].confidence, 0.8);
        assert_eq!(scans[0].threat_level, 60);
        assert_eq!(scans[0].profile, "profile|10.0.0.5");
        assert_eq!(scans[0].window, "tw1");
        // Firing clears the key so the next burst is detected fresh.
        assert!(det.cache.is_empty());
    }

    #[test]
    fn slow_burst_does_not_fire_and_keeps_the_cache() {
        let (mut det, store) = detector();
        let t = 1636305825.0;
        det.handle_event(&event("10.0.0.5", "10.0.0.10", t));
        det.handle_event(&event("10.0.0.5", "10.0.0.11", t + 5.0));
        det.handle_event(&event("10.0.0.5", "10.0.0.12", t + 40.0));

        assert_eq!(kinds(&store, EvidenceKind::ArpScan), 0);
        let group = det.cache.get("profile|10.0.0.5_tw1").expect("cache kept");
        assert_eq!(group.entries.len(), 3);
    }

    #[test]
    fn repeated_destination_refreshes_without_a_new_slot() {
        let (mut det, _store) = detector();
        let t = 1636305825.0;
        det.handle_event(&event("10.0.0.5", "10.0.0.10", t));
        det.handle_event(&event("10.0.0.5", "10.0.0.11", t + 1.0));
        det.handle_event(&event("10.0.0.5", "10.0.0.10", t + 2.0));

        let group = det.cache.get("profile|10.0.0.5_tw1").expect("cache");
        assert_eq!(group.entries.len(), 2);
        // The refreshed destination kept its original insertion slot.
        assert_eq!(group.entries[0].0, "10.0.0.10");
        assert_eq!(group.entries[0].1.ts, t + 2.0);
    }

    #[test]
    fn gratuitous_flows_never_count_toward_a_scan() {
        let (mut det, store) = detector();
        let t = 1636305825.0;
        for i in 0..5 {
            det.handle_event(&gratuitous("10.0.0.5", "2e:a4:18:f8:3d:02", t + i as f64));
        }
        assert_eq!(kinds(&store, EvidenceKind::ArpScan), 0);
        assert!(det.cache.is_empty());
    }

    #[test]
    fn rebinding_a_mac_to_a_new_address_is_mitm() {
        let (mut det, store) = detector();
        let mac = "2e:a4:18:f8:3d:02";
        det.handle_event(&gratuitous("172.20.7.40", mac, 1.0));
        assert_eq!(kinds(&store, EvidenceKind::MitmArp), 0);

        det.handle_event(&gratuitous("172.20.7.41", mac, 2.0));

        let mitm: Vec<_> = store
            .evidence()
            .into_iter()
            .filter(|e| e.kind == EvidenceKind::MitmArp)
            .collect();
        assert_eq!(mitm.len(), 1);
        // The claiming address is the subject.
        assert_eq!(mitm[0].subject, "172.20.7.41");
        assert_eq!(mitm[0].confidence, 0.2);
        assert_eq!(mitm[0].threat_level, 90);
    }

    #[test]
    fn probe_flows_never_trigger_the_outside_check() {
        let (mut det, store) = detector();
        det.handle_event(&event("0.0.0.0", "8.8.8.8", 1.0));
        det.handle_event(&event("10.0.0.5", "0.0.0.0", 2.0));
        assert_eq!(kinds(&store, EvidenceKind::ArpOutsideLocalnet), 0);
    }

    #[test]
    fn multicast_link_local_and_home_destinations_are_skipped() {
        let (mut det, store) = detector();
        det.handle_event(&event("10.0.0.5", "224.0.0.251", 1.0));
        det.handle_event(&event("10.0.0.5", "169.254.1.5", 2.0));
        det.handle_event(&event("10.0.0.5", "192.168.1.9", 3.0));
        assert_eq!(kinds(&store, EvidenceKind::ArpOutsideLocalnet), 0);
    }

    #[test]
    fn shared_first_octet_is_treated_as_local() {
        let (mut det, store) = detector();
        det.handle_event(&event("8.1.2.3", "8.8.8.8", 1.0));
        assert_eq!(kinds(&store, EvidenceKind::ArpOutsideLocalnet), 0);
    }

    #[test]
    fn request_for_a_remote_destination_fires_outside_evidence() {
        let (mut det, store) = detector();
        det.handle_event(&event("10.0.0.5", "8.8.8.8", 1.0));

        let outside: Vec<_> = store
            .evidence()
            .into_iter()
            .filter(|e| e.kind == EvidenceKind::ArpOutsideLocalnet)
            .collect();
        assert_eq!(outside.len(), 1);
        assert_eq!(outside[0].subject, "10.0.0.5");
        assert!(outside[0].description.contains("8.8.8.8"));
    }

    #[test]
    fn broadcast_request_from_identified_sender_is_unsolicited() {
        let (mut det, store) = detector();
        let mut ev = event("10.0.0.5", "10.0.0.9", 1.0);
        ev.flow.dst_hw = BROADCAST_MAC.to_string();
        det.handle_event(&ev);

        assert_eq!(kinds(&store, EvidenceKind::UnsolicitedArp), 1);
        // The same flow also seeds the scan cache but fires nothing else.
        assert_eq!(kinds(&store, EvidenceKind::ArpScan), 0);
    }

    #[test]
    fn zero_source_hardware_is_not_unsolicited() {
        let (mut det, store) = detector();
        let mut ev = event("10.0.0.5", "10.0.0.9", 1.0);
        ev.flow.dst_hw = BROADCAST_MAC.to_string();
        ev.flow.src_hw = ZERO_MAC.to_string();
        det.handle_event(&ev);
        assert_eq!(kinds(&store, EvidenceKind::UnsolicitedArp), 0);
    }

    #[test]
    fn window_close_evicts_only_that_window() {
        let (mut det, _store) = detector();
        det.handle_event(&event("10.0.0.5", "10.0.0.10", 1.0));
        let mut other = event("10.0.0.5", "10.0.0.20", 2.0);
        other.twid = "tw10".to_string();
        det.handle_event(&other);
        let mut third = event("10.0.0.9", "10.0.0.30", 3.0);
        third.twid = "tw1".to_string();
        det.handle_event(&third);
        assert_eq!(det.cache.len(), 3);

        det.on_window_closed("profile|10.0.0.5_tw1");

        assert!(det.cache.get("profile|10.0.0.5_tw1").is_none());
        assert!(det.cache.get("profile|10.0.0.5_tw10").is_some());
        assert!(det.cache.get("profile|10.0.0.9_tw1").is_some());
    }

    #[test]
    fn bus_payload_round_trips_through_on_event() {
        let (mut det, store) = detector();
        let t = 1636305825.0;
        for (daddr, offset) in [("10.0.0.10", 0.0), ("10.0.0.11", 5.0), ("10.0.0.12", 12.0)] {
            let payload =
                serde_json::to_string(&event("10.0.0.5", daddr, t + offset)).expect("serialise");
            det.on_event(Topic::NewArp, &payload).expect("decode");
        }
        assert_eq!(kinds(&store, EvidenceKind::ArpScan), 1);
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_panic() {
        let (mut det, _store) = detector();
        let err = det.on_event(Topic::NewArp, "{not json").expect_err("malformed");
        assert!(err.contains("new_arp"));
    }
}
