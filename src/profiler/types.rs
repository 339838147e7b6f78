use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::FlowError;

/// A flow record normalised from any of the supported wire formats.
///
/// Only `start_time`, `saddr` and `daddr` are guaranteed; every other field
/// is explicitly optional — a missing column or JSON key stays `None` rather
/// than collapsing into a zero that could collide with legitimate data.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFlow {
    pub start_time: NaiveDateTime,
    pub end_time:   Option<NaiveDateTime>,
    /// Seconds.
    pub duration:   Option<f64>,
    pub proto:      Option<String>,
    pub app_proto:  Option<String>,
    pub saddr:      String,
    pub sport:      Option<u16>,
    pub direction:  Option<String>,
    pub daddr:      String,
    pub dport:      Option<u16>,
    pub state:      Option<String>,
    pub pkts:       Option<u64>,
    pub spkts:      Option<u64>,
    pub dpkts:      Option<u64>,
    pub bytes:      Option<u64>,
    pub sbytes:     Option<u64>,
    pub dbytes:     Option<u64>,
}

impl CanonicalFlow {
    /// Start time as Unix seconds with sub-second precision.
    pub fn unix_start(&self) -> f64 {
        self.start_time.and_utc().timestamp_micros() as f64 / 1_000_000.0
    }

    /// Parses the source address as an IP literal.
    ///
    /// MAC-only records are expected in some captures; the caller drops them
    /// silently on error rather than treating them as stream failures.
    pub fn source_ip(&self) -> Result<IpAddr, FlowError> {
        self.saddr
            .parse::<IpAddr>()
            .map_err(|_| FlowError::AddressParse(self.saddr.clone()))
    }
}

/// ARP operation. Anything that is neither a request nor a reply is dropped
/// at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArpOperation {
    Request,
    Reply,
}

/// One ARP exchange. ARP has no native flow id, so `uid` is synthesised at
/// parse time and must be treated as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpFlow {
    /// Unix seconds.
    pub ts:        f64,
    pub operation: ArpOperation,
    pub saddr:     String,
    pub daddr:     String,
    pub src_mac:   String,
    pub dst_mac:   String,
    pub src_hw:    String,
    pub dst_hw:    String,
    pub uid:       String,
}

/// The `new_arp` payload published after an ARP record has been profiled:
/// the flow itself plus the profile and window it was resolved to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArpEvent {
    pub profileid: String,
    pub twid:      String,
    #[serde(flatten)]
    pub flow:      ArpFlow,
}
