//! Flow record normalisation.
//!
//! The first record of a stream decides its format: a JSON object means
//! self-describing records (Suricata-style, one object per line); anything
//! else is delimited text whose header row names the columns. The decision —
//! including the delimiter and the column→index map — is cached on the
//! [`Normalizer`] and reused for every subsequent record, so detection runs
//! exactly once per stream.
//!
//! Per-record failures after detection are skips, not errors: a JSON record
//! that is not a completed flow, or a row whose required fields don't parse,
//! yields `None` and the stream continues. Only an undecidable first line
//! (comma/tab tie, or a header without the required columns) is fatal.

use chrono::NaiveDateTime;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::profiler::types::{ArpFlow, ArpOperation, CanonicalFlow};

/// Cached per-stream format decision.
#[derive(Debug, Clone)]
enum Layout {
    Delimited { sep: char, columns: ColumnIndex },
    SelfDescribing,
}

/// Column positions discovered from a delimited header row.
///
/// Columns are located by case-insensitive substring match on the header
/// token, so `StartTime`, `Dur`, `SrcAddr`, `TotPkts` and friends all land
/// in the right slot regardless of the producing tool's exact spelling.
#[derive(Debug, Clone, Default)]
struct ColumnIndex {
    starttime: Option<usize>,
    dur:       Option<usize>,
    proto:     Option<usize>,
    saddr:     Option<usize>,
    sport:     Option<usize>,
    dir:       Option<usize>,
    daddr:     Option<usize>,
    dport:     Option<usize>,
    state:     Option<usize>,
    pkts:      Option<usize>,
    bytes:     Option<usize>,
}

impl ColumnIndex {
    fn from_header(fields: &[&str]) -> Self {
        let mut idx = Self::default();
        for (i, field) in fields.iter().enumerate() {
            let token = field.trim().to_ascii_lowercase();
            if token.contains("time") {
                idx.starttime = Some(i);
            } else if token.contains("dur") {
                idx.dur = Some(i);
            } else if token.contains("proto") {
                idx.proto = Some(i);
            } else if token.contains("srca") {
                idx.saddr = Some(i);
            } else if token.contains("sport") {
                idx.sport = Some(i);
            } else if token.contains("dir") {
                idx.dir = Some(i);
            } else if token.contains("dsta") {
                idx.daddr = Some(i);
            } else if token.contains("dport") {
                idx.dport = Some(i);
            } else if token.contains("state") {
                idx.state = Some(i);
            } else if token.contains("totpkts") {
                idx.pkts = Some(i);
            } else if token.contains("totbytes") {
                idx.bytes = Some(i);
            }
        }
        idx
    }
}

// ── Self-describing records ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EveRecord {
    event_type: String,
    proto:      Option<String>,
    app_proto:  Option<String>,
    src_ip:     String,
    src_port:   Option<u16>,
    dest_ip:    String,
    dest_port:  Option<u16>,
    flow:       Option<EveFlow>,
}

#[derive(Debug, Deserialize)]
struct EveFlow {
    start:          String,
    end:            String,
    state:          Option<String>,
    pkts_toserver:  u64,
    pkts_toclient:  u64,
    bytes_toserver: u64,
    bytes_toclient: u64,
}

/// Parses an ISO-8601 timestamp, discarding any `+HHMM` timezone suffix.
fn parse_iso(ts: &str) -> Option<NaiveDateTime> {
    let trimmed = ts.split('+').next().unwrap_or(ts);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

/// Parses one self-describing record. Returns `None` for anything that is
/// not a completed bidirectional flow (other `event_type`s, missing `flow`
/// object, unparsable timestamps) — those records are skipped, not raised.
fn parse_json_flow(line: &str) -> Option<CanonicalFlow> {
    let rec: EveRecord = serde_json::from_str(line).ok()?;
    if rec.event_type != "flow" {
        return None;
    }
    let flow = rec.flow?;
    let start = parse_iso(&flow.start)?;
    let end = parse_iso(&flow.end)?;
    let duration = (end - start).num_milliseconds() as f64 / 1000.0;

    Some(CanonicalFlow {
        start_time: start,
        end_time:   Some(end),
        duration:   Some(duration),
        proto:      rec.proto,
        app_proto:  rec.app_proto,
        saddr:      rec.src_ip,
        // Portless protocols (ICMP) carry no port key; resolve to 0 by policy.
        sport:      Some(rec.src_port.unwrap_or(0)),
        direction:  None,
        daddr:      rec.dest_ip,
        dport:      Some(rec.dest_port.unwrap_or(0)),
        state:      flow.state,
        // Aggregates are the sum of the directional counters, which are
        // preserved individually alongside.
        pkts:       Some(flow.pkts_toserver + flow.pkts_toclient),
        spkts:      Some(flow.pkts_toserver),
        dpkts:      Some(flow.pkts_toclient),
        bytes:      Some(flow.bytes_toserver + flow.bytes_toclient),
        sbytes:     Some(flow.bytes_toserver),
        dbytes:     Some(flow.bytes_toclient),
    })
}

// ── ARP records ──────────────────────────────────────────────────────────────

/// Zeek arp.log field names.
#[derive(Debug, Deserialize)]
struct RawArpRecord {
    ts:        f64,
    operation: String,
    src_mac:   String,
    dst_mac:   String,
    orig_h:    String,
    resp_h:    String,
    orig_hw:   String,
    resp_hw:   String,
}

/// Parses one ARP record line. ARP records have no native flow id; a fresh
/// opaque uid is synthesised for each accepted record.
pub fn parse_arp_record(line: &str) -> Option<ArpFlow> {
    let rec: RawArpRecord = serde_json::from_str(line).ok()?;
    let operation = if rec.operation.contains("request") {
        ArpOperation::Request
    } else if rec.operation.contains("reply") {
        ArpOperation::Reply
    } else {
        return None;
    };

    Some(ArpFlow {
        ts:        rec.ts,
        operation,
        saddr:     rec.orig_h,
        daddr:     rec.resp_h,
        src_mac:   rec.src_mac,
        dst_mac:   rec.dst_mac,
        src_hw:    rec.orig_hw,
        dst_hw:    rec.resp_hw,
        uid:       Uuid::new_v4().to_string(),
    })
}

// ── Normalizer ───────────────────────────────────────────────────────────────

/// Stateful per-stream normaliser: detects the wire format once, then maps
/// every record through the cached layout.
pub struct Normalizer {
    layout:      Option<Layout>,
    time_format: String,
}

impl Normalizer {
    pub fn new(time_format: &str) -> Self {
        Self {
            layout:      None,
            time_format: time_format.to_string(),
        }
    }

    /// Normalises one raw record.
    ///
    /// `Ok(Some(_))` is an accepted flow; `Ok(None)` is a skipped record
    /// (header row, non-flow payload, unparsable row). An `Err` means the
    /// stream itself is unusable and must be aborted.
    pub fn normalize(&mut self, line: &str) -> Result<Option<CanonicalFlow>> {
        match &self.layout {
            Some(Layout::SelfDescribing) => Ok(parse_json_flow(line)),
            Some(Layout::Delimited { sep, columns }) => {
                Ok(self.parse_delimited_row(line, *sep, columns))
            }
            None => self.detect_layout(line),
        }
    }

    /// Runs format detection on the first record of the stream.
    fn detect_layout(&mut self, line: &str) -> Result<Option<CanonicalFlow>> {
        // A structured parse that yields an object wins outright; the first
        // record is then already data, not a header.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if value.is_object() {
                self.layout = Some(Layout::SelfDescribing);
                return Ok(parse_json_flow(line));
            }
        }

        // Delimited text: the separator is whichever of comma and tab splits
        // the header into more fields. A tie leaves no way to read the
        // stream at all.
        let commas = line.split(',').count();
        let tabs = line.split('\t').count();
        let sep = if commas > tabs {
            ','
        } else if tabs > commas {
            '\t'
        } else {
            return Err(FlowError::AmbiguousSeparator);
        };

        let fields: Vec<&str> = line.trim().split(sep).collect();
        let columns = ColumnIndex::from_header(&fields);
        if columns.starttime.is_none() || columns.saddr.is_none() || columns.daddr.is_none() {
            return Err(FlowError::Layout(format!(
                "header has no time/source/destination columns: {}",
                line.trim()
            )));
        }

        self.layout = Some(Layout::Delimited { sep, columns });
        // The header row itself carries no flow.
        Ok(None)
    }

    /// Maps one delimited data row through the cached column index. Rows
    /// whose required fields are missing or unparsable are skipped.
    fn parse_delimited_row(
        &self,
        line: &str,
        sep: char,
        columns: &ColumnIndex,
    ) -> Option<CanonicalFlow> {
        let fields: Vec<&str> = line.trim().split(sep).map(str::trim).collect();
        let get = |slot: Option<usize>| -> Option<String> {
            slot.and_then(|i| fields.get(i).copied())
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };

        let start_raw = get(columns.starttime)?;
        let start_time =
            NaiveDateTime::parse_from_str(&start_raw, &self.time_format).ok()?;
        let saddr = get(columns.saddr)?;
        let daddr = get(columns.daddr)?;

        Some(CanonicalFlow {
            start_time,
            end_time:  None,
            duration:  get(columns.dur).and_then(|v| v.parse().ok()),
            proto:     get(columns.proto),
            app_proto: None,
            saddr,
            sport:     get(columns.sport).and_then(|v| v.parse().ok()),
            direction: get(columns.dir),
            daddr,
            dport:     get(columns.dport).and_then(|v| v.parse().ok()),
            state:     get(columns.state),
            pkts:      get(columns.pkts).and_then(|v| v.parse().ok()),
            spkts:     None,
            dpkts:     None,
            bytes:     get(columns.bytes).and_then(|v| v.parse().ok()),
            sbytes:    None,
            dbytes:    None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARGUS_HEADER: &str =
        "StartTime,Dur,Proto,SrcAddr,Sport,Dir,DstAddr,Dport,State,TotPkts,TotBytes";

    #[test]
    fn delimited_header_maps_every_column() {
        let mut n = Normalizer::new("%Y/%m/%d %H:%M:%S%.f");
        // The header establishes the layout and yields no flow.
        assert!(n.normalize(ARGUS_HEADER).expect("header accepted").is_none());

        let row = "2021/11/07 18:03:45.755132,0.5,tcp,10.0.0.5,49231,->,10.0.0.9,443,CON,12,2048";
        let flow = n.normalize(row).expect("row accepted").expect("row is a flow");

        assert_eq!(flow.saddr, "10.0.0.5");
        assert_eq!(flow.daddr, "10.0.0.9");
        assert_eq!(flow.duration, Some(0.5));
        assert_eq!(flow.proto.as_deref(), Some("tcp"));
        assert_eq!(flow.sport, Some(49231));
        assert_eq!(flow.direction.as_deref(), Some("->"));
        assert_eq!(flow.dport, Some(443));
        assert_eq!(flow.state.as_deref(), Some("CON"));
        assert_eq!(flow.pkts, Some(12));
        assert_eq!(flow.bytes, Some(2048));
        assert!(flow.unix_start() > 0.0);
    }

    #[test]
    fn tab_separator_wins_when_it_splits_more_fields() {
        let mut n = Normalizer::new("%Y/%m/%d %H:%M:%S%.f");
        let header = ARGUS_HEADER.replace(',', "\t");
        assert!(n.normalize(&header).expect("header accepted").is_none());

        let row = "2021/11/07 18:03:45.755132\t0.5\ttcp\t10.0.0.5\t49231\t->\t10.0.0.9\t443\tCON\t12\t2048";
        let flow = n.normalize(row).expect("row accepted").expect("row is a flow");
        assert_eq!(flow.daddr, "10.0.0.9");
    }

    #[test]
    fn separator_tie_aborts_the_stream() {
        let mut n = Normalizer::new("%Y/%m/%d %H:%M:%S%.f");
        // One comma, one tab: two fields either way.
        let err = n.normalize("a,b\tc").expect_err("tie must be fatal");
        assert!(matches!(err, FlowError::AmbiguousSeparator));
    }

    #[test]
    fn missing_optional_columns_stay_absent() {
        let mut n = Normalizer::new("%Y/%m/%d %H:%M:%S%.f");
        n.normalize("StartTime,SrcAddr,DstAddr").expect("header accepted");
        let flow = n
            .normalize("2021/11/07 18:03:45.755132,10.0.0.5,10.0.0.9")
            .expect("row accepted")
            .expect("row is a flow");
        assert_eq!(flow.sport, None);
        assert_eq!(flow.pkts, None);
        assert_eq!(flow.state, None);
    }

    #[test]
    fn eve_flow_record_sums_directional_counters() {
        let mut n = Normalizer::new("%Y/%m/%d %H:%M:%S%.f");
        let line = r#"{"event_type":"flow","proto":"TCP","src_ip":"10.0.0.5","src_port":49231,"dest_ip":"10.0.0.9","dest_port":443,"flow":{"start":"2021-11-07T18:03:45.755132+0000","end":"2021-11-07T18:03:46.255132+0000","state":"established","pkts_toserver":7,"pkts_toclient":5,"bytes_toserver":1200,"bytes_toclient":848}}"#;
        let flow = n.normalize(line).expect("accepted").expect("flow");

        assert_eq!(flow.pkts, Some(12));
        assert_eq!(flow.spkts, Some(7));
        assert_eq!(flow.dpkts, Some(5));
        assert_eq!(flow.bytes, Some(2048));
        assert_eq!(flow.duration, Some(0.5));
        assert_eq!(flow.state.as_deref(), Some("established"));
    }

    #[test]
    fn eve_non_flow_record_is_skipped_not_raised() {
        let mut n = Normalizer::new("%Y/%m/%d %H:%M:%S%.f");
        let alert = r#"{"event_type":"alert","src_ip":"10.0.0.5","dest_ip":"10.0.0.9"}"#;
        assert!(n.normalize(alert).expect("skip, not error").is_none());

        // The layout is now cached as self-describing: a later flow record
        // parses without re-detection.
        let line = r#"{"event_type":"flow","src_ip":"10.0.0.5","dest_ip":"10.0.0.9","flow":{"start":"2021-11-07T18:03:45.755132+0000","end":"2021-11-07T18:03:45.955132+0000","pkts_toserver":1,"pkts_toclient":1,"bytes_toserver":60,"bytes_toclient":60}}"#;
        assert!(n.normalize(line).expect("accepted").is_some());
    }

    #[test]
    fn icmp_record_without_ports_resolves_port_zero() {
        let mut n = Normalizer::new("%Y/%m/%d %H:%M:%S%.f");
        let line = r#"{"event_type":"flow","proto":"ICMP","src_ip":"10.0.0.5","dest_ip":"10.0.0.9","flow":{"start":"2021-11-07T18:03:45.755132+0000","end":"2021-11-07T18:03:45.955132+0000","pkts_toserver":1,"pkts_toclient":1,"bytes_toserver":60,"bytes_toclient":60}}"#;
        let flow = n.normalize(line).expect("accepted").expect("flow");
        assert_eq!(flow.sport, Some(0));
        assert_eq!(flow.dport, Some(0));
    }

    #[test]
    fn arp_record_parses_with_synthetic_uid() {
        let line = r#"{"ts":1636305825.755132,"operation":"request","src_mac":"2e:a4:18:f8:3d:02","dst_mac":"ff:ff:ff:ff:ff:ff","orig_h":"172.20.7.40","resp_h":"172.20.7.40","orig_hw":"2e:a4:18:f8:3d:02","resp_hw":"00:00:00:00:00:00"}"#;
        let arp = parse_arp_record(line).expect("arp record");
        assert_eq!(arp.operation, ArpOperation::Request);
        assert_eq!(arp.saddr, "172.20.7.40");
        assert_eq!(arp.dst_hw, "00:00:00:00:00:00");
        assert!(!arp.uid.is_empty());

        let again = parse_arp_record(line).expect("arp record");
        assert_ne!(arp.uid, again.uid);
    }

    #[test]
    fn unknown_arp_operation_is_dropped() {
        let line = r#"{"ts":1.0,"operation":"unknown","src_mac":"a","dst_mac":"b","orig_h":"c","resp_h":"d","orig_hw":"e","resp_hw":"f"}"#;
        assert!(parse_arp_record(line).is_none());
    }
}
