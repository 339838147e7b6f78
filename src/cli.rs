use clap::Parser;

/// flowsight — streaming flow profiler and network anomaly detection engine.
///
/// Reads flow records (Argus-style delimited text or Suricata-style JSON) and
/// ARP records, builds per-source-IP behavioral profiles bucketed into time
/// windows, and runs stateful detection heuristics over the resulting stream.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "flowsight",
    version = "0.1.0",
    about   = "Streaming flow profiler and network anomaly detection engine",
    long_about = None,
)]
pub struct Cli {
    // ── Input ────────────────────────────────────────────────────────────────

    /// Read flow records from this file.
    ///
    /// The format is auto-detected from the first line: JSON objects are
    /// treated as self-describing records (only `event_type == "flow"` entries
    /// are accepted); anything else is treated as delimited text with a header
    /// row, comma or tab separated. If neither --flows nor --arp is given,
    /// flow records are read from stdin.
    #[arg(short = 'f', long = "flows", value_name = "FILE")]
    pub flows: Option<String>,

    /// Read ARP records from this file (one JSON object per line).
    ///
    /// Records use the Zeek arp.log shape: ts, operation, src_mac, dst_mac,
    /// orig_h, resp_h, orig_hw, resp_hw. Each accepted record is profiled and
    /// republished to the detection modules.
    #[arg(short = 'a', long = "arp", value_name = "FILE")]
    pub arp: Option<String>,

    // ── Profiling ────────────────────────────────────────────────────────────

    /// Home network range in CIDR notation; may be given multiple times.
    ///
    /// When at least one range is configured, flows whose source lies outside
    /// every range are not profiled. The ARP detector also uses these ranges
    /// for its outside-local-network check; with no ranges configured it falls
    /// back to the RFC1918 private ranges.
    #[arg(short = 'n', long = "home-network", value_name = "CIDR")]
    pub home_networks: Vec<String>,

    /// Time window width in seconds.
    ///
    /// Fixed for the lifetime of every profile created during the run.
    /// Non-positive values fall back to the default.
    #[arg(short = 'w', long = "width", value_name = "SECS", default_value_t = 60.0)]
    pub width: f64,

    /// strftime pattern for timestamps in delimited flow records.
    ///
    /// Self-describing records carry their own ISO-8601 timestamps and ignore
    /// this setting.
    #[arg(long = "time-format", value_name = "FMT",
          default_value = "%Y/%m/%d %H:%M:%S%.f")]
    pub time_format: String,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Write log output to this file in addition to stdout.
    ///
    /// The file is created if it does not exist and appended to if it does.
    /// JSON mode (--json) affects the format written to this file as well.
    #[arg(short = 'o', long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,

    /// Emit log entries as newline-delimited JSON (NDJSON).
    ///
    /// Each event is a self-contained JSON object on its own line, suitable
    /// for ingestion by log shippers (Logstash, Fluentd, Vector) or SIEM
    /// platforms (Splunk, Elastic, Loki).
    #[arg(short = 'j', long = "json")]
    pub json: bool,
}
