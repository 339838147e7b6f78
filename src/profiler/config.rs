use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Fallback time window width when none is configured or the configured
/// value is not positive.
pub const DEFAULT_WIDTH_SECS: f64 = 60.0;

/// Timestamp pattern of Argus-style delimited flow records. Self-describing
/// records carry ISO-8601 timestamps and do not use this.
pub const DEFAULT_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.f";

/// Profiler configuration, assembled once in `main` from CLI arguments.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Time window width in seconds; fixed per profile for its lifetime.
    pub width:       f64,
    /// Home network ranges. Empty means every valid source is profiled.
    pub home_nets:   Vec<IpNetwork>,
    /// strftime pattern for delimited timestamps.
    pub time_format: String,
}

impl ProfilerConfig {
    pub fn new(width: f64, home_nets: Vec<IpNetwork>, time_format: String) -> Self {
        Self {
            width: if width > 0.0 { width } else { DEFAULT_WIDTH_SECS },
            home_nets,
            time_format,
        }
    }

    /// Whether a source address is profiled under the home-network policy:
    /// with no ranges configured everything is, otherwise only sources inside
    /// at least one range. Destination-side profiling of outside sources is a
    /// deliberate extension point, not done here.
    pub fn profiles_source(&self, ip: IpAddr) -> bool {
        self.home_nets.is_empty() || self.home_nets.iter().any(|net| net.contains(ip))
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH_SECS, Vec::new(), DEFAULT_TIME_FORMAT.to_string())
    }
}
