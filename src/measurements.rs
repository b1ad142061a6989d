//! Measurement values exchanged during an ndt7 test.
//!
//! The same [`Measurement`] shape is used for what the client observes
//! locally and for what the server reports in text messages.

use serde::{Deserialize, Serialize};

/// Congestion-control estimates reported by the server.
///
/// Passed through untouched; the client never computes these. Older
/// servers used `max_bandwidth` and `min_rtt` as field names.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BbrInfo {
    /// Bandwidth estimate in bits per second.
    #[serde(alias = "max_bandwidth")]
    pub bandwidth: f64,
    /// Minimum round-trip time in milliseconds.
    #[serde(alias = "min_rtt")]
    pub rtt: f64,
}

/// A throughput sample: bytes transferred since the test began.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurement {
    /// Seconds elapsed since the beginning of the test.
    pub elapsed: f64,
    /// Bytes transferred since the beginning of the test.
    pub num_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbr_info: Option<BbrInfo>,
}

impl Measurement {
    pub const fn new(elapsed: f64, num_bytes: i64) -> Self {
        Self { elapsed, num_bytes, bbr_info: None }
    }

    /// Average throughput since the beginning of the test.
    ///
    /// # Returns
    /// Megabits per second, or 0.0 if no time has elapsed
    pub fn speed_mbps(&self) -> f64 {
        calculate_speed_mbps(self.num_bytes, self.elapsed)
    }
}

/// Convert a byte count over a number of seconds to Mbps.
pub fn calculate_speed_mbps(num_bytes: i64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 || num_bytes <= 0 {
        return 0.0;
    }

    (num_bytes as f64 * 8.0) / elapsed_secs / 1_000_000.0
}

/// Running summary of one test, kept by the CLI while draining events.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    /// Last locally observed measurement.
    pub local: Option<Measurement>,
    /// Last server-reported measurement.
    pub remote: Option<Measurement>,
    /// Highest bandwidth estimate reported by the server.
    pub max_bandwidth: Option<f64>,
    /// Lowest RTT reported by the server.
    pub min_rtt: Option<f64>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_local(&mut self, measurement: Measurement) {
        self.local = Some(measurement);
    }

    pub fn record_remote(&mut self, measurement: Measurement) {
        if let Some(bbr) = measurement.bbr_info {
            self.max_bandwidth = Some(
                self.max_bandwidth.map_or(bbr.bandwidth, |b| b.max(bbr.bandwidth)),
            );
            if bbr.rtt > 0.0 {
                self.min_rtt =
                    Some(self.min_rtt.map_or(bbr.rtt, |r| r.min(bbr.rtt)));
            }
        }
        self.remote = Some(measurement);
    }

    /// Client-side throughput in Mbps.
    pub fn local_speed_mbps(&self) -> Option<f64> {
        self.local.map(|m| m.speed_mbps())
    }

    /// Server-side throughput in Mbps.
    pub fn remote_speed_mbps(&self) -> Option<f64> {
        self.remote.map(|m| m.speed_mbps())
    }
}
