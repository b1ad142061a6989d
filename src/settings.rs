//! Test settings.
//!
//! Settings are built once per test, either from command line flags or
//! from the flat JSON object used by language bindings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Duration used when none (or a non-positive one) is configured.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);

/// Settings for a single ndt7 test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Whether to connect with `ws://` instead of `wss://`.
    #[serde(default)]
    pub disable_tls: bool,

    /// Whether to accept any server certificate.
    #[serde(default)]
    pub skip_tls_verify: bool,

    /// Hostname or IP literal of the ndt7 server. Required.
    pub hostname: String,

    /// Optional port. An empty string is treated as absent.
    #[serde(default)]
    pub port: Option<String>,

    /// Optional test duration in seconds.
    #[serde(default)]
    pub duration: Option<i64>,

    /// Whether the server may end the download early once BBR converges.
    #[serde(default)]
    pub adaptive: bool,

    /// Whether to scramble a plaintext connection. Ignored with TLS.
    #[serde(default)]
    pub scramble: bool,
}

impl Settings {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self { hostname: hostname.into(), ..Self::default() }
    }

    /// Parse settings from the JSON object used by bindings.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The port, if one was given and is not empty.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref().filter(|p| !p.is_empty())
    }

    /// The duration explicitly requested from the server, if any.
    pub fn requested_duration(&self) -> Option<u64> {
        self.duration.filter(|d| *d > 0).map(|d| d as u64)
    }

    /// The duration the client budgets for the test.
    pub fn effective_duration(&self) -> Duration {
        self.requested_duration()
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DURATION)
    }

    pub fn use_tls(&self) -> bool {
        !self.disable_tls
    }

    /// Scrambling only applies to plaintext connections.
    pub fn scramble_enabled(&self) -> bool {
        self.scramble && self.disable_tls
    }
}
