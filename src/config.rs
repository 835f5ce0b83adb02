//! Configuration for the link engines and the node layer.
//!
//! All timing, bandwidth and capacity constants of the link protocol live
//! here with their production defaults. Both structs deserialize from JSON
//! with every field optional, so a daemon config file only needs to name
//! the values it overrides.
//!
//! # Example
//!
//! ```
//! use modlink::config::LinkConfig;
//!
//! let config: LinkConfig = serde_json::from_str(r#"{ "pong_quota": 4 }"#).unwrap();
//! assert_eq!(config.pong_quota, 4);
//! assert_eq!(config.window_size, 16);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for the serial link engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Maximum number of unacknowledged data frames in the egress window.
    pub window_size: usize,
    /// Number of PONGs required before the handshake advances to
    /// INITIALISE.
    pub pong_quota: u32,
    /// Allowed egress bandwidth in bytes per second. Default is a 3 Mbaud
    /// UART at 10 bits per character.
    pub allowed_bandwidth: u64,
    /// Egress polling period while the window is non-empty or the
    /// handshake is in progress.
    pub active_period: Duration,
    /// Egress polling period once the window has drained.
    pub idle_period: Duration,
    /// Pause after the first ingress byte, letting the kernel accumulate a
    /// burst before the bulk read.
    pub accumulation_period: Duration,
    /// Delay before the egress cursor wraps from the window tail back to
    /// its head.
    pub cursor_reset_delay: Duration,
    /// Timeout for handing an application frame to the collector.
    pub submit_timeout: Duration,
    /// Maximum ingress latency in bytes; anything beyond this is skipped.
    pub max_ingress_backlog: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            window_size: 16,
            pong_quota: 256,
            allowed_bandwidth: 3_000_000 / 10,
            active_period: Duration::from_micros(2_500),
            idle_period: Duration::from_secs(1),
            accumulation_period: Duration::from_micros(2_500),
            cursor_reset_delay: Duration::from_micros(12_500),
            submit_timeout: Duration::from_secs(5),
            max_ingress_backlog: 16_384,
        }
    }
}

impl LinkConfig {
    /// Maximum number of bytes the egress engine may publish per cycle.
    pub fn cycle_byte_budget(&self) -> usize {
        (self.allowed_bandwidth as u128 * self.active_period.as_nanos() / 1_000_000_000) as usize
    }

    /// Number of egress cycles to hold off before the cursor wraps.
    pub fn cursor_reset_holdoff(&self) -> u32 {
        (self.cursor_reset_delay.as_nanos() / self.active_period.as_nanos().max(1)) as u32
    }

    /// Parse a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Configuration for the node multiplexing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bus address of this node (1-127). The daemon must not be anonymous,
    /// since it acts as the allocator.
    pub self_id: u8,
    /// Age after which an unanswered request is reclaimed by the sweep.
    pub request_expiry: Duration,
    /// Period of the background expiry sweep.
    pub sweep_period: Duration,
    /// Inactivity timeout resetting an in-progress allocation exchange.
    pub allocation_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            self_id: 127,
            request_expiry: Duration::from_secs(5),
            sweep_period: Duration::from_secs(1),
            allocation_timeout: Duration::from_millis(500),
        }
    }
}

impl NodeConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.window_size, 16);
        assert_eq!(config.pong_quota, 256);
        assert_eq!(config.allowed_bandwidth, 300_000);
        assert_eq!(config.active_period, Duration::from_micros(2_500));
        assert_eq!(config.idle_period, Duration::from_secs(1));
    }

    #[test]
    fn test_cycle_byte_budget() {
        let config = LinkConfig::default();
        // 300 kB/s over 2.5 ms is 750 bytes per cycle.
        assert_eq!(config.cycle_byte_budget(), 750);
    }

    #[test]
    fn test_cursor_reset_holdoff() {
        let config = LinkConfig::default();
        assert_eq!(config.cursor_reset_holdoff(), 5);
    }

    #[test]
    fn test_node_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.self_id, 127);
        assert_eq!(config.request_expiry, Duration::from_secs(5));
        assert_eq!(config.allocation_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_override() {
        let config = LinkConfig::from_json(r#"{ "window_size": 8 }"#).unwrap();
        assert_eq!(config.window_size, 8);
        assert_eq!(config.pong_quota, 256);
    }
}
