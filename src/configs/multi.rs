use serde::{Deserialize, Serialize};

use crate::audio::constants::{
    DEFAULT_BUFFER_PERIODS, DEFAULT_CLIENT_THRESHOLD_PERIODS, DEFAULT_DRAIN_SETTLE_NS,
    DEFAULT_MAX_CLIENTS, DEFAULT_MIX_THRESHOLD_PERIODS,
};

/// Tunables of the multi-client mixer, one instance per transport PCM.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct MultiConfig {
    /// Master switch; when false the whole subsystem is bypassed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Mix buffer capacity in periods.
    #[serde(default = "default_buffer_periods")]
    pub buffer_periods: usize,
    /// Periods queued in the mix before the transport is woken (2..=4).
    #[serde(default = "default_mix_threshold")]
    pub mix_threshold: usize,
    /// Periods a client buffers locally before it starts streaming.
    #[serde(default = "default_client_threshold")]
    pub client_threshold: usize,
    /// Settle time between a drained pipe and the drain ack.
    #[serde(default = "default_drain_settle_ns")]
    pub drain_settle_ns: u64,
}

impl MultiConfig {
    /// Clamp free-form config values into their legal ranges.
    pub fn validated(mut self) -> Self {
        self.mix_threshold = self.mix_threshold.clamp(2, 4);
        self.client_threshold = self.client_threshold.max(1);
        self.buffer_periods = self.buffer_periods.max(self.mix_threshold + 2);
        self.max_clients = self.max_clients.max(1);
        self
    }
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_clients: default_max_clients(),
            buffer_periods: default_buffer_periods(),
            mix_threshold: default_mix_threshold(),
            client_threshold: default_client_threshold(),
            drain_settle_ns: default_drain_settle_ns(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_buffer_periods() -> usize {
    DEFAULT_BUFFER_PERIODS
}

fn default_mix_threshold() -> usize {
    DEFAULT_MIX_THRESHOLD_PERIODS
}

fn default_client_threshold() -> usize {
    DEFAULT_CLIENT_THRESHOLD_PERIODS
}

fn default_drain_settle_ns() -> u64 {
    DEFAULT_DRAIN_SETTLE_NS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validated_clamps_thresholds() {
        let cfg = MultiConfig {
            mix_threshold: 9,
            client_threshold: 0,
            max_clients: 0,
            ..Default::default()
        }
        .validated();
        assert_eq!(cfg.mix_threshold, 4);
        assert_eq!(cfg.client_threshold, 1);
        assert_eq!(cfg.max_clients, 1);
    }

    #[test]
    fn validated_keeps_large_client_limits() {
        let cfg = MultiConfig { max_clients: 64, ..Default::default() }.validated();
        assert_eq!(cfg.max_clients, 64);
    }
}
