//! Protocol configuration.

use std::time::Duration;

/// Tunable knobs of the SWIM engine.
///
/// The defaults suit a LAN deployment; lower the periods for tests and
/// raise them for high-latency links.
#[derive(Clone, Debug)]
pub struct SwimConfig {
    /// Interval between probe rounds.
    pub protocol_period: Duration,

    /// Per-probe ack timeout, reused for the indirect-probe wait.
    pub ping_timeout: Duration,

    /// Number of intermediaries asked for indirect probing.
    pub indirect_probe_count: usize,

    /// Suspicion timeout multiplier over the protocol period.
    pub suspicion_multiplier: f64,

    /// Upper bound on updates piggybacked per message.
    pub max_payload_size: usize,

    /// Base for the per-update dissemination budget.
    pub base_dissemination_limit: u32,

    /// How long Dead members are retained before garbage collection.
    /// `None` keeps them until their updates age out of the queue.
    pub dead_retention: Option<Duration>,

    /// Capacity of the event stream. When an observer lags past it, the
    /// oldest buffered events are dropped.
    pub event_buffer: usize,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            protocol_period: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(100),
            indirect_probe_count: 3,
            suspicion_multiplier: 5.0,
            max_payload_size: 10,
            base_dissemination_limit: 3,
            dead_retention: Some(Duration::from_secs(60)),
            event_buffer: 256,
        }
    }
}

impl SwimConfig {
    /// Suspicion timeout scaled to the current cluster size:
    /// `max(1, ln N) * multiplier * protocol_period`.
    pub fn suspicion_timeout(&self, members: usize) -> Duration {
        let n = members.max(2) as f64;
        let factor = n.ln().max(1.0) * self.suspicion_multiplier;
        self.protocol_period.mul_f64(factor)
    }

    /// Per-update transmit budget scaled to the current cluster size:
    /// `ceil(base * ln N)`.
    pub fn dissemination_limit(&self, members: usize) -> u32 {
        let n = members.max(2) as f64;
        (f64::from(self.base_dissemination_limit) * n.ln()).ceil() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SwimConfig::default();
        assert_eq!(config.protocol_period, Duration::from_millis(200));
        assert_eq!(config.ping_timeout, Duration::from_millis(100));
        assert_eq!(config.indirect_probe_count, 3);
        assert_eq!(config.max_payload_size, 10);
        assert_eq!(config.base_dissemination_limit, 3);
    }

    #[test]
    fn suspicion_timeout_never_drops_below_one_period_factor() {
        let config = SwimConfig {
            protocol_period: Duration::from_millis(30),
            suspicion_multiplier: 1.0,
            ..SwimConfig::default()
        };

        // ln(2) < 1, so the factor clamps to 1.0 for tiny clusters.
        assert_eq!(config.suspicion_timeout(2), Duration::from_millis(30));
        assert_eq!(config.suspicion_timeout(0), Duration::from_millis(30));

        // Larger clusters scale logarithmically.
        let big = config.suspicion_timeout(100);
        assert!(big > Duration::from_millis(130) && big < Duration::from_millis(145));
    }

    #[test]
    fn dissemination_limit_scales_with_cluster_size() {
        let config = SwimConfig::default();
        assert_eq!(config.dissemination_limit(2), 3);
        assert!(config.dissemination_limit(50) > config.dissemination_limit(5));
    }
}
