use std::time::Duration;

use anyhow::bail;

/// Configuration for the connection layer. There is one instance per process,
///  shared by the [crate::connect::ConnectionManager] and every connection it
///  creates.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Upper bound on the number of simultaneously live connections. This is the
    ///  size of the connection id pool: ids are drawn from `0..max_connections`
    ///  and returned on disposal, so exceeding this limit fails connection
    ///  construction rather than growing unboundedly.
    pub max_connections: usize,

    /// Artificial minimum delay before a received message becomes eligible for
    ///  dequeueing. This simulates (or bounds) network latency deterministically,
    ///  which is useful for testing and for fairness between local and remote
    ///  players. Zero disables the hold-back.
    pub simulated_lag: Duration,

    /// Interval between RTT probes on a handshaken duplex connection.
    pub ping_interval: Duration,

    /// Weight of a new RTT sample in the exponential moving average, in (0, 1].
    pub rtt_moving_avg_new_weight: f64,

    /// Maximum accepted body length of a single framed message. A frame header
    ///  declaring a larger body is treated as a protocol error.
    pub max_message_size: u32,

    /// A management connection that has not received a ping for this long
    ///  reports its liveness as lost.
    pub management_ping_timeout: Duration,

    /// Size of the scratch buffer used for chunked reads from the TCP stream.
    pub read_chunk_size: usize,
}

impl NetConfig {
    pub fn default_game() -> NetConfig {
        NetConfig {
            max_connections: 32,
            simulated_lag: Duration::ZERO,
            ping_interval: Duration::from_secs(1),
            rtt_moving_avg_new_weight: 0.5,
            max_message_size: 256 * 1024,
            management_ping_timeout: Duration::from_secs(60),
            read_chunk_size: 8 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be positive");
        }
        if !(self.rtt_moving_avg_new_weight > 0.0 && self.rtt_moving_avg_new_weight <= 1.0) {
            bail!("rtt_moving_avg_new_weight must be in (0, 1]");
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be positive");
        }
        if self.read_chunk_size == 0 {
            bail!("read_chunk_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_game_is_valid() {
        assert!(NetConfig::default_game().validate().is_ok());
    }

    #[rstest]
    #[case::zero_connections(|c: &mut NetConfig| c.max_connections = 0)]
    #[case::zero_weight(|c: &mut NetConfig| c.rtt_moving_avg_new_weight = 0.0)]
    #[case::excessive_weight(|c: &mut NetConfig| c.rtt_moving_avg_new_weight = 1.5)]
    #[case::zero_message_size(|c: &mut NetConfig| c.max_message_size = 0)]
    #[case::zero_chunk_size(|c: &mut NetConfig| c.read_chunk_size = 0)]
    fn test_validate_rejects(#[case] break_config: fn(&mut NetConfig)) {
        let mut config = NetConfig::default_game();
        break_config(&mut config);
        assert!(config.validate().is_err());
    }
}
