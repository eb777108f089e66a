use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

/// Per-connection round-trip-time estimator, fed by probe round-trips.
///
/// Timestamps travel on the wire as nanoseconds relative to this connection's
///  reference instant; the pong echoes the value verbatim, so the difference to
///  "now" on receipt is the round trip. Samples feed an exponential moving
///  average and variance. The owning transport only feeds this while the
///  connection is handshaken.
pub struct PingInfo {
    reference_time: Instant,
    last_probe_sent: Option<Instant>,
    moving_mean_rtt_millis: Option<f64>,
    moving_variance_rtt_millis_squared: f64,
    new_sample_weight: f64,
}

impl PingInfo {
    pub fn new(new_sample_weight: f64) -> PingInfo {
        PingInfo {
            reference_time: Instant::now(),
            last_probe_sent: None,
            moving_mean_rtt_millis: None,
            moving_variance_rtt_millis_squared: 0.0,
            new_sample_weight,
        }
    }

    pub fn timestamp_nanos_now(&mut self) -> u64 {
        let elapsed = Instant::now().duration_since(self.reference_time);
        if let Ok(nanos) = u64::try_from(elapsed.as_nanos()) {
            return nanos;
        }
        // u64 nanoseconds hold for centuries, so overflow means the clock ran away
        error!("implausible elapsed time since the rtt reference instant, resetting it");
        self.reference_time = Instant::now();
        0
    }

    /// Whether the next probe should go out, evaluated by the application
    ///  thread during `update`.
    pub fn probe_due(&self, interval: Duration) -> bool {
        match self.last_probe_sent {
            None => true,
            Some(sent) => Instant::now().duration_since(sent) >= interval,
        }
    }

    pub fn on_probe_sent(&mut self) {
        self.last_probe_sent = Some(Instant::now());
    }

    pub fn on_probe_response(&mut self, echoed_timestamp_nanos: u64) {
        let rtt_nanos = match self.timestamp_nanos_now().checked_sub(echoed_timestamp_nanos) {
            Some(nanos) => nanos,
            None => {
                warn!("probe response with a timestamp from the future - ignoring");
                return;
            }
        };

        let rtt_millis = (rtt_nanos as f64) / 1_000_000.0;

        if let Some(prev) = self.moving_mean_rtt_millis {
            let alpha = self.new_sample_weight;

            let mean = rtt_millis * alpha + prev * (1.0 - alpha);
            self.moving_mean_rtt_millis = Some(mean);

            let s = (mean - rtt_millis).powi(2);
            self.moving_variance_rtt_millis_squared =
                s * alpha + self.moving_variance_rtt_millis_squared * (1.0 - alpha);
        }
        else {
            // first sample
            self.moving_mean_rtt_millis = Some(rtt_millis);
            self.moving_variance_rtt_millis_squared = 0.0;
        }
    }

    pub fn rtt_millis(&self) -> Option<f64> {
        self.moving_mean_rtt_millis
    }

    pub fn rtt_std_dev_millis(&self) -> f64 {
        self.moving_variance_rtt_millis_squared.sqrt()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_sample_sets_mean() {
        let mut ping = PingInfo::new(0.5);
        assert_eq!(ping.rtt_millis(), None);

        let sent = ping.timestamp_nanos_now();
        tokio::time::advance(Duration::from_millis(40)).await;
        ping.on_probe_response(sent);

        let rtt = ping.rtt_millis().unwrap();
        assert!((rtt - 40.0).abs() < 1.0, "rtt was {}", rtt);
        assert_eq!(ping.rtt_std_dev_millis(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_average_weights_new_samples() {
        let mut ping = PingInfo::new(0.5);

        let sent = ping.timestamp_nanos_now();
        tokio::time::advance(Duration::from_millis(100)).await;
        ping.on_probe_response(sent);

        let sent = ping.timestamp_nanos_now();
        tokio::time::advance(Duration::from_millis(20)).await;
        ping.on_probe_response(sent);

        // 0.5 * 20 + 0.5 * 100
        let rtt = ping.rtt_millis().unwrap();
        assert!((rtt - 60.0).abs() < 1.0, "rtt was {}", rtt);
        assert!(ping.rtt_std_dev_millis() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_timestamp_is_ignored() {
        let mut ping = PingInfo::new(0.5);
        ping.on_probe_response(u64::MAX);
        assert_eq!(ping.rtt_millis(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_due() {
        let interval = Duration::from_secs(1);
        let mut ping = PingInfo::new(0.5);
        assert!(ping.probe_due(interval));

        ping.on_probe_sent();
        assert!(!ping.probe_due(interval));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!ping.probe_due(interval));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(ping.probe_due(interval));
    }
}
