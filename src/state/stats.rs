use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent samples kept for display
pub const HISTORY_LEN: usize = 10;

/// Streaming per-hop statistics
///
/// Counters are only advanced through [`HopStats::record_send`] and
/// [`HopStats::record_round_trip`]; [`HopStats::recompute_loss`] refreshes the
/// cached loss percentage afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct HopStats {
    pub sent: u64,
    pub received: u64,
    /// Loss percentage in [0, 100]
    pub loss: f64,
    pub last: Duration,
    pub best: Duration,
    pub worst: Duration,
    pub avg: Duration,
    pub stddev: Duration,
    /// Most recent samples, oldest first
    pub history: VecDeque<Duration>,

    // Welford's online algorithm state (nanoseconds)
    mean: f64,
    m2: f64,
    samples: u64,
}

impl Default for HopStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HopStats {
    pub fn new() -> Self {
        Self {
            sent: 0,
            received: 0,
            loss: 0.0,
            last: Duration::ZERO,
            best: Duration::ZERO,
            worst: Duration::ZERO,
            avg: Duration::ZERO,
            stddev: Duration::ZERO,
            history: VecDeque::with_capacity(HISTORY_LEN),
            mean: 0.0,
            m2: 0.0,
            samples: 0,
        }
    }

    /// Count one probe sent
    pub fn record_send(&mut self) {
        self.sent += 1;
    }

    /// Count one response and feed its round-trip time to the estimators
    pub fn record_round_trip(&mut self, rtt: Duration) {
        self.received += 1;
        self.last = rtt;

        // Best/worst are seeded by the first sample
        if self.samples == 0 || rtt < self.best {
            self.best = rtt;
        }
        if self.samples == 0 || rtt > self.worst {
            self.worst = rtt;
        }

        self.samples += 1;
        let x = rtt.as_nanos() as f64;
        let delta = x - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (x - self.mean);

        self.avg = Duration::from_nanos(self.mean.max(0.0) as u64);
        self.stddev = if self.samples > 1 {
            let variance = (self.m2 / (self.samples - 1) as f64).max(0.0);
            Duration::from_nanos(variance.sqrt() as u64)
        } else {
            Duration::ZERO
        };

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(rtt);
    }

    /// Refresh `loss` from the counters
    pub fn recompute_loss(&mut self) {
        self.loss = if self.sent == 0 {
            0.0
        } else {
            let lost = self.sent.saturating_sub(self.received) as f64;
            (lost / self.sent as f64 * 100.0).clamp(0.0, 100.0)
        };
    }

    /// Number of samples fed to the estimators
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_initial_state() {
        let stats = HopStats::new();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.received, 0);
        assert_eq!(stats.loss, 0.0);
        assert_eq!(stats.best, Duration::ZERO);
        assert!(stats.history.is_empty());
    }

    #[test]
    fn test_full_loss() {
        let mut stats = HopStats::new();
        for _ in 0..3 {
            stats.record_send();
        }
        stats.recompute_loss();
        assert_eq!(stats.loss, 100.0);
    }

    #[test]
    fn test_single_sample() {
        let mut stats = HopStats::new();
        stats.record_send();
        stats.record_round_trip(ms(10));
        stats.recompute_loss();

        assert_eq!(stats.loss, 0.0);
        assert_eq!(stats.best, ms(10));
        assert_eq!(stats.worst, ms(10));
        assert_eq!(stats.last, ms(10));
        assert_eq!(stats.avg, ms(10));
        assert_eq!(stats.stddev, Duration::ZERO); // needs 2+ samples
    }

    #[test]
    fn test_sample_stddev() {
        let mut stats = HopStats::new();
        stats.record_send();
        stats.record_round_trip(ms(10));
        stats.record_send();
        stats.record_round_trip(ms(20));

        assert_eq!(stats.avg, ms(15));
        // sqrt(((5ms)^2 + (5ms)^2) / (2 - 1)) = 7.0710678ms
        let got = stats.stddev.as_secs_f64() * 1000.0;
        assert!((got - 7.071).abs() < 0.01, "stddev {got}");
        assert_eq!(stats.best, ms(10));
        assert_eq!(stats.worst, ms(20));
        assert_eq!(stats.last, ms(20));
    }

    #[test]
    fn test_partial_loss() {
        let mut stats = HopStats::new();
        stats.record_send();
        stats.recompute_loss();
        assert_eq!(stats.loss, 100.0);

        stats.record_send();
        stats.record_round_trip(ms(5));
        stats.recompute_loss();
        assert_eq!(stats.loss, 50.0);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut stats = HopStats::new();
        for i in 1..=12 {
            stats.record_send();
            stats.record_round_trip(ms(i));
        }
        assert_eq!(stats.history.len(), HISTORY_LEN);
        assert_eq!(stats.history.front(), Some(&ms(3)));
        assert_eq!(stats.history.back(), Some(&ms(12)));
        // Estimators still cover every sample
        assert_eq!(stats.samples(), 12);
        assert_eq!(stats.best, ms(1));
    }

    #[test]
    fn test_loss_clamped_when_counters_disagree() {
        let mut stats = HopStats::new();
        stats.record_round_trip(ms(1));
        stats.recompute_loss();
        assert_eq!(stats.loss, 0.0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn proptest_loss_in_range(sent in 0u64..200, received in 0u64..200) {
                let mut stats = HopStats::new();
                for _ in 0..sent {
                    stats.record_send();
                }
                for _ in 0..received.min(sent) {
                    stats.record_round_trip(Duration::from_millis(1));
                }
                stats.recompute_loss();
                prop_assert!(stats.sent >= stats.received);
                prop_assert!((0.0..=100.0).contains(&stats.loss));
            }

            #[test]
            fn proptest_best_avg_worst_ordered(
                samples in prop::collection::vec(1u64..5_000, 1..50),
            ) {
                let mut stats = HopStats::new();
                for s in &samples {
                    stats.record_send();
                    stats.record_round_trip(Duration::from_micros(*s));
                }
                prop_assert!(stats.best <= stats.worst);
                // Truncation to whole nanoseconds can put avg 1ns below best
                prop_assert!(stats.avg + Duration::from_nanos(1) >= stats.best);
                prop_assert!(stats.avg <= stats.worst);
                prop_assert!(stats.history.len() <= HISTORY_LEN);
            }
        }
    }
}
