//! Round-trip-time tracking: a small ring of recent ping samples with a cached sum, so the
//!  reported latency is a running mean rather than the last (possibly outlying) measurement.

/// Number of round-trip samples that contribute to the reported mean.
const RTT_WINDOW: usize = 5;

/// The ring starts out filled with zeros - the reported mean climbs towards the real
///  round-trip time over the first [`RTT_WINDOW`] pings, which matches the upstream
///  implementation's behaviour.
#[derive(Debug)]
pub struct RttTracker {
    samples: [f64; RTT_WINDOW],
    next: usize,
    cached_sum: f64,
}

impl RttTracker {
    pub fn new() -> RttTracker {
        RttTracker {
            samples: [0.0; RTT_WINDOW],
            next: 0,
            cached_sum: 0.0,
        }
    }

    /// Evicts the oldest sample and records `rtt_millis` in its place.
    pub fn add_sample(&mut self, rtt_millis: f64) {
        self.cached_sum -= self.samples[self.next];
        self.cached_sum += rtt_millis;
        self.samples[self.next] = rtt_millis;
        self.next = (self.next + 1) % RTT_WINDOW;
    }

    /// Arithmetic mean over the whole ring, in milliseconds.
    pub fn mean_millis(&self) -> f64 {
        self.cached_sum / RTT_WINDOW as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initially_zero() {
        assert_eq!(RttTracker::new().mean_millis(), 0.0);
    }

    #[test]
    fn test_mean_over_full_ring() {
        let mut rtt = RttTracker::new();
        for sample in [10.0, 20.0, 30.0, 40.0, 50.0] {
            rtt.add_sample(sample);
        }
        assert_eq!(rtt.mean_millis(), 30.0);
    }

    #[test]
    fn test_partial_ring_averages_against_zeros() {
        let mut rtt = RttTracker::new();
        rtt.add_sample(50.0);
        assert_eq!(rtt.mean_millis(), 10.0);
    }

    #[test]
    fn test_oldest_sample_is_evicted() {
        let mut rtt = RttTracker::new();
        for sample in [100.0, 10.0, 20.0, 30.0, 40.0, 50.0] {
            rtt.add_sample(sample);
        }
        // the initial 100 has been pushed out
        assert_eq!(rtt.mean_millis(), 30.0);
    }
}
