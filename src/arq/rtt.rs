//! Round-trip time estimation.
//!
//! Jacobson/Karels smoothing with the classic 1/8 gain on the mean and 1/4 on
//! the deviation. Retransmitted segments never produce samples (Karn's rule),
//! so the backoff path only touches the timeout, never the estimate.

use std::time::Duration;

/// Timeout before the first sample arrives.
pub const INITIAL_RTO: Duration = Duration::from_millis(500);

/// Lower bound for the retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Upper bound for the retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(5);

/// Smoothed RTT state plus the derived retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
}

impl RttEstimator {
    /// Create an estimator with no samples and the initial timeout.
    pub fn new() -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTO,
        }
    }

    /// Feed one fresh (non-retransmitted) sample.
    pub fn on_sample(&mut self, sample: Duration) {
        if self.srtt.is_zero() {
            self.srtt = sample;
            self.rttvar = sample / 2;
        } else {
            let diff = if self.srtt > sample {
                self.srtt - sample
            } else {
                sample - self.srtt
            };
            self.rttvar = (self.rttvar * 3 + diff) / 4;
            self.srtt = (self.srtt * 7 + sample) / 8;
        }

        self.rto = (self.srtt + self.rttvar * 4).clamp(MIN_RTO, MAX_RTO);
    }

    /// Double the timeout after a retransmission, capped at [`MAX_RTO`].
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Current smoothed RTT (zero before the first sample).
    pub fn srtt(&self) -> Duration {
        self.srtt
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
