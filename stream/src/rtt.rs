use std::time::Duration;

/// Smoothed RTT estimator in the shape of RFC 6298: `srtt` converges with gain 1/8,
///  `rttvar` with gain 1/4, and the retransmission timeout is `srtt + 4 * rttvar`
///  clamped to the configured bounds.
#[derive(Debug)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,

    initial_rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> RttEstimator {
        RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            initial_rto,
            min_rto,
            max_rto,
        }
    }

    /// Feed one RTT sample, taken from a packet that was acked without having been
    ///  retransmitted (Karn's rule is the caller's responsibility).
    pub fn on_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if sample > srtt { sample - srtt } else { srtt - sample };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rto(&self) -> Duration {
        match self.srtt {
            None => self.initial_rto,
            Some(srtt) => (srtt + 4 * self.rttvar).clamp(self.min_rto, self.max_rto),
        }
    }
}
