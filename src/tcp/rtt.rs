/*
                    RFC 6298 - S2. The Basic Algorithm

    (2.2) When the first RTT measurement R is made, the host MUST set

            SRTT <- R
            RTTVAR <- R/2
            RTO <- SRTT + max (G, K*RTTVAR)

          where K = 4.

    (2.3) When a subsequent RTT measurement R' is made, a host MUST set

            RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R'|
            SRTT <- (1 - alpha) * SRTT + alpha * R'

          The value of SRTT used in the update to RTTVAR is its value
          before updating SRTT itself using the second assignment.

          The above SHOULD be computed using alpha=1/8 and beta=1/4.
*/

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

const RTO_INITIAL: f64 = 1.0;
const RTO_MIN: f64 = 0.1;
const RTO_MAX: f64 = 10.0;
const RTTVAR_FLOOR: f64 = 0.01;

/// Adaptive retransmission timeout, all values in seconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: f64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            srtt: None,
            rttvar: 0.0,
            rto: RTO_INITIAL,
        }
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator::default()
    }

    /// Current retransmission timeout in seconds.
    pub fn rto(&self) -> f64 {
        self.rto
    }

    pub fn srtt(&self) -> Option<f64> {
        self.srtt
    }

    /// Feeds one RTT measurement. Callers enforce Karn's rule: samples must
    /// come from segments that were transmitted exactly once.
    pub fn on_sample(&mut self, sample: f64) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2.0;
            }
            Some(srtt) => {
                self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (sample - srtt).abs();
                self.srtt = Some((1.0 - ALPHA) * srtt + ALPHA * sample);
            }
        }

        self.rto = self.srtt.unwrap() + 4.0 * self.rttvar.max(RTTVAR_FLOOR);
        self.rto = self.rto.clamp(RTO_MIN, RTO_MAX);
    }
}
