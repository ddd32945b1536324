use std::time::Duration;

// SRTT gain 1/8, RTTVAR gain 1/4, RTTVAR weight 4
const ALPHA_SHIFT: u32 = 3;
const BETA_SHIFT: u32 = 2;
const K_SHIFT: u32 = 2;

const DEFAULT_SRTT_MS: u64 = 1_000;
const DEFAULT_RTTVAR_MS: u64 = 500;
const DEFAULT_GRANULARITY_MS: u64 = 10;
const MIN_RTO_MS: u64 = 200;
const MAX_RTO_MS: u64 = 60_000;

#[inline]
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Jacobson/Karels round-trip estimator on integer milliseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: u64,
    rttvar: u64,
    granularity: u64,
    min_rto: u64,
    max_rto: u64,
    samples: u32,
}

#[derive(Debug, Clone)]
pub struct RttEstimatorBuilder {
    pub initial_srtt: Duration,
    pub initial_rttvar: Duration,
    pub granularity: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
}

impl RttEstimatorBuilder {
    pub fn build(&self) -> Result<RttEstimator, EstimatorError> {
        if self.min_rto > self.max_rto {
            return Err(EstimatorError::RtoBounds);
        }
        if self.granularity.is_zero() {
            return Err(EstimatorError::ZeroGranularity);
        }
        let this = RttEstimator {
            srtt: millis(self.initial_srtt),
            rttvar: millis(self.initial_rttvar),
            granularity: millis(self.granularity),
            min_rto: millis(self.min_rto),
            max_rto: millis(self.max_rto),
            samples: 0,
        };
        this.check_rep();
        Ok(this)
    }

    #[must_use]
    pub fn default() -> Self {
        Self {
            initial_srtt: Duration::from_millis(DEFAULT_SRTT_MS),
            initial_rttvar: Duration::from_millis(DEFAULT_RTTVAR_MS),
            granularity: Duration::from_millis(DEFAULT_GRANULARITY_MS),
            min_rto: Duration::from_millis(MIN_RTO_MS),
            max_rto: Duration::from_millis(MAX_RTO_MS),
        }
    }
}

#[derive(Debug)]
pub enum EstimatorError {
    RtoBounds,
    ZeroGranularity,
}

impl RttEstimator {
    #[inline]
    fn check_rep(&self) {
        assert!(self.min_rto <= self.max_rto);
    }

    /// Feeds one round-trip sample.
    pub fn update(&mut self, sample: Duration) {
        let m = millis(sample);
        let delta = if m > self.srtt {
            m - self.srtt
        } else {
            self.srtt - m
        };
        // RTTVAR uses the SRTT from before this sample
        self.rttvar = self.rttvar - (self.rttvar >> BETA_SHIFT) + (delta >> BETA_SHIFT);
        self.srtt = self.srtt - (self.srtt >> ALPHA_SHIFT) + (m >> ALPHA_SHIFT);
        self.samples = self.samples.saturating_add(1);
        self.check_rep();
    }

    #[must_use]
    pub fn rto(&self) -> Duration {
        let var = std::cmp::max(self.granularity, self.rttvar.saturating_mul(1 << K_SHIFT));
        let rto = self.srtt.saturating_add(var).clamp(self.min_rto, self.max_rto);
        Duration::from_millis(rto)
    }

    #[must_use]
    #[inline]
    pub fn srtt(&self) -> Duration {
        Duration::from_millis(self.srtt)
    }

    #[must_use]
    #[inline]
    pub fn rttvar(&self) -> Duration {
        Duration::from_millis(self.rttvar)
    }

    #[must_use]
    #[inline]
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_rto() {
        let rtt = RttEstimatorBuilder::default().build().unwrap();
        // 1000 + 4 * 500
        assert_eq!(rtt.rto(), Duration::from_millis(3_000));
        assert_eq!(rtt.samples(), 0);
    }

    #[test]
    fn test_update() {
        let mut rtt = RttEstimatorBuilder::default().build().unwrap();
        rtt.update(Duration::from_millis(200));
        // rttvar = 500 - 125 + 800 / 4
        assert_eq!(rtt.rttvar(), Duration::from_millis(575));
        // srtt = 1000 - 125 + 25
        assert_eq!(rtt.srtt(), Duration::from_millis(900));
        assert_eq!(rtt.rto(), Duration::from_millis(900 + 4 * 575));
    }

    #[test]
    fn test_converges() {
        let mut rtt = RttEstimatorBuilder::default().build().unwrap();
        for _ in 0..200 {
            rtt.update(Duration::from_millis(40));
        }
        assert!(rtt.srtt() <= Duration::from_millis(48));
        // clamped by the lower bound
        assert_eq!(rtt.rto(), Duration::from_millis(MIN_RTO_MS));
    }

    #[test]
    fn test_huge_sample() {
        let mut rtt = RttEstimatorBuilder::default().build().unwrap();
        rtt.update(Duration::MAX);
        assert_eq!(rtt.samples(), 1);
        assert_eq!(rtt.rto(), Duration::from_millis(MAX_RTO_MS));
    }

    #[test]
    fn test_bounds() {
        let mut builder = RttEstimatorBuilder::default();
        builder.min_rto = Duration::from_secs(2);
        builder.max_rto = Duration::from_secs(1);
        assert!(builder.build().is_err());
    }
}
