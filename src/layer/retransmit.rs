use std::time::Instant;

use log::debug;

use crate::utils::{AckBitmap, RttEstimator};

/// End-to-end acknowledgment state of one fragmented datagram.
///
/// A round ends when the fragment carrying the ack request goes out; the
/// timer covers the time until an acknowledgment answers it.
#[derive(Debug)]
pub struct RetransmitState {
    acked: AckBitmap,
    last_seq: u8,
    rounds: u32,
    max_rounds: u32,
    timed_out: bool,
    round_start: Option<Instant>,
    estimator: RttEstimator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Every fragment is acknowledged.
    Complete,
    /// The receiver gave up on the datagram.
    Aborted,
    RetriesExhausted,
    /// A new round must carry these fragments.
    Resend(AckBitmap),
    /// Acknowledgment for a round still being sent.
    Progress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    RetriesExhausted,
    Resend(AckBitmap),
}

impl RetransmitState {
    #[must_use]
    pub fn new(last_seq: u8, max_rounds: u32, estimator: RttEstimator) -> Self {
        let this = Self {
            acked: AckBitmap::new(),
            last_seq,
            rounds: 0,
            max_rounds,
            timed_out: false,
            round_start: None,
            estimator,
        };
        this.check_rep();
        this
    }

    #[inline]
    fn check_rep(&self) {
        assert!(self.acked.bits() & !AckBitmap::through(self.last_seq).bits() == 0);
    }

    /// The ack-request fragment of this round just went out.
    ///
    /// Returns the deadline for the retransmission timer.
    pub fn start_round(&mut self, now: Instant) -> Instant {
        // a repeated round start keeps the earliest send time
        if self.round_start.is_none() {
            self.round_start = Some(now);
        }
        now + self.estimator.rto()
    }

    #[must_use]
    #[inline]
    fn awaiting(&self) -> bool {
        self.round_start.is_some()
    }

    pub fn on_timeout(&mut self) -> TimeoutOutcome {
        // Karn: the sample of this round is ambiguous from now on
        self.timed_out = true;
        self.round_start = None;
        self.rounds += 1;
        debug!("rto fired; round {}", self.rounds);
        if self.rounds > self.max_rounds {
            return TimeoutOutcome::RetriesExhausted;
        }
        // The ack request rides on the highest missing fragment rather than
        // the last one: it fills a gap while asking for the bitmap, and the
        // last fragment may already be held by the receiver.
        let missing = self.acked.missing_through(self.last_seq);
        let mut resend = AckBitmap::new();
        resend.set(missing.highest().unwrap_or(self.last_seq));
        self.check_rep();
        TimeoutOutcome::Resend(resend)
    }

    pub fn on_ack(&mut self, bitmap: AckBitmap, now: Instant) -> AckOutcome {
        if bitmap.is_empty() {
            return AckOutcome::Aborted;
        }
        let awaiting = self.awaiting();
        self.acked
            .merge(AckBitmap::from_bits(bitmap.bits() & AckBitmap::through(self.last_seq).bits()));
        if let Some(start) = self.round_start.take() {
            if !self.timed_out {
                self.estimator
                    .update(now.saturating_duration_since(start));
            }
        }
        if self.acked.all_set_through(self.last_seq) {
            self.check_rep();
            return AckOutcome::Complete;
        }
        if !awaiting {
            if self.timed_out {
                // late answer to the round that timed out; it replaces the
                // planned ack-request resend and the timeout already counted
                self.timed_out = false;
                self.check_rep();
                return AckOutcome::Resend(self.acked.missing_through(self.last_seq));
            }
            self.check_rep();
            return AckOutcome::Progress;
        }
        self.rounds += 1;
        debug!("partial ack; round {}", self.rounds);
        if self.rounds > self.max_rounds {
            return AckOutcome::RetriesExhausted;
        }
        self.timed_out = false;
        self.check_rep();
        AckOutcome::Resend(self.acked.missing_through(self.last_seq))
    }

    #[must_use]
    #[inline]
    pub fn acked(&self) -> AckBitmap {
        self.acked
    }

    #[must_use]
    #[inline]
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    #[must_use]
    #[inline]
    pub fn estimator(&self) -> &RttEstimator {
        &self.estimator
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::utils::RttEstimatorBuilder;

    use super::*;

    fn state(last_seq: u8, max_rounds: u32) -> RetransmitState {
        RetransmitState::new(
            last_seq,
            max_rounds,
            RttEstimatorBuilder::default().build().unwrap(),
        )
    }

    #[test]
    fn test_complete_takes_sample() {
        let now = Instant::now();
        let mut rt = state(4, 3);
        let deadline = rt.start_round(now);
        assert_eq!(deadline, now + Duration::from_millis(3000));
        let outcome = rt.on_ack(
            AckBitmap::through(4),
            now + Duration::from_millis(200),
        );
        assert_eq!(outcome, AckOutcome::Complete);
        assert_eq!(rt.estimator().samples(), 1);
        assert_eq!(rt.estimator().srtt(), Duration::from_millis(900));
    }

    #[test]
    fn test_karn_after_timeout() {
        let now = Instant::now();
        let mut rt = state(4, 3);
        rt.start_round(now);
        let outcome = rt.on_timeout();
        assert_eq!(outcome, TimeoutOutcome::Resend(AckBitmap::from_bits(0b10000)));

        // retransmitted ack-request goes out, then the delayed ack arrives
        rt.start_round(now + Duration::from_millis(3000));
        let outcome = rt.on_ack(
            AckBitmap::from_bits(0b01111),
            now + Duration::from_millis(3100),
        );
        assert_eq!(outcome, AckOutcome::Resend(AckBitmap::from_bits(0b10000)));
        assert_eq!(rt.estimator().samples(), 0);
        assert_eq!(rt.estimator().srtt(), Duration::from_millis(1000));

        // next round is clean again
        rt.start_round(now + Duration::from_millis(3200));
        let outcome = rt.on_ack(
            AckBitmap::through(4),
            now + Duration::from_millis(3400),
        );
        assert_eq!(outcome, AckOutcome::Complete);
        assert_eq!(rt.estimator().samples(), 1);
    }

    #[test]
    fn test_timeout_resends_highest_missing() {
        let now = Instant::now();
        let mut rt = state(4, 5);
        rt.start_round(now);
        assert_eq!(
            rt.on_ack(AckBitmap::from_bits(0b00101), now),
            AckOutcome::Resend(AckBitmap::from_bits(0b11010))
        );
        rt.start_round(now);
        assert_eq!(
            rt.on_timeout(),
            TimeoutOutcome::Resend(AckBitmap::from_bits(0b10000))
        );
        assert_eq!(rt.rounds(), 2);
    }

    #[test]
    fn test_retries_exhausted() {
        let now = Instant::now();
        let mut rt = state(1, 2);
        rt.start_round(now);
        assert!(matches!(rt.on_timeout(), TimeoutOutcome::Resend(_)));
        rt.start_round(now);
        assert!(matches!(rt.on_timeout(), TimeoutOutcome::Resend(_)));
        rt.start_round(now);
        assert_eq!(rt.on_timeout(), TimeoutOutcome::RetriesExhausted);
    }

    #[test]
    fn test_partial_ack_after_timeout() {
        let now = Instant::now();
        let mut rt = state(4, 5);
        rt.start_round(now);
        assert_eq!(
            rt.on_timeout(),
            TimeoutOutcome::Resend(AckBitmap::from_bits(0b10000))
        );

        // the ack of the timed-out round overtakes the planned resend
        let outcome = rt.on_ack(
            AckBitmap::from_bits(0b11011),
            now + Duration::from_millis(3100),
        );
        assert_eq!(outcome, AckOutcome::Resend(AckBitmap::from_bits(0b00100)));
        assert_eq!(rt.rounds(), 1);
        assert_eq!(rt.estimator().samples(), 0);

        rt.start_round(now + Duration::from_millis(3200));
        let outcome = rt.on_ack(
            AckBitmap::through(4),
            now + Duration::from_millis(3400),
        );
        assert_eq!(outcome, AckOutcome::Complete);
        assert_eq!(rt.estimator().samples(), 1);
    }

    #[test]
    fn test_null_ack_aborts() {
        let mut rt = state(3, 2);
        let now = Instant::now();
        rt.start_round(now);
        assert_eq!(rt.on_ack(AckBitmap::new(), now), AckOutcome::Aborted);
    }

    #[test]
    fn test_progress_outside_round() {
        let mut rt = state(3, 2);
        let now = Instant::now();
        assert_eq!(
            rt.on_ack(AckBitmap::from_bits(0b0011), now),
            AckOutcome::Progress
        );
        assert_eq!(rt.rounds(), 0);
        assert_eq!(rt.acked().bits(), 0b0011);
    }
}
