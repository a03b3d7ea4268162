use crate::{
    clock::{Clock, SystemClock},
    error::TimerError,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Remaining and overrun time for a timer, as reported by
/// [`Timer::time_status`]. At most one of the two is non-zero; both are zero
/// exactly at the deadline instant, which counts as due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeStatus {
    pub remaining: Duration,
    pub overrun: Duration,
}

impl TimeStatus {
    pub fn is_due(&self) -> bool {
        self.remaining.is_zero()
    }
}

/// A monotonic deadline primitive: holds a run length and answers "has this
/// elapsed?" and "how much time remains or overran?".
///
/// Once rung, a timer stays rung until the next [`begin`](Timer::begin). A
/// timer that has never been armed reads as due with zero overrun, so an
/// owner that checks before arming arms it cleanly on the first pass.
///
/// The timer has no synchronization of its own; owners access it under
/// whatever lock they hold.
pub struct Timer {
    run_length: Duration,
    deadline: Option<Instant>,
    rang: bool,
    clock: Arc<dyn Clock>,
}

impl Timer {
    pub fn new(run_length: Duration) -> Self {
        Self::with_clock(run_length, Arc::new(SystemClock))
    }

    pub fn with_clock(run_length: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            run_length,
            deadline: None,
            rang: true,
            clock,
        }
    }

    /// Arms the timer: the deadline becomes now plus the run length.
    pub fn begin(&mut self) -> Result<(), TimerError> {
        self.begin_before(Duration::ZERO)
    }

    /// Arms the timer as if [`begin`](Timer::begin) had been called `offset`
    /// ago. Callers that know how much overhead elapsed since the previous
    /// deadline use this to keep a periodic schedule from drifting.
    pub fn begin_before(&mut self, offset: Duration) -> Result<(), TimerError> {
        let now = self.clock.now()?;
        // Clamp at the clock origin.
        let start = now.checked_sub(offset).unwrap_or(now);
        self.deadline = Some(start + self.run_length);
        self.rang = false;
        Ok(())
    }

    /// Reports whether the timer has rung. Sticky: once rung, repeated calls
    /// keep reporting rung without reading the clock.
    pub fn check(&mut self) -> Result<bool, TimerError> {
        if self.rang {
            return Ok(true);
        }
        self.time_status()?;
        Ok(self.rang)
    }

    /// Computes the remaining and overrun time, marking the timer rung when
    /// the deadline has passed.
    pub fn time_status(&mut self) -> Result<TimeStatus, TimerError> {
        let Some(deadline) = self.deadline else {
            // Never armed: due, with nothing overrun to compensate for.
            self.rang = true;
            return Ok(TimeStatus {
                remaining: Duration::ZERO,
                overrun: Duration::ZERO,
            });
        };

        let now = self.clock.now()?;
        if now < deadline {
            Ok(TimeStatus {
                remaining: deadline - now,
                overrun: Duration::ZERO,
            })
        } else {
            self.rang = true;
            Ok(TimeStatus {
                remaining: Duration::ZERO,
                overrun: now - deadline,
            })
        }
    }

    pub fn run_length(&self) -> Duration {
        self.run_length
    }

    /// Takes effect at the next arming; the current deadline is unchanged.
    pub fn set_run_length(&mut self, run_length: Duration) {
        self.run_length = run_length;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_rung(&self) -> bool {
        self.rang
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::{FailingClock, FakeClock};
    use test_case::test_case;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn setup(run_length: Duration) -> (Arc<FakeClock>, Timer) {
        let clock = Arc::new(FakeClock::new());
        let timer = Timer::with_clock(run_length, clock.clone());
        (clock, timer)
    }

    #[test_case(0; "zero")]
    #[test_case(100; "short")]
    #[test_case(3_600_000; "long")]
    fn run_length_round_trips(run_length: u64) {
        let (_clock, mut timer) = setup(ms(5));
        timer.set_run_length(ms(run_length));
        assert_eq!(ms(run_length), timer.run_length());
    }

    #[test]
    fn unarmed_timer_reads_as_due() {
        let (_clock, mut timer) = setup(ms(100));
        assert!(timer.has_rung());
        assert_eq!(None, timer.deadline());

        let status = timer.time_status().unwrap();
        assert!(status.is_due());
        assert_eq!(Duration::ZERO, status.overrun);
    }

    #[test_case(100; "short")]
    #[test_case(2_000; "long")]
    fn rings_after_run_length(run_length: u64) {
        let (clock, mut timer) = setup(ms(run_length));
        timer.begin().unwrap();
        assert!(!timer.check().unwrap());

        clock.advance(ms(run_length - 1));
        assert!(!timer.check().unwrap());

        clock.advance(ms(2));
        assert!(timer.check().unwrap());
    }

    #[test]
    fn zero_run_length_is_due_at_once() {
        let (_clock, mut timer) = setup(ms(0));
        timer.begin().unwrap();
        assert!(timer.check().unwrap());
    }

    #[test]
    fn rung_state_is_sticky_until_rearmed() {
        let (clock, mut timer) = setup(ms(50));
        timer.begin().unwrap();

        clock.advance(ms(60));
        assert!(timer.check().unwrap());
        assert!(timer.check().unwrap());

        timer.begin().unwrap();
        assert!(!timer.check().unwrap());
    }

    #[test]
    fn status_reports_remaining_before_the_deadline() {
        let (clock, mut timer) = setup(ms(100));
        timer.begin().unwrap();

        clock.advance(ms(40));
        let status = timer.time_status().unwrap();
        assert_eq!(ms(60), status.remaining);
        assert_eq!(Duration::ZERO, status.overrun);
        assert!(!status.is_due());
        assert!(!timer.has_rung());
    }

    #[test]
    fn status_reports_overrun_after_the_deadline() {
        let (clock, mut timer) = setup(ms(100));
        timer.begin().unwrap();

        clock.advance(ms(140));
        let status = timer.time_status().unwrap();
        assert_eq!(Duration::ZERO, status.remaining);
        assert_eq!(ms(40), status.overrun);
        assert!(status.is_due());
        assert!(timer.has_rung());
    }

    #[test]
    fn begin_before_shifts_the_deadline_back() {
        let (clock, mut timer) = setup(ms(100));
        clock.advance(ms(500));

        timer.begin().unwrap();
        let plain = timer.deadline().unwrap();

        timer.begin_before(ms(30)).unwrap();
        assert_eq!(Some(plain - ms(30)), timer.deadline());
    }

    #[test]
    fn clock_failure_surfaces_from_every_read() {
        let clock = Arc::new(FailingClock::new(1));
        let mut timer = Timer::with_clock(ms(100), clock);

        // The single good read arms the timer; everything after fails.
        timer.begin().unwrap();
        assert!(timer.begin().is_err());
        assert!(timer.time_status().is_err());
        assert!(timer.check().is_err());
    }
}
