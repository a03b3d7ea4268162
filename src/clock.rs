use crate::error::TimerError;
use std::time::Instant;

/// Source of monotonic time. Kept behind a trait so tests can drive
/// deadlines deterministically and exercise the clock-failure paths.
pub trait Clock: Send + Sync {
    fn now(&self) -> Result<Instant, TimerError>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<Instant, TimerError> {
        Ok(Instant::now())
    }
}

#[cfg(test)]
pub mod tests {
    use crate::clock::Clock;
    use crate::error::TimerError;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    pub struct FakeClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, by: Duration) {
            let mut guard = self.offset.lock();
            *guard += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Result<Instant, TimerError> {
            Ok(self.base + *self.offset.lock())
        }
    }

    /// Succeeds for a fixed number of reads, then fails on every read after.
    pub struct FailingClock {
        base: Instant,
        reads_left: Mutex<u32>,
    }

    impl FailingClock {
        pub fn new(good_reads: u32) -> Self {
            Self {
                base: Instant::now(),
                reads_left: Mutex::new(good_reads),
            }
        }
    }

    impl Clock for FailingClock {
        fn now(&self) -> Result<Instant, TimerError> {
            let mut reads_left = self.reads_left.lock();
            if *reads_left == 0 {
                return Err(TimerError::Clock {
                    reason: "injected failure",
                });
            }
            *reads_left -= 1;
            Ok(self.base)
        }
    }
}
