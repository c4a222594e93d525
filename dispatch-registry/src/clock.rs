use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
/// Monotonic time source used for peer-liveness bookkeeping.
///
/// Production code runs on [`Clock::system`]; tests that need to drive
/// expiry deterministically run on [`Clock::manual`] and advance time by
/// hand. All readings are durations since the clock was created, so they
/// are only ever compared against each other.
pub struct Clock {
    inner: ClockInner,
}

#[derive(Clone)]
enum ClockInner {
    System { started: Instant },
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// A clock backed by the process monotonic clock.
    pub fn system() -> Self {
        Self {
            inner: ClockInner::System {
                started: Instant::now(),
            },
        }
    }

    /// A clock that only moves when [`ManualClock::advance`] is called.
    pub fn manual() -> (Self, ManualClock) {
        let millis = Arc::new(AtomicU64::new(0));
        let clock = Self {
            inner: ClockInner::Manual(millis.clone()),
        };
        (clock, ManualClock(millis))
    }

    /// Time elapsed since the clock was created.
    pub fn now(&self) -> Duration {
        match &self.inner {
            ClockInner::System { started } => started.elapsed(),
            ClockInner::Manual(millis) => {
                Duration::from_millis(millis.load(Ordering::Relaxed))
            },
        }
    }
}

#[derive(Clone)]
/// The driving half of a manual [`Clock`].
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Move the paired clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }
}
