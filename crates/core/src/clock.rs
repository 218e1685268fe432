//! Monotonic time abstraction.
//!
//! All hold and deadline arithmetic goes through [`TimeSource`], which reports time as a
//! [`Duration`] since an arbitrary per-source epoch. Two sources are provided:
//!
//! - [`RealTime`] follows `tokio::time::Instant`. It is monotonic, unaffected by wall clock
//!   adjustments, and honours tokio's paused clock in tests.
//! - [`ManualClock`] only moves when [`ManualClock::advance`] is called. Sleeps registered on
//!   it resolve once the clock has been advanced past their deadline.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

pub trait TimeSource: Send + Sync + Clone + 'static {
    /// Current time since this source's epoch. Never decreases.
    fn now(&self) -> Duration;

    /// Future that resolves once `duration` has elapsed on this source.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Time elapsed since `earlier`, saturating at zero.
    fn elapsed_since(&self, earlier: Duration) -> Duration {
        self.now().saturating_sub(earlier)
    }
}

/// Real monotonic time, driven by the tokio clock.
#[derive(Clone, Debug)]
pub struct RealTime {
    epoch: tokio::time::Instant,
}

impl Default for RealTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RealTime {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl TimeSource for RealTime {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep one handle and hand another to
/// the component under test.
#[derive(Clone, Debug)]
pub struct ManualClock {
    current: Arc<watch::Sender<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self::starting_at(Duration::ZERO)
    }

    pub fn starting_at(start: Duration) -> Self {
        let (current, _) = watch::channel(start);
        Self {
            current: Arc::new(current),
        }
    }

    /// Moves the clock forward, waking every sleep whose deadline has been reached.
    pub fn advance(&self, by: Duration) {
        self.current.send_modify(|now| *now += by);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Duration {
        *self.current.borrow()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let deadline = self.now() + duration;
        let mut rx = self.current.subscribe();
        async move {
            // the sender lives as long as any clock handle; if every handle is gone nobody can
            // advance time any more, so there is nothing left to wait for
            let _ = rx.wait_for(|now| *now >= deadline).await;
        }
        .boxed()
    }
}
