//! Restartable countdown that fires a callback once per run.
//!
//! Each [`DeadlineTimer::start`] begins a new run, tearing down the previous one first. A run
//! waits in slices of at most `tick`, re-reading the monotonic clock after every slice, so a
//! long countdown neither drifts with oversleeping nor lingers after it has been cancelled.
//!
//! ```text
//! Idle ──start──→ Running ──elapsed >= duration──→ Expired (callback fires) ──→ Idle
//!                    │
//!                    └──stop / start / drop──→ Cancelled (callback never fires)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::clock::{RealTime, TimeSource};
use crate::config::DEFAULT_TICK_GRANULARITY;
use crate::executor::TaskExecutor;

const MIN_TICK: Duration = Duration::from_millis(1);

type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

pub struct DeadlineTimer<T: TimeSource = RealTime> {
    shared: Arc<TimerShared>,
    time_source: T,
    executor: TaskExecutor,
    tick: Duration,
}

struct TimerShared {
    on_expired: Callback,
    state: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    /// Incremented for every run; a run may only fire while it is still the active one.
    generation: u64,
    active: Option<ActiveRun>,
}

struct ActiveRun {
    generation: u64,
    task: JoinHandle<()>,
}

impl DeadlineTimer<RealTime> {
    /// Timer on the real monotonic clock, spawning runs on the caller's runtime.
    pub fn new(on_expired: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_parts(on_expired, RealTime::new(), TaskExecutor::current())
    }
}

impl<T: TimeSource> DeadlineTimer<T> {
    pub fn with_parts(
        on_expired: impl Fn() + Send + Sync + 'static,
        time_source: T,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                on_expired: Arc::new(on_expired),
                state: Mutex::new(RunState::default()),
            }),
            time_source,
            executor,
            tick: DEFAULT_TICK_GRANULARITY,
        }
    }

    /// Sets the longest single wait of a run. Values below one millisecond are raised to one.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(MIN_TICK);
        self
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Cancels any live run and starts counting down `duration` from now.
    pub fn start(&self, duration: Duration) {
        let mut state = self.shared.state.lock();
        if let Some(previous) = state.active.take() {
            previous.task.abort();
            tracing::trace!(generation = previous.generation, "deadline run replaced");
        }
        state.generation += 1;
        let generation = state.generation;
        let started_at = self.time_source.now();
        let task = self.executor.spawn(countdown(
            self.shared.clone(),
            self.time_source.clone(),
            self.tick,
            duration,
            started_at,
            generation,
        ));
        state.active = Some(ActiveRun { generation, task });
        tracing::debug!(generation, ?duration, "deadline timer started");
    }

    /// Cancels the live run, if any. Once this returns the run's callback will not fire.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if let Some(run) = state.active.take() {
            run.task.abort();
            tracing::debug!(generation = run.generation, "deadline timer stopped");
        }
    }

    /// Whether a run is counting down and has not yet fired.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().active.is_some()
    }
}

impl<T: TimeSource> Drop for DeadlineTimer<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn countdown<T: TimeSource>(
    shared: Arc<TimerShared>,
    time_source: T,
    tick: Duration,
    duration: Duration,
    started_at: Duration,
    generation: u64,
) {
    loop {
        let elapsed = time_source.elapsed_since(started_at);
        if elapsed >= duration {
            break;
        }
        let remaining = duration - elapsed;
        time_source.sleep(remaining.min(tick)).await;
    }

    {
        // commit point: after this the run is expired and a concurrent stop() is a no-op
        let mut state = shared.state.lock();
        match &state.active {
            Some(run) if run.generation == generation => state.active = None,
            _ => return,
        }
    }
    tracing::debug!(generation, "deadline reached");
    // invoked outside the lock so the callback may start or stop this same timer
    (shared.on_expired)();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Instant};

    fn counting_timer() -> (DeadlineTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = DeadlineTimer::new({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        (timer, fired)
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn fires_once_after_duration() {
        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let timer = DeadlineTimer::new({
            let fired_at = fired_at.clone();
            move || fired_at.lock().push(Instant::now())
        });
        let start = Instant::now();
        timer.start(Duration::from_millis(500));
        assert!(timer.is_running());

        sleep(Duration::from_millis(499)).await;
        assert!(fired_at.lock().is_empty());

        sleep(Duration::from_secs(2)).await;
        let fired_at = fired_at.lock();
        assert_eq!(fired_at.len(), 1);
        let elapsed = fired_at[0] - start;
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500) + timer.tick(), "{elapsed:?}");
        assert!(!timer.is_running());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn stop_prevents_callback() {
        let (timer, fired) = counting_timer();
        timer.start(Duration::from_millis(500));
        sleep(Duration::from_millis(100)).await;
        timer.stop();
        assert!(!timer.is_running());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn restart_replaces_previous_run() {
        let (timer, fired) = counting_timer();
        timer.start(Duration::from_millis(500));
        sleep(Duration::from_millis(300)).await;
        timer.start(Duration::from_millis(500));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "old run must not fire");

        sleep(Duration::from_millis(201)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn survives_many_start_stop_cycles() {
        let (timer, fired) = counting_timer();
        for i in 0..100u64 {
            timer.start(Duration::from_millis(50 + i));
            if i % 3 == 0 {
                sleep(Duration::from_millis(10)).await;
            }
            timer.stop();
            timer.stop();
        }
        timer.start(Duration::from_millis(50));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn can_run_again_after_expiry() {
        let (timer, fired) = counting_timer();
        timer.stop();
        timer.start(Duration::from_millis(20));
        sleep(Duration::from_millis(50)).await;
        timer.start(Duration::from_millis(20));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn zero_duration_fires_promptly() {
        let (timer, fired) = counting_timer();
        timer.start(Duration::ZERO);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn dropping_timer_cancels_run() {
        let (timer, fired) = counting_timer();
        timer.start(Duration::from_millis(100));
        drop(timer);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn manual_clock_drives_expiry() {
        let clock = ManualClock::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let timer = DeadlineTimer::with_parts(
            move || {
                let _ = tx.send(());
            },
            clock.clone(),
            TaskExecutor::current(),
        )
        .with_tick(Duration::from_millis(100));

        timer.start(Duration::from_millis(300));
        for _ in 0..2 {
            clock.advance(Duration::from_millis(100));
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err());

        clock.advance(Duration::from_millis(100));
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timer should fire once the clock reaches the deadline")
            .expect("callback channel open");
        assert!(!timer.is_running());
    }
}
