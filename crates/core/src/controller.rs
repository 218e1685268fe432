//! Packet holding controller.
//!
//! Accepts packets from an ingestion source, holds each one for at least the configured hold
//! duration and releases aged packets to a [`PacketSink`] on request, either as one batch
//! ([`ReleaseMode::Instant`]) or one packet at a time with a short pause in between
//! ([`ReleaseMode::Sequential`]).
//!
//! ## Locking
//!
//! Every queue mutation (enqueue, drain, clear) happens under a single async mutex, so a drain
//! is atomic and no packet is ever claimed by two releases. Sink calls happen after the queue
//! lock has been released.
//!
//! ## Stopping
//!
//! Each [`stop`](PacketController::stop) bumps a session epoch while holding the queue lock.
//! Drained batches remember the epoch they were taken in and are discarded at emission time
//! if it has moved on. Emissions hold a read guard on an emission gate which `stop` takes for
//! writing before returning, so once `stop` returns no sink call for an earlier session is in
//! flight or can start.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};

use crate::buffer::{PacketQueue, PushOutcome};
use crate::clock::{RealTime, TimeSource};
use crate::config::{HoldConfig, ReleaseMode};
use crate::executor::TaskExecutor;
use crate::sink::PacketSink;

/// Snapshot of a controller's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStats {
    /// Packets accepted into the queue.
    pub enqueued: u64,
    /// Packets dropped because the queue was full (or had zero capacity).
    pub evicted: u64,
    /// Enqueue calls ignored because the controller was not active.
    pub ignored_inactive: u64,
    /// Packets handed to the sink.
    pub released: u64,
    /// Packets thrown away by `stop`, either still queued or drained but not yet emitted.
    pub discarded_on_stop: u64,
    /// Packets currently buffered.
    pub buffered: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    evicted: AtomicU64,
    ignored_inactive: AtomicU64,
    released: AtomicU64,
    discarded_on_stop: AtomicU64,
}

struct Drained {
    packets: Vec<Bytes>,
    epoch: u64,
}

/// Packets drained by a sequential burst but not yet emitted. Whatever is left when the burst
/// ends early, including by task abort, counts as discarded.
struct Undelivered<'a> {
    packets: std::vec::IntoIter<Bytes>,
    discarded: &'a AtomicU64,
}

impl Drop for Undelivered<'_> {
    fn drop(&mut self) {
        let left = self.packets.len();
        if left > 0 {
            self.discarded.fetch_add(left as u64, Ordering::Relaxed);
        }
    }
}

/// Handle to a packet holding controller. Clones share the same queue and sink.
pub struct PacketController<S: PacketSink, T: TimeSource = RealTime> {
    inner: Arc<Inner<S, T>>,
}

struct Inner<S, T: TimeSource> {
    config: HoldConfig,
    queue: Mutex<PacketQueue<T>>,
    active: AtomicBool,
    epoch: watch::Sender<u64>,
    emit_gate: RwLock<()>,
    sink: S,
    time_source: T,
    executor: TaskExecutor,
    tasks: parking_lot::Mutex<Vec<AbortHandle>>,
    counters: Counters,
}

impl<S: PacketSink, T: TimeSource> Clone for PacketController<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: PacketSink> PacketController<S, RealTime> {
    /// Controller on the real monotonic clock, spawning work on the caller's runtime.
    pub fn new(config: HoldConfig, sink: S) -> Self {
        Self::with_parts(config, sink, RealTime::new(), TaskExecutor::current())
    }
}

impl<S: PacketSink, T: TimeSource> PacketController<S, T> {
    pub fn with_parts(config: HoldConfig, sink: S, time_source: T, executor: TaskExecutor) -> Self {
        let queue = PacketQueue::new(config.hold_duration, config.capacity, time_source.clone());
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(queue),
                active: AtomicBool::new(false),
                epoch,
                emit_gate: RwLock::new(()),
                sink,
                time_source,
                executor,
                tasks: parking_lot::Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &HoldConfig {
        &self.inner.config
    }

    pub(crate) fn time_source(&self) -> &T {
        &self.inner.time_source
    }

    pub(crate) fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Starts accepting packets.
    pub fn start(&self) {
        if !self.inner.active.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                hold = ?self.inner.config.hold_duration,
                capacity = self.inner.config.capacity,
                "packet controller started"
            );
        }
    }

    /// Stops accepting packets, cancels outstanding releases and clears the queue.
    ///
    /// Returns once the queue is empty and no sink call for packets buffered before the stop
    /// is running or can still happen. Safe to call repeatedly, before `start`, and from any
    /// task.
    pub async fn stop(&self) {
        let dropped = {
            let mut queue = self.inner.queue.lock().await;
            self.inner.active.store(false, Ordering::Release);
            self.inner.epoch.send_modify(|epoch| *epoch += 1);
            queue.clear()
        };

        let cancelled = {
            let mut tasks = self.inner.tasks.lock();
            let cancelled = tasks.iter().filter(|task| !task.is_finished()).count();
            for task in tasks.drain(..) {
                task.abort();
            }
            cancelled
        };

        // wait out any sink call that passed its epoch check before the bump
        drop(self.inner.emit_gate.write().await);

        self.inner
            .counters
            .discarded_on_stop
            .fetch_add(dropped as u64, Ordering::Relaxed);
        tracing::debug!(dropped, cancelled, "packet controller stopped");
    }

    /// Buffers a packet, evicting the oldest one if the queue is full. Ignored while inactive.
    pub async fn enqueue_packet(&self, data: impl Into<Bytes>) {
        if !self.is_active() {
            self.inner
                .counters
                .ignored_inactive
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        let data = data.into();
        let mut queue = self.inner.queue.lock().await;
        // stop() flips the flag under this lock; re-check so nothing lands after its clear
        if !self.is_active() {
            self.inner
                .counters
                .ignored_inactive
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        let counters = &self.inner.counters;
        match queue.push(data) {
            PushOutcome::Stored => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::EvictedOldest => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
                counters.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(capacity = queue.capacity(), "queue full, evicted oldest packet");
            }
            PushOutcome::Dropped => {
                counters.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drains every eligible packet and hands them to the sink in a single call.
    ///
    /// Does nothing if no packet has been held long enough.
    pub async fn release_instant_burst(&self) {
        let Some(Drained { packets, epoch }) = self.drain().await else {
            return;
        };
        tracing::trace!(packets = packets.len(), "instant burst");
        self.emit(epoch, packets).await;
    }

    /// Drains every eligible packet and hands them to the sink one at a time, in arrival order,
    /// pausing the fast sequential delay between emissions.
    ///
    /// The drain happens up front; a `stop` during emission discards whatever has not been
    /// emitted yet.
    pub async fn release_sequential_burst(&self) {
        let Some(Drained { packets, epoch }) = self.drain().await else {
            return;
        };
        tracing::trace!(packets = packets.len(), "sequential burst");
        let delay = self.inner.config.fast_sequential_delay;
        let mut stopped = self.inner.epoch.subscribe();
        let mut pending = Undelivered {
            packets: packets.into_iter(),
            discarded: &self.inner.counters.discarded_on_stop,
        };
        while let Some(packet) = pending.packets.next() {
            if !self.emit(epoch, vec![packet]).await {
                return;
            }
            if pending.packets.len() == 0 || delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.inner.time_source.sleep(delay) => {}
                _ = stopped.wait_for(|current| *current != epoch) => {}
            }
        }
    }

    pub async fn release(&self, mode: ReleaseMode) {
        match mode {
            ReleaseMode::Instant => self.release_instant_burst().await,
            ReleaseMode::Sequential => self.release_sequential_burst().await,
        }
    }

    /// Runs a release on the controller's executor. The task is aborted by `stop`.
    pub fn spawn_release(&self, mode: ReleaseMode) -> JoinHandle<()> {
        let controller = self.clone();
        let handle = self
            .inner
            .executor
            .spawn(async move { controller.release(mode).await });
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    pub async fn len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.queue.lock().await.is_empty()
    }

    pub async fn stats(&self) -> ControllerStats {
        let buffered = self.len().await;
        let counters = &self.inner.counters;
        ControllerStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            ignored_inactive: counters.ignored_inactive.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
            discarded_on_stop: counters.discarded_on_stop.load(Ordering::Relaxed),
            buffered,
        }
    }

    async fn drain(&self) -> Option<Drained> {
        let mut queue = self.inner.queue.lock().await;
        let packets = queue.drain_eligible();
        if packets.is_empty() {
            return None;
        }
        let epoch = *self.inner.epoch.borrow();
        Some(Drained { packets, epoch })
    }

    /// Hands `batch` to the sink unless the controller was stopped after it was drained.
    async fn emit(&self, epoch: u64, batch: Vec<Bytes>) -> bool {
        let _gate = self.inner.emit_gate.read().await;
        let current = *self.inner.epoch.borrow();
        let count = batch.len() as u64;
        if current != epoch {
            self.inner
                .counters
                .discarded_on_stop
                .fetch_add(count, Ordering::Relaxed);
            return false;
        }
        self.inner.sink.release(batch);
        self.inner
            .counters
            .released
            .fetch_add(count, Ordering::Relaxed);
        true
    }
}
