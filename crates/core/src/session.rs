//! Session host tying a packet source, a controller and a release timer together.
//!
//! A [`HoldSession`] pulls packets from a [`PacketSource`] and feeds them to its
//! [`PacketController`]. When configured with a release deadline it arms a [`DeadlineTimer`]
//! on start and releases held packets every time it expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::{RealTime, TimeSource};
use crate::config::SessionConfig;
use crate::controller::PacketController;
use crate::errors::{SessionError, SourceError};
use crate::sink::PacketSink;
use crate::timer::DeadlineTimer;

/// Something that produces raw packets.
///
/// Implementations must not block indefinitely when nothing is available: returning `Ok(0)`
/// lets the session idle briefly and poll again.
pub trait PacketSource: Send + 'static {
    /// Reads one packet into `buf`, returning its length, `Ok(0)` when nothing is ready, or
    /// [`SourceError::Closed`] once the source is exhausted.
    fn read_packet<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, SourceError>>;
}

/// Packets read in MTU sized chunks from any async reader. End of stream closes the source.
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin + Send + 'static> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> PacketSource for ReaderSource<R> {
    fn read_packet<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, SourceError>> {
        async move {
            match self.reader.read(buf).await? {
                0 => Err(SourceError::Closed),
                read => Ok(read),
            }
        }
        .boxed()
    }
}

/// Packets pushed through a channel. Never waits: an empty channel reads as `Ok(0)`.
///
/// Packets larger than the read buffer are dropped whole with a warning rather than cut to
/// size.
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

impl PacketSource for ChannelSource {
    fn read_packet<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, SourceError>> {
        let read = loop {
            match self.rx.try_recv() {
                Ok(packet) if packet.len() > buf.len() => {
                    tracing::warn!(size = packet.len(), mtu = buf.len(), "dropping oversized packet");
                }
                Ok(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    break Ok(packet.len());
                }
                Err(mpsc::error::TryRecvError::Empty) => break Ok(0),
                Err(mpsc::error::TryRecvError::Disconnected) => break Err(SourceError::Closed),
            }
        };
        futures::future::ready(read).boxed()
    }
}

pub struct HoldSession<S: PacketSink, T: TimeSource = RealTime> {
    controller: PacketController<S, T>,
    config: SessionConfig,
    running: Arc<AtomicBool>,
    ingestion_closed: Arc<watch::Sender<bool>>,
    active: parking_lot::Mutex<Option<ActiveSession<T>>>,
}

struct ActiveSession<T: TimeSource> {
    ingestion: JoinHandle<()>,
    releases: Option<TimedRelease<T>>,
}

struct TimedRelease<T: TimeSource> {
    timer: Arc<DeadlineTimer<T>>,
    driver: JoinHandle<()>,
}

impl<S: PacketSink, T: TimeSource> HoldSession<S, T> {
    /// The session spawns its work on the controller's executor and reads the controller's
    /// clock.
    pub fn new(controller: PacketController<S, T>, config: SessionConfig) -> Self {
        // nothing is being ingested until the first start
        let (ingestion_closed, _) = watch::channel(true);
        Self {
            controller,
            config,
            running: Arc::new(AtomicBool::new(false)),
            ingestion_closed: Arc::new(ingestion_closed),
            active: parking_lot::Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &PacketController<S, T> {
        &self.controller
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts the controller, begins ingesting from `source` and arms the release timer.
    pub fn start<P: PacketSource>(&self, source: P) -> Result<(), SessionError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyRunning);
        }

        self.controller.start();
        self.ingestion_closed.send_replace(false);

        let executor = self.controller.executor();
        let ingestion = executor.spawn(ingest(
            source,
            self.controller.clone(),
            self.config.clone(),
            self.running.clone(),
            self.ingestion_closed.clone(),
        ));
        let releases = self.config.release_after.map(|period| self.arm_releases(period));

        *self.active.lock() = Some(ActiveSession {
            ingestion,
            releases,
        });
        tracing::debug!(
            mtu = self.config.mtu,
            release_after = ?self.config.release_after,
            mode = ?self.config.release_mode,
            "session started"
        );
        Ok(())
    }

    fn arm_releases(&self, period: std::time::Duration) -> TimedRelease<T> {
        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();
        let timer = Arc::new(
            DeadlineTimer::with_parts(
                move || {
                    let _ = expired_tx.send(());
                },
                self.controller.time_source().clone(),
                self.controller.executor().clone(),
            )
            .with_tick(self.config.tick),
        );

        let mode = self.config.release_mode;
        let repeat = self.config.repeat;
        let controller = self.controller.clone();
        let driver = self.controller.executor().spawn({
            let timer = timer.clone();
            async move {
                while expired_rx.recv().await.is_some() {
                    if repeat {
                        timer.start(period);
                    }
                    tracing::debug!(?mode, "release deadline reached");
                    controller.release(mode).await;
                }
            }
        });
        timer.start(period);
        TimedRelease { timer, driver }
    }

    /// Stops ingestion and the release timer, then stops the controller, discarding anything
    /// still held.
    pub async fn stop(&self) -> Result<(), SessionError> {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::NotRunning);
        }

        let active = self.active.lock().take();
        if let Some(active) = active {
            if let Some(TimedRelease { timer, driver }) = active.releases {
                timer.stop();
                driver.abort();
            }
            active.ingestion.abort();
        }
        self.controller.stop().await;
        self.ingestion_closed.send_replace(true);
        tracing::debug!("session stopped");
        Ok(())
    }

    /// Resolves once the source has closed or the session has been stopped. Resolves at once
    /// for a session that is not running.
    pub async fn wait_ingestion_end(&self) {
        let mut closed = self.ingestion_closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl<S: PacketSink, T: TimeSource> Drop for HoldSession<S, T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(active) = self.active.get_mut().take() {
            if let Some(releases) = active.releases {
                releases.timer.stop();
                releases.driver.abort();
            }
            active.ingestion.abort();
        }
    }
}

async fn ingest<P: PacketSource, S: PacketSink, T: TimeSource>(
    mut source: P,
    controller: PacketController<S, T>,
    config: SessionConfig,
    running: Arc<AtomicBool>,
    closed: Arc<watch::Sender<bool>>,
) {
    let time_source = controller.time_source().clone();
    let mut buf = vec![0u8; config.mtu];
    while running.load(Ordering::Acquire) {
        match source.read_packet(&mut buf).await {
            Ok(0) => time_source.sleep(config.idle_sleep).await,
            Ok(read) => {
                controller
                    .enqueue_packet(Bytes::copy_from_slice(&buf[..read]))
                    .await
            }
            Err(SourceError::Closed) => {
                tracing::debug!("packet source closed");
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "failed reading from packet source");
                time_source.sleep(config.idle_sleep).await;
            }
        }
    }
    closed.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HoldConfig, ReleaseMode};
    use crate::sink::ChannelSink;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::sleep;

    fn session(
        config: SessionConfig,
    ) -> (HoldSession<ChannelSink>, UnboundedReceiver<Vec<Bytes>>) {
        let (sink, rx) = ChannelSink::new();
        let controller = PacketController::new(
            HoldConfig::new(Duration::from_millis(250), 16, Duration::from_millis(10)),
            sink,
        );
        (HoldSession::new(controller, config), rx)
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_start_is_guarded_and_stop_idempotent() {
        let (session, _rx) = session(SessionConfig::default());
        let (_tx, source) = ChannelSource::new(8);
        session.start(source).unwrap();
        assert!(session.is_running());
        assert!(session.controller().is_active());

        let (_tx2, second) = ChannelSource::new(8);
        assert_eq!(session.start(second), Err(SessionError::AlreadyRunning));

        assert_eq!(session.stop().await, Ok(()));
        assert_eq!(session.stop().await, Err(SessionError::NotRunning));
        assert!(!session.controller().is_active());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_ingests_and_releases_on_deadline() {
        let (session, mut rx) = session(SessionConfig {
            release_after: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let (tx, source) = ChannelSource::new(8);
        session.start(source).unwrap();

        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(session.controller().len().await, 2);

        sleep(Duration::from_millis(250)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec!["one", "two"]);

        // single shot: nothing more without repeat
        tx.send(Bytes::from_static(b"three")).await.unwrap();
        sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.controller().len().await, 1);
        session.stop().await.unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_repeating_sequential_releases() {
        let (session, mut rx) = session(SessionConfig {
            release_after: Some(Duration::from_millis(300)),
            release_mode: ReleaseMode::Sequential,
            repeat: true,
            ..Default::default()
        });
        let (tx, source) = ChannelSource::new(8);
        session.start(source).unwrap();

        tx.send(Bytes::from_static(b"a")).await.unwrap();
        tx.send(Bytes::from_static(b"b")).await.unwrap();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(rx.recv().await.unwrap(), vec!["a"]);
        assert_eq!(rx.recv().await.unwrap(), vec!["b"]);

        tx.send(Bytes::from_static(b"c")).await.unwrap();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.recv().await.unwrap(), vec!["c"]);
        session.stop().await.unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_source_close_ends_ingestion() {
        let (session, _rx) = session(SessionConfig::default());
        let (tx, source) = ChannelSource::new(8);
        session.start(source).unwrap();
        tx.send(Bytes::from_static(b"last")).await.unwrap();
        drop(tx);

        session.wait_ingestion_end().await;
        assert_eq!(session.controller().len().await, 1);
        assert!(session.is_running());
        session.stop().await.unwrap();
        assert!(session.controller().is_empty().await);
    }

    #[test_log::test(tokio::test)]
    async fn test_channel_source_drops_oversized_packets() {
        let (tx, mut source) = ChannelSource::new(4);
        tx.send(Bytes::from_static(b"too long")).await.unwrap();
        tx.send(Bytes::from_static(b"ok")).await.unwrap();
        let mut buf = [0u8; 4];

        assert_eq!(source.read_packet(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
        assert_eq!(source.read_packet(&mut buf).await.unwrap(), 0);
        drop(tx);
        assert!(matches!(
            source.read_packet(&mut buf).await,
            Err(SourceError::Closed)
        ));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_wait_ingestion_end_on_idle_session() {
        let (session, _rx) = session(SessionConfig::default());
        tokio::time::timeout(Duration::from_secs(1), session.wait_ingestion_end())
            .await
            .expect("not started, nothing to wait for");

        let (_tx, source) = ChannelSource::new(8);
        session.start(source).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(1), session.wait_ingestion_end())
                .await
                .is_err()
        );
        session.stop().await.unwrap();
        session.wait_ingestion_end().await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_reader_source_chunks_by_mtu() {
        let (session, _rx) = session(SessionConfig {
            mtu: 4,
            ..Default::default()
        });
        let (mut writer, reader) = tokio::io::duplex(64);
        session.start(ReaderSource::new(reader)).unwrap();

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"0123456789")
            .await
            .unwrap();
        drop(writer);
        session.wait_ingestion_end().await;

        let stats = session.controller().stats().await;
        assert_eq!(stats.enqueued, 3);
        session.stop().await.unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_restart_after_stop() {
        let (session, mut rx) = session(SessionConfig {
            release_after: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let (tx, source) = ChannelSource::new(8);
        session.start(source).unwrap();
        tx.send(Bytes::from_static(b"stale")).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        session.stop().await.unwrap();

        let (tx, source) = ChannelSource::new(8);
        session.start(source).unwrap();
        tx.send(Bytes::from_static(b"fresh")).await.unwrap();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(rx.recv().await.unwrap(), vec!["fresh"]);
        assert!(rx.try_recv().is_err());
        session.stop().await.unwrap();
    }
}
