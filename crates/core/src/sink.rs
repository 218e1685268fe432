//! Destinations for released packet batches.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Receives batches released by a [`PacketController`](crate::controller::PacketController).
///
/// Called from whatever task performs the release, never while the queue lock is held. An
/// implementation should return promptly; a slow sink stretches sequential pacing but cannot
/// corrupt the controller.
pub trait PacketSink: Send + Sync + 'static {
    fn release(&self, batch: Vec<Bytes>);
}

impl<F> PacketSink for F
where
    F: Fn(Vec<Bytes>) + Send + Sync + 'static,
{
    fn release(&self, batch: Vec<Bytes>) {
        self(batch)
    }
}

/// Discards every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PacketSink for NullSink {
    fn release(&self, _batch: Vec<Bytes>) {}
}

/// Logs the shape of each batch without touching the payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl PacketSink for TracingSink {
    fn release(&self, batch: Vec<Bytes>) {
        let bytes: usize = batch.iter().map(Bytes::len).sum();
        tracing::info!(packets = batch.len(), bytes, "released batch");
    }
}

/// Forwards every batch over an unbounded channel.
///
/// Batches released after the receiving half is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<Bytes>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelSink {
    fn release(&self, batch: Vec<Bytes>) {
        if self.tx.send(batch).is_err() {
            tracing::debug!("channel sink receiver dropped, discarding batch");
        }
    }
}
