//! Bounded, timestamped FIFO of opaque packets.
//!
//! [`PacketQueue`] is the synchronous core of the controller: it records when each packet
//! arrived, evicts the oldest packet when full, and drains the packets that have been held
//! for at least the hold duration. It does no locking of its own; the controller wraps it in
//! a mutex.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::clock::TimeSource;

/// A payload together with the time it entered the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedPacket {
    pub data: Bytes,
    pub enqueued_at: Duration,
}

/// Result of pushing a packet into a [`PacketQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// The queue was full; the oldest packet was dropped to make room.
    EvictedOldest,
    /// Zero capacity queue, the new packet itself was dropped.
    Dropped,
}

pub struct PacketQueue<T: TimeSource> {
    packets: VecDeque<BufferedPacket>,
    hold_duration: Duration,
    capacity: usize,
    time_source: T,
}

impl<T: TimeSource> PacketQueue<T> {
    pub fn new(hold_duration: Duration, capacity: usize, time_source: T) -> Self {
        PacketQueue {
            // capped so a huge configured capacity does not allocate up front
            packets: VecDeque::with_capacity(capacity.min(1024)),
            hold_duration,
            capacity,
            time_source,
        }
    }

    /// Appends a packet stamped with the current time, evicting the oldest one first when the
    /// queue is at capacity.
    pub fn push(&mut self, data: Bytes) -> PushOutcome {
        if self.capacity == 0 {
            return PushOutcome::Dropped;
        }
        let outcome = if self.packets.len() >= self.capacity {
            self.packets.pop_front();
            PushOutcome::EvictedOldest
        } else {
            PushOutcome::Stored
        };
        let enqueued_at = self.time_source.now();
        self.packets.push_back(BufferedPacket { data, enqueued_at });
        outcome
    }

    /// Removes and returns every packet that has been held for at least the hold duration.
    ///
    /// A single `now` is read for the whole drain. Arrival order equals timestamp order, so the
    /// eligible packets are always a prefix of the queue and the remaining ones keep their order.
    pub fn drain_eligible(&mut self) -> Vec<Bytes> {
        let now = self.time_source.now();
        let mut ready = Vec::new();
        while self
            .packets
            .front()
            .is_some_and(|packet| self.is_eligible(packet, now))
        {
            if let Some(packet) = self.packets.pop_front() {
                ready.push(packet.data);
            }
        }
        ready
    }

    fn is_eligible(&self, packet: &BufferedPacket, now: Duration) -> bool {
        now.saturating_sub(packet.enqueued_at) >= self.hold_duration
    }

    /// Drops every buffered packet, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let dropped = self.packets.len();
        self.packets.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedPacket> {
        self.packets.iter()
    }
}
