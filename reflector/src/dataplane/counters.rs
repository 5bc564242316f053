//! Per-queue packet counters
//!
//! Each worker owns the counters of its queue and is their only writer, so
//! updates are a relaxed load and store instead of a locked read-modify-write.
//! The stats reporter reads them from another thread through
//! [`CounterRegistry::snapshot`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::DeviceId;

#[inline]
fn bump(counter: &AtomicU64, n: u64) {
    counter.store(counter.load(Ordering::Relaxed).wrapping_add(n), Ordering::Relaxed);
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    dropped: AtomicU64,
    tx_errors: AtomicU64,
    rx_nombuf: AtomicU64,
}

impl QueueCounters {
    pub fn add_rx(&self, packets: u64, bytes: u64) {
        bump(&self.rx_packets, packets);
        bump(&self.rx_bytes, bytes);
    }

    pub fn add_tx(&self, packets: u64, bytes: u64) {
        bump(&self.tx_packets, packets);
        bump(&self.tx_bytes, bytes);
    }

    pub fn add_dropped(&self, packets: u64) {
        bump(&self.dropped, packets);
    }

    /// Buffers discarded because the transmit path refused them.
    pub fn add_tx_errors(&self, packets: u64) {
        bump(&self.tx_errors, packets);
    }

    pub fn add_rx_nombuf(&self, count: u64) {
        bump(&self.rx_nombuf, count);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            rx_nombuf: self.rx_nombuf.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`QueueCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub dropped: u64,
    pub tx_errors: u64,
    pub rx_nombuf: u64,
}

impl CounterSnapshot {
    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            rx_packets: self.rx_packets.saturating_sub(earlier.rx_packets),
            rx_bytes: self.rx_bytes.saturating_sub(earlier.rx_bytes),
            tx_packets: self.tx_packets.saturating_sub(earlier.tx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(earlier.tx_bytes),
            dropped: self.dropped.saturating_sub(earlier.dropped),
            tx_errors: self.tx_errors.saturating_sub(earlier.tx_errors),
            rx_nombuf: self.rx_nombuf.saturating_sub(earlier.rx_nombuf),
        }
    }

    pub fn accumulate(&mut self, other: &CounterSnapshot) {
        self.rx_packets += other.rx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_packets += other.tx_packets;
        self.tx_bytes += other.tx_bytes;
        self.dropped += other.dropped;
        self.tx_errors += other.tx_errors;
        self.rx_nombuf += other.rx_nombuf;
    }
}

/// Counters of one queue, as returned by [`CounterRegistry::snapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub device: DeviceId,
    pub queue: u16,
    pub counters: CounterSnapshot,
}

/// All queue counters of the process
#[derive(Debug, Default)]
pub struct CounterRegistry {
    queues: Mutex<BTreeMap<(DeviceId, u16), Arc<QueueCounters>>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `{device, queue}`, created on first use.
    pub fn register(&self, device: DeviceId, queue: u16) -> Arc<QueueCounters> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(queues.entry((device, queue)).or_default())
    }

    /// Snapshot of every registered queue, sorted by `(device, queue)`.
    pub fn snapshot(&self) -> Vec<QueueStats> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .iter()
            .map(|(&(device, queue), counters)| QueueStats {
                device,
                queue,
                counters: counters.snapshot(),
            })
            .collect()
    }
}
