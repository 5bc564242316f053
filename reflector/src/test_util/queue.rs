//! In-memory packet queue
//!
//! Tests push frames into the receive side and collect what the worker
//! transmitted. Clones share the same queues, so one clone can be handed to
//! a worker thread while the test keeps the other.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::dataplane::buffer::{BufferPool, PoolBuffer};
use crate::device::PacketQueue;

struct Inner {
    rx: ArrayQueue<PoolBuffer>,
    tx: ArrayQueue<PoolBuffer>,
    /// Frames the transmit side still accepts; `usize::MAX` for unlimited
    tx_budget: AtomicUsize,
    fail_rx: AtomicBool,
    rx_bursts: AtomicUsize,
}

#[derive(Clone)]
pub struct MemQueue {
    inner: Arc<Inner>,
}

impl MemQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                rx: ArrayQueue::new(capacity),
                tx: ArrayQueue::new(capacity),
                tx_budget: AtomicUsize::new(usize::MAX),
                fail_rx: AtomicBool::new(false),
                rx_bursts: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a buffer for reception. Returns it back if the queue is full.
    pub fn inject(&self, buf: PoolBuffer) -> Result<(), PoolBuffer> {
        self.inner.rx.push(buf)
    }

    /// Copy `frame` into a buffer from `pool` and queue it for reception.
    pub fn inject_frame(&self, pool: &Arc<BufferPool>, frame: &[u8]) {
        let buf = super::frame_buffer(pool, frame);
        assert!(self.inject(buf).is_ok(), "rx queue full");
    }

    /// Frames still waiting to be received.
    pub fn pending_rx(&self) -> usize {
        self.inner.rx.len()
    }

    /// Drain everything transmitted so far.
    pub fn take_sent(&self) -> Vec<PoolBuffer> {
        let mut out = Vec::with_capacity(self.inner.tx.len());
        while let Some(buf) = self.inner.tx.pop() {
            out.push(buf);
        }
        out
    }

    /// Accept only `frames` more frames on the transmit side.
    pub fn set_tx_budget(&self, frames: usize) {
        self.inner.tx_budget.store(frames, Ordering::SeqCst);
    }

    /// Make the next `rx_burst` fail with an I/O error.
    pub fn fail_next_rx(&self) {
        self.inner.fail_rx.store(true, Ordering::SeqCst);
    }

    /// Number of `rx_burst` calls so far.
    pub fn rx_bursts(&self) -> usize {
        self.inner.rx_bursts.load(Ordering::SeqCst)
    }
}

impl PacketQueue for MemQueue {
    fn rx_burst(&mut self, out: &mut Vec<PoolBuffer>, max: usize) -> io::Result<usize> {
        self.inner.rx_bursts.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_rx.swap(false, Ordering::SeqCst) {
            return Err(io::Error::other("injected rx failure"));
        }
        let mut received = 0;
        while received < max {
            let Some(buf) = self.inner.rx.pop() else {
                break;
            };
            out.push(buf);
            received += 1;
        }
        Ok(received)
    }

    fn tx_burst(&mut self, pkts: &mut Vec<PoolBuffer>) -> io::Result<usize> {
        let budget = self.inner.tx_budget.load(Ordering::SeqCst);
        let room = self.inner.tx.capacity() - self.inner.tx.len();
        let sent = pkts.len().min(budget).min(room);
        for buf in pkts.drain(..sent) {
            // Room was checked above and this is the only producer
            let _ = self.inner.tx.push(buf);
        }
        if budget != usize::MAX {
            self.inner.tx_budget.store(budget - sent, Ordering::SeqCst);
        }
        Ok(sent)
    }
}
