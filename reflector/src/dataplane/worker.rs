//! Per-queue worker loop
//!
//! Each worker owns one receive queue and the transmit queue with the same
//! index. It busy-polls: flush pending transmits, receive a burst, rewrite
//! every frame in place and buffer the ones that go back out. Nothing is
//! shared with other workers except the buffer pool and the counters.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::assign::{Binding, WorkerContext, WorkerId};
use crate::config::ReflectorConfig;
use crate::device::PacketQueue;
use crate::topology;

use super::buffer::PoolBuffer;
use super::counters::QueueCounters;
use super::packet::PacketView;
use super::rewrite::{Action, RewriteEngine};

/// Outcome of one transmit flush
#[derive(Debug, Default)]
pub struct FlushResult {
    pub sent: usize,
    pub sent_bytes: u64,
    /// Buffers the queue refused; they have been released
    pub unsent: usize,
    pub error: Option<io::Error>,
}

impl FlushResult {
    fn merge(&mut self, other: FlushResult) {
        self.sent += other.sent;
        self.sent_bytes += other.sent_bytes;
        self.unsent += other.unsent;
        if other.error.is_some() {
            self.error = other.error;
        }
    }
}

/// Frames waiting for the next transmit burst
pub struct TxBuffer {
    pkts: Vec<PoolBuffer>,
    capacity: usize,
}

impl TxBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pkts: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.pkts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffer a frame; a full buffer is flushed right away.
    pub fn append<Q: PacketQueue + ?Sized>(&mut self, buf: PoolBuffer, queue: &mut Q) -> FlushResult {
        self.pkts.push(buf);
        if self.pkts.len() >= self.capacity {
            self.flush(queue)
        } else {
            FlushResult::default()
        }
    }

    /// Send everything buffered without blocking. Whatever the queue does
    /// not take is released.
    pub fn flush<Q: PacketQueue + ?Sized>(&mut self, queue: &mut Q) -> FlushResult {
        if self.pkts.is_empty() {
            return FlushResult::default();
        }
        let pkts_before = self.pkts.len();
        let bytes_before: u64 = self.pkts.iter().map(|b| b.len() as u64).sum();

        // A failing burst may still have sent a prefix; count what left
        let mut result = FlushResult::default();
        if let Err(e) = queue.tx_burst(&mut self.pkts) {
            result.error = Some(e);
        }
        let bytes_left: u64 = self.pkts.iter().map(|b| b.len() as u64).sum();
        result.sent = pkts_before - self.pkts.len();
        result.sent_bytes = bytes_before - bytes_left;
        result.unsent = self.pkts.len();
        self.pkts.clear();
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Polling,
    Processing,
    Stopped,
}

/// Busy-poll loop over one queue
pub struct WorkerLoop<Q: PacketQueue> {
    ctx: WorkerContext,
    binding: Binding,
    queue: Q,
    counters: Arc<QueueCounters>,
    engine: RewriteEngine,
    burst_size: usize,
    vxlan_port: u16,
    dry_run: bool,
    trace_packets: bool,
    rx: Vec<PoolBuffer>,
    tx: TxBuffer,
    stop: Arc<AtomicBool>,
    state: WorkerState,
    io_errors: u64,
}

impl<Q: PacketQueue> WorkerLoop<Q> {
    pub fn new(
        ctx: WorkerContext,
        binding: Binding,
        queue: Q,
        counters: Arc<QueueCounters>,
        config: &ReflectorConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx,
            binding,
            queue,
            counters,
            engine: RewriteEngine::new(config.responder_mac),
            burst_size: config.burst_size,
            vxlan_port: config.vxlan_port,
            dry_run: config.dry_run,
            trace_packets: config.trace_packets,
            rx: Vec::with_capacity(config.burst_size),
            tx: TxBuffer::new(config.tx_buffer_size),
            stop,
            state: WorkerState::Init,
            io_errors: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.ctx.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Frames buffered for transmit.
    pub fn pending_tx(&self) -> usize {
        self.tx.len()
    }

    /// Run until the stop flag is set, then flush once more.
    pub fn run(mut self) {
        info!(
            worker = %self.ctx.id,
            numa_node = self.ctx.numa_node,
            device = %self.binding.queue.device,
            rx_queue = self.binding.queue.queue,
            tx_queue = self.binding.tx_queue,
            "Worker started"
        );

        while !self.stop.load(Ordering::Acquire) {
            self.poll_once();
        }
        self.shutdown();

        info!(worker = %self.ctx.id, "Worker stopped");
    }

    /// Final flush; the worker does not poll again afterwards.
    pub fn shutdown(&mut self) {
        let flushed = self.tx.flush(&mut self.queue);
        self.account_flush(flushed);
        self.state = WorkerState::Stopped;
    }

    /// One polling and processing iteration. Returns the number of frames
    /// received.
    pub fn poll_once(&mut self) -> usize {
        self.state = WorkerState::Polling;

        let flushed = self.tx.flush(&mut self.queue);
        self.account_flush(flushed);

        let mut rx = std::mem::take(&mut self.rx);
        let received = match self.queue.rx_burst(&mut rx, self.burst_size) {
            Ok(n) => n,
            Err(e) => {
                self.io_error("rx", &e);
                0
            }
        };
        let nombuf = self.queue.take_rx_nombuf();
        if nombuf > 0 {
            self.counters.add_rx_nombuf(nombuf);
        }
        if rx.is_empty() {
            self.rx = rx;
            return received;
        }

        self.state = WorkerState::Processing;
        let rx_bytes: u64 = rx.iter().map(|b| b.len() as u64).sum();
        self.counters.add_rx(rx.len() as u64, rx_bytes);

        let mut dropped = 0u64;
        let mut flushed = FlushResult::default();
        for mut buf in rx.drain(..) {
            match self.rewrite(&mut buf) {
                Action::Forward => flushed.merge(self.tx.append(buf, &mut self.queue)),
                Action::Drop => dropped += 1,
            }
        }
        self.rx = rx;

        if dropped > 0 {
            self.counters.add_dropped(dropped);
        }
        self.account_flush(flushed);
        received
    }

    fn rewrite(&self, buf: &mut PoolBuffer) -> Action {
        if self.dry_run {
            return Action::Forward;
        }
        let mut view = PacketView::parse_l2(buf);
        if self.trace_packets {
            debug!(worker = %self.ctx.id, "rx {}", view.summary());
        }
        let action = match view.vxlan_decap(self.vxlan_port) {
            Ok(_) => self.engine.process(&mut view),
            Err(_) => Action::Drop,
        };
        if self.trace_packets {
            match action {
                Action::Forward => debug!(worker = %self.ctx.id, "tx {}", view.summary()),
                Action::Drop => debug!(worker = %self.ctx.id, "drop"),
            }
        }
        action
    }

    fn account_flush(&mut self, result: FlushResult) {
        if result.sent > 0 {
            self.counters.add_tx(result.sent as u64, result.sent_bytes);
        }
        if result.unsent > 0 {
            self.counters.add_tx_errors(result.unsent as u64);
        }
        if let Some(e) = result.error {
            self.io_error("tx", &e);
        }
    }

    /// Log I/O errors at 1, 2, 4, 8, ... occurrences.
    fn io_error(&mut self, dir: &str, e: &io::Error) {
        self.io_errors += 1;
        if self.io_errors.is_power_of_two() {
            warn!(
                worker = %self.ctx.id,
                dir,
                error = %e,
                count = self.io_errors,
                "Queue I/O error"
            );
        }
    }
}

/// Handle to a running worker thread
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    pub worker: WorkerId,
}

impl WorkerHandle {
    /// Signal the worker to stop
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| "Worker thread panicked".to_string())
        } else {
            Ok(())
        }
    }

    /// Check if the worker is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `worker` on a new thread pinned to `cpu`.
///
/// A failed pin is logged and the worker runs unpinned.
pub fn spawn_worker<Q: PacketQueue + 'static>(
    worker: WorkerLoop<Q>,
    cpu: usize,
) -> io::Result<WorkerHandle> {
    let stop = worker.stop_flag();
    let id = worker.id();

    let thread = thread::Builder::new()
        .name(format!("worker-{cpu}"))
        .spawn(move || {
            if let Err(e) = topology::pin_current_thread(cpu) {
                warn!(worker = %id, cpu, error = %e, "Failed to pin worker thread");
            }
            worker.run();
        })?;

    Ok(WorkerHandle {
        thread: Some(thread),
        stop,
        worker: id,
    })
}
