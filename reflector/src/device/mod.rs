//! Packet I/O devices
//!
//! A device exposes one [`PacketQueue`] per receive/transmit queue pair. The
//! dataplane never sees anything but this trait, so a worker can run over a
//! TAP interface or over the in-memory queue used in tests.

pub mod tap;

use std::fmt;
use std::io;

use crate::dataplane::buffer::PoolBuffer;

pub use tap::{TapDevice, TapQueue};

/// Index of a device in the configured device list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// One receive queue of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueDescriptor {
    pub device: DeviceId,
    pub queue: u16,
    /// NUMA node of the device; negative means unknown
    pub numa_node: i32,
}

/// Receive queues offered by one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQueues {
    pub device: DeviceId,
    pub numa_node: i32,
    pub rx_queues: u16,
}

impl DeviceQueues {
    /// One descriptor per receive queue, in queue order.
    pub fn descriptors(&self) -> impl Iterator<Item = QueueDescriptor> + '_ {
        (0..self.rx_queues).map(move |queue| QueueDescriptor {
            device: self.device,
            queue,
            numa_node: self.numa_node,
        })
    }
}

/// Burst-oriented receive/transmit queue pair
pub trait PacketQueue: Send {
    /// Receive up to `max` frames, appending them to `out`. Returns the
    /// number received; `Ok(0)` when nothing is pending.
    fn rx_burst(&mut self, out: &mut Vec<PoolBuffer>, max: usize) -> io::Result<usize>;

    /// Transmit frames from the front of `pkts` without blocking. Sent
    /// buffers are removed from `pkts`; the rest stay for the caller.
    fn tx_burst(&mut self, pkts: &mut Vec<PoolBuffer>) -> io::Result<usize>;

    /// Receive attempts cut short by an empty buffer pool since the last call.
    fn take_rx_nombuf(&mut self) -> u64 {
        0
    }
}

impl<Q: PacketQueue + ?Sized> PacketQueue for Box<Q> {
    fn rx_burst(&mut self, out: &mut Vec<PoolBuffer>, max: usize) -> io::Result<usize> {
        (**self).rx_burst(out, max)
    }

    fn tx_burst(&mut self, pkts: &mut Vec<PoolBuffer>) -> io::Result<usize> {
        (**self).tx_burst(pkts)
    }

    fn take_rx_nombuf(&mut self) -> u64 {
        (**self).take_rx_nombuf()
    }
}
