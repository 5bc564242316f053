//! Data plane: per-queue reflector workers
//!
//! Architecture:
//! - One worker thread per receive queue, pinned to a CPU on the queue's NUMA node
//! - Frames are rewritten in place inside pool buffers and sent back out
//!   the same queue index
//! - VXLAN frames are reflected on the inner frame, then on the outer headers
//! - Workers share only the buffer pool and their counters

pub mod arp;
pub mod buffer;
pub mod checksum;
pub mod counters;
pub mod icmp;
pub mod icmpv6;
pub mod packet;
pub mod rewrite;
pub mod vxlan;
pub mod worker;

pub use arp::ArpResponder;
pub use buffer::{BUFFER_SIZE, BufferPool, HEADROOM, POOL_SIZE, PacketBuffer, PoolBuffer};
pub use counters::{CounterRegistry, CounterSnapshot, QueueCounters, QueueStats};
pub use icmpv6::Icmpv6Responder;
pub use packet::{Headers, L4Proto, PacketView, ParseError};
pub use rewrite::{Action, RewriteEngine};
pub use vxlan::VXLAN_PORT;
pub use worker::{TxBuffer, WorkerHandle, WorkerLoop, WorkerState, spawn_worker};
