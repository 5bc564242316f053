//! Test utilities
//!
//! An in-memory [`PacketQueue`](crate::device::PacketQueue) and frame
//! builders, shared by unit tests and the integration tests in `tests/`.

pub mod packets;
pub mod queue;

use std::sync::Arc;

use crate::dataplane::buffer::{BUFFER_SIZE, BufferPool, PoolBuffer};

pub use queue::MemQueue;

/// A small pool with default slot geometry.
pub fn test_pool(count: usize) -> Arc<BufferPool> {
    Arc::new(BufferPool::new(count, BUFFER_SIZE).expect("test pool"))
}

/// A pool whose slots hold exactly `frame_len` bytes after the headroom,
/// leaving no tailroom for a frame of that size.
pub fn tight_pool(count: usize, frame_len: usize) -> Arc<BufferPool> {
    use crate::dataplane::buffer::HEADROOM;
    Arc::new(BufferPool::new(count, HEADROOM + frame_len).expect("tight pool"))
}

/// Allocate a buffer from `pool` holding a copy of `frame`.
pub fn frame_buffer(pool: &Arc<BufferPool>, frame: &[u8]) -> PoolBuffer {
    let mut buf = pool.alloc().expect("pool exhausted");
    assert!(buf.copy_from(frame), "frame does not fit buffer");
    buf
}
