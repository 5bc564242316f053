//! Packet buffer pool for the data plane
//!
//! Pre-allocates one memory region (hugepages if available) carved into
//! fixed-size slots. Each slot keeps `HEADROOM` bytes in front of the frame;
//! whatever follows the frame is tailroom. Buffers go back to the pool when
//! dropped, so releasing a packet is just letting go of it.

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

/// Bytes reserved in front of the frame in every slot.
pub const HEADROOM: usize = 128;

/// Default slot size (headroom + a full 1500-byte MTU frame + tailroom).
pub const BUFFER_SIZE: usize = 2048;

/// Default number of slots per pool.
pub const POOL_SIZE: usize = 8192;

/// Mutable byte-range capability the packet cursor works on.
///
/// The data region is contiguous. Growing it consumes tailroom, shrinking it
/// returns bytes to the tailroom.
pub trait PacketBuffer {
    /// Valid frame bytes.
    fn data(&self) -> &[u8];

    /// Valid frame bytes, writable.
    fn data_mut(&mut self) -> &mut [u8];

    /// Bytes available after the frame.
    fn tailroom(&self) -> usize;

    /// Extend the frame by `len` bytes of tailroom. Returns false (and leaves
    /// the buffer untouched) when the tailroom is too small.
    fn append(&mut self, len: usize) -> bool;

    /// Remove `len` bytes from the end of the frame.
    fn trim(&mut self, len: usize) -> bool;
}

/// Memory-mapped buffer pool
///
/// Allocation and release are lock-free, so workers on different cores can
/// share a pool.
pub struct BufferPool {
    /// Base pointer to mmap'd region
    base: NonNull<u8>,
    /// Total size of mapped region
    size: usize,
    /// Size of one slot
    buf_size: usize,
    /// Number of slots
    count: usize,
    /// Free list of slot indices
    free: ArrayQueue<u32>,
    using_hugepages: bool,
}

// SAFETY: the mapping is owned by the pool for its whole lifetime, each slot
// is handed to at most one PoolBuffer at a time, and ArrayQueue is thread-safe.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool of `count` slots of `buf_size` bytes each.
    ///
    /// Tries 2MB hugepages first and falls back to regular pages.
    pub fn new(count: usize, buf_size: usize) -> io::Result<Self> {
        if count == 0 || count > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer count out of range",
            ));
        }
        if buf_size <= HEADROOM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer size must exceed the {HEADROOM}-byte headroom"),
            ));
        }

        let size = count
            .checked_mul(buf_size)
            .ok_or_else(|| io::Error::other("pool size overflow"))?;

        let (ptr, using_hugepages) =
            Self::try_mmap_hugepages(size).or_else(|_| Self::mmap_regular(size))?;

        let base =
            NonNull::new(ptr).ok_or_else(|| io::Error::other("mmap returned null pointer"))?;

        let free = ArrayQueue::new(count);
        for i in 0..count {
            // ArrayQueue::push only fails if full, which can't happen here
            let _ = free.push(i as u32);
        }

        tracing::info!(
            pool_size_kb = size / 1024,
            buffer_count = count,
            buffer_size = buf_size,
            hugepages = using_hugepages,
            "Buffer pool created"
        );

        Ok(Self {
            base,
            size,
            buf_size,
            count,
            free,
            using_hugepages,
        })
    }

    fn try_mmap_hugepages(size: usize) -> io::Result<(*mut u8, bool)> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
        Self::mmap(size, flags).map(|ptr| (ptr, true))
    }

    fn mmap_regular(size: usize) -> io::Result<(*mut u8, bool)> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        Self::mmap(size, flags).map(|ptr| (ptr, false))
    }

    fn mmap(size: usize, flags: MapFlags) -> io::Result<*mut u8> {
        let length = size
            .try_into()
            .map_err(|_| io::Error::other("zero-sized pool"))?;

        // SAFETY: anonymous private mapping, no existing memory is aliased
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok(ptr.as_ptr().cast())
    }

    /// Allocate a buffer, or `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PoolBuffer> {
        self.free.pop().map(|index| PoolBuffer {
            pool: Arc::clone(self),
            index,
            start: HEADROOM,
            len: 0,
        })
    }

    /// Number of free slots
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Size of one slot
    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    pub fn using_hugepages(&self) -> bool {
        self.using_hugepages
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < count (enforced by the free list contents)
        unsafe { self.base.as_ptr().add(index as usize * self.buf_size) }
    }

    #[inline]
    fn release(&self, index: u32) {
        // Cannot overflow: only indices handed out by alloc() come back
        let _ = self.free.push(index);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: self.base was mapped with self.size bytes in new()
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.as_ptr().cast());
            let _ = munmap(ptr, self.size);
        }
    }
}

/// A buffer owned from the pool
///
/// Returns to its pool when dropped.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    index: u32,
    /// Frame start within the slot
    start: usize,
    /// Frame length
    len: usize,
}

impl PoolBuffer {
    /// Frame length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes in front of the frame.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Largest frame this buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.buf_size - self.start
    }

    /// Writable area from frame start to the end of the slot.
    ///
    /// Device receive paths read into this and then call [`set_len`].
    ///
    /// [`set_len`]: PoolBuffer::set_len
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        let capacity = self.capacity();
        // SAFETY: start..buf_size lies inside this buffer's slot, which we own
        unsafe { std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.index).add(self.start), capacity) }
    }

    /// Set the frame length after writing into [`write_area`].
    ///
    /// # Panics
    /// Panics if `len` exceeds the buffer capacity.
    ///
    /// [`write_area`]: PoolBuffer::write_area
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "frame length exceeds buffer capacity");
        self.len = len;
    }

    /// Replace the frame with a copy of `frame`. Returns false if it does not fit.
    pub fn copy_from(&mut self, frame: &[u8]) -> bool {
        if frame.len() > self.capacity() {
            return false;
        }
        self.write_area()[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        true
    }
}

impl PacketBuffer for PoolBuffer {
    #[inline]
    fn data(&self) -> &[u8] {
        // SAFETY: start..start+len lies inside this buffer's slot
        unsafe { std::slice::from_raw_parts(self.pool.slot_ptr(self.index).add(self.start), self.len) }
    }

    #[inline]
    fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: start..start+len lies inside this buffer's slot, which we own
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.index).add(self.start), self.len)
        }
    }

    #[inline]
    fn tailroom(&self) -> usize {
        self.pool.buf_size - self.start - self.len
    }

    #[inline]
    fn append(&mut self, len: usize) -> bool {
        if len > self.tailroom() {
            return false;
        }
        self.len += len;
        true
    }

    #[inline]
    fn trim(&mut self, len: usize) -> bool {
        if len > self.len {
            return false;
        }
        self.len -= len;
        true
    }
}

impl Drop for PoolBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}
