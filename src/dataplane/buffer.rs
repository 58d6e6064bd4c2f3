//! Zero-copy packet buffer pools.
//!
//! Pre-allocates memory using hugepages (if available) and provides
//! lock-free buffer allocation for the data plane. There is one pool per
//! NUMA node so that packet memory stays local to the lcore touching it.
//!
//! Ownership of a buffer is linear: exactly one component holds a
//! `PktBuf` at any moment, transmit and free consume it, and dropping it
//! returns it to its pool.

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::{Error, Result};

/// Headroom reserved in front of every packet for prepending outer headers.
pub const HEADROOM: usize = 128;

/// Total size of one buffer, headroom included.
pub const BUFFER_SIZE: usize = 2048;

/// Maximum payload per buffer.
pub const MAX_PKT: usize = BUFFER_SIZE - HEADROOM;

/// Default number of buffers per pool.
pub const POOL_SIZE: usize = 1024;

/// Checksum-offload flag: packet carries an IPv4 header.
pub const OL_TX_IPV4: u64 = 1 << 0;
/// Checksum-offload flag: hardware computes the IPv4 header checksum.
pub const OL_TX_IP_CKSUM: u64 = 1 << 1;
/// Checksum-offload flag: the outer header of a tunneled packet is IPv4.
pub const OL_TX_OUTER_IPV4: u64 = 1 << 2;

/// Memory-mapped buffer pool.
///
/// Provides lock-free allocation and deallocation of fixed-size buffers.
pub struct BufferPool {
    /// Base pointer to mmap'd region.
    base: NonNull<u8>,
    /// Total size of mapped region.
    size: usize,
    /// Free list (lock-free queue of buffer indices).
    free: ArrayQueue<u32>,
    capacity: usize,
}

// SAFETY: BufferPool hands out disjoint regions of mmap'd memory, indexed
// through the thread-safe ArrayQueue free list.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool of `capacity` buffers.
    ///
    /// Attempts 2MB hugepages first and falls back to regular pages.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let size = BUFFER_SIZE * capacity;

        let ptr = Self::try_mmap_hugepages(size).or_else(|_| Self::mmap_regular(size))?;
        let base = NonNull::new(ptr).ok_or_else(|| io::Error::other("mmap returned null"))?;

        let free = ArrayQueue::new(capacity);
        for i in 0..capacity {
            // Cannot fail: the queue was sized for exactly this many entries.
            let _ = free.push(i as u32);
        }

        Ok(Self {
            base,
            size,
            free,
            capacity,
        })
    }

    fn try_mmap_hugepages(size: usize) -> io::Result<*mut u8> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into().map_err(|_| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };
        Ok(ptr.as_ptr().cast())
    }

    fn mmap_regular(size: usize) -> io::Result<*mut u8> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into().map_err(|_| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };
        Ok(ptr.as_ptr().cast())
    }

    /// Allocate a buffer. Returns `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PktBuf> {
        self.free.pop().map(|idx| PktBuf {
            pool: Arc::clone(self),
            index: idx,
            start: HEADROOM,
            len: 0,
            ol_flags: 0,
            outer_l2_len: 0,
            outer_l3_len: 0,
        })
    }

    /// Number of buffers currently available.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < capacity, enforced by the free list.
        unsafe { self.base.as_ptr().add(index as usize * BUFFER_SIZE) }
    }

    #[inline]
    fn return_buffer(&self, index: u32) {
        let _ = self.free.push(index);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: self.base was allocated by mmap in new().
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.as_ptr().cast());
            let _ = munmap(ptr, self.size);
        }
    }
}

/// One pool per NUMA node.
pub struct PktPools {
    pools: Vec<Arc<BufferPool>>,
}

impl PktPools {
    pub fn new(numa_nodes: usize, bufs_per_pool: usize) -> io::Result<Self> {
        let mut pools = Vec::with_capacity(numa_nodes);
        for _ in 0..numa_nodes.max(1) {
            pools.push(Arc::new(BufferPool::new(bufs_per_pool)?));
        }
        Ok(Self { pools })
    }

    /// Pool local to the given NUMA node.
    #[inline]
    pub fn pool(&self, numa_node: usize) -> &Arc<BufferPool> {
        &self.pools[numa_node.min(self.pools.len() - 1)]
    }

    pub fn numa_nodes(&self) -> usize {
        self.pools.len()
    }
}

/// A packet buffer owned from a pool.
///
/// Holds a data region `[start, start + len)` inside its slot, with
/// headroom in front for prepending headers without copying. Returns to
/// the pool when dropped.
pub struct PktBuf {
    pool: Arc<BufferPool>,
    index: u32,
    start: usize,
    len: usize,
    /// Checksum-offload flags (`OL_TX_*`).
    pub ol_flags: u64,
    /// Length of the outer L2 header for tunneled packets.
    pub outer_l2_len: u8,
    /// Length of the outer L3 header for tunneled packets.
    pub outer_l3_len: u8,
}

impl PktBuf {
    /// Immutable view of the data region.
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: start and len are kept within the slot bounds.
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts(ptr, self.len)
        }
    }

    /// Mutable view of the data region.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: start and len are kept within the slot bounds.
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, self.len)
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remaining headroom in front of the data region.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Writable area from the data start to the end of the slot. Use with
    /// `set_len` when reading a frame into the buffer.
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: start is kept within the slot bounds.
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, BUFFER_SIZE - self.start)
        }
    }

    /// Set the length of the valid data region.
    ///
    /// # Panics
    /// Panics if `len` exceeds the writable area.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(self.start + len <= BUFFER_SIZE);
        self.len = len;
    }

    /// Fill the buffer from a byte slice.
    pub fn fill_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > BUFFER_SIZE - self.start {
            return Err(Error::Exhausted("packet larger than buffer"));
        }
        self.write_area()[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// Grow the data region into the headroom and return the new front.
    ///
    /// Fails when the headroom is too small, leaving the buffer untouched.
    #[inline]
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8]> {
        if self.start < n {
            return Err(Error::Exhausted("headroom"));
        }
        self.start -= n;
        self.len += n;
        // SAFETY: the bounds were just adjusted within the slot.
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            Ok(std::slice::from_raw_parts_mut(ptr, n))
        }
    }

    /// Remove `n` bytes from the front of the data region.
    #[inline]
    pub fn adj(&mut self, n: usize) -> Result<()> {
        if self.len < n {
            return Err(Error::Malformed("short packet"));
        }
        self.start += n;
        self.len -= n;
        Ok(())
    }
}

impl Drop for PktBuf {
    #[inline]
    fn drop(&mut self) {
        self.pool.return_buffer(self.index);
    }
}

impl std::fmt::Debug for PktBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PktBuf")
            .field("index", &self.index)
            .field("len", &self.len)
            .field("headroom", &self.start)
            .finish()
    }
}

/// Render a packet as hex for diagnostic dumps.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3 + data.len() / 16 + 1);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(if i % 16 == 0 { '\n' } else { ' ' });
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = Arc::new(BufferPool::new(64).expect("Failed to create pool"));
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn test_alloc_and_drop_returns_buffer() {
        let pool = Arc::new(BufferPool::new(64).expect("Failed to create pool"));
        {
            let _buf = pool.alloc().expect("Failed to alloc");
            assert_eq!(pool.available(), 63);
        }
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn test_prepend_and_adj_round_trip() {
        let pool = Arc::new(BufferPool::new(8).expect("Failed to create pool"));
        let mut buf = pool.alloc().unwrap();
        buf.fill_from(&[0x45, 0x00, 0x00, 0x28]).unwrap();

        let hdr = buf.prepend(14).unwrap();
        hdr.copy_from_slice(&[0xff; 14]);
        assert_eq!(buf.len(), 18);

        buf.adj(14).unwrap();
        assert_eq!(buf.data(), &[0x45, 0x00, 0x00, 0x28]);
    }

    #[test]
    fn test_prepend_beyond_headroom_fails() {
        let pool = Arc::new(BufferPool::new(8).expect("Failed to create pool"));
        let mut buf = pool.alloc().unwrap();
        assert!(buf.prepend(HEADROOM).is_ok());
        assert!(matches!(buf.prepend(1), Err(Error::Exhausted(_))));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = Arc::new(BufferPool::new(16).expect("Failed to create pool"));
        let mut bufs = Vec::new();
        for _ in 0..16 {
            bufs.push(pool.alloc().expect("Should be able to alloc"));
        }
        assert!(pool.alloc().is_none());
        bufs.pop();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_buffer_send_across_threads() {
        let pool = Arc::new(BufferPool::new(8).expect("Failed to create pool"));
        let mut buf = pool.alloc().unwrap();
        buf.fill_from(b"hello").unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            tx.send(buf).unwrap();
        });
        let received = rx.recv().unwrap();
        assert_eq!(received.data(), b"hello");
    }

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(dump, "de ad be ef");
        let dump = hex_dump(&[0u8; 17]);
        assert_eq!(dump.lines().count(), 2);
    }
}
