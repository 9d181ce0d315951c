//! Frame region shared between the engine and its transport.
//!
//! One anonymous mapping split into `frame_count` frames of `frame_size`
//! bytes. Frames are addressed by their byte offset from the start of the
//! region. Free frames live in a lock-free queue; every frame is at any time
//! either in that queue or owned by exactly one ring.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

pub struct Umem {
    base: NonNull<u8>,
    size: usize,
    frame_size: u32,
    frame_count: u32,
    free: ArrayQueue<u64>,
    /// Per frame: true while out of the free pool
    in_flight: Box<[AtomicBool]>,
    using_hugepages: bool,
}

// SAFETY: the mapping is process-global and only released in Drop. Access to
// frame contents is coordinated by frame ownership, see `frame_mut`.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

impl Umem {
    pub fn new(config: &EngineConfig) -> io::Result<Self> {
        let size = config.frame_size as usize * config.frame_count as usize;

        let (ptr, using_hugepages) = if config.use_hugepages && size % HUGEPAGE_SIZE == 0 {
            Self::mmap(size, true).or_else(|_| Self::mmap(size, false))?
        } else {
            Self::mmap(size, false)?
        };

        let free = ArrayQueue::new(config.frame_count as usize);
        for i in 0..config.frame_count as u64 {
            // Capacity equals frame_count, so this cannot fail
            let _ = free.push(i * config.frame_size as u64);
        }

        info!(
            size_kb = size / 1024,
            frame_count = config.frame_count,
            frame_size = config.frame_size,
            hugepages = using_hugepages,
            "UMEM mapped"
        );

        Ok(Self {
            base: ptr,
            size,
            frame_size: config.frame_size,
            frame_count: config.frame_count,
            free,
            in_flight: (0..config.frame_count).map(|_| AtomicBool::new(false)).collect(),
            using_hugepages,
        })
    }

    fn mmap(size: usize, hugepages: bool) -> io::Result<(NonNull<u8>, bool)> {
        let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        if hugepages {
            flags |= MapFlags::MAP_HUGETLB;
        }

        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into()
                    .map_err(|_| io::Error::other("UMEM size must be non-zero"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok((ptr.cast(), hugepages))
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn using_hugepages(&self) -> bool {
        self.using_hugepages
    }

    /// Take a free frame, returning its address.
    #[inline]
    pub fn alloc_frame(&self) -> Option<u64> {
        let addr = self.free.pop()?;
        self.in_flight[self.index(addr)].store(true, Ordering::Release);
        Some(addr)
    }

    /// Return a frame to the free pool.
    ///
    /// Only frames handed out by `alloc_frame` are accepted; anything else,
    /// including a second free of the same frame, is logged and ignored.
    /// Returns whether the frame went back to the pool.
    pub fn free_frame(&self, addr: u64) -> bool {
        if !self.is_frame(addr) {
            warn!(addr, "Free of an address outside the UMEM");
            return false;
        }
        if self.in_flight[self.index(addr)]
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(addr, "Frame freed twice");
            return false;
        }
        // One slot per frame and this frame was not in the queue
        let _ = self.free.push(addr);
        true
    }

    #[inline]
    fn index(&self, addr: u64) -> usize {
        (addr / self.frame_size as u64) as usize
    }

    /// Number of frames in the free pool
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// True if `addr` is the start of a frame in this region.
    #[inline]
    pub fn is_frame(&self, addr: u64) -> bool {
        addr % self.frame_size as u64 == 0 && addr < self.size as u64
    }

    /// True if `addr` is a frame and `len` bytes fit in it.
    #[inline]
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        self.is_frame(addr) && len <= self.frame_size as usize
    }

    /// View the first `len` bytes of a frame.
    ///
    /// # Safety
    /// `contains(addr, len)` must hold and the caller must own the frame, i.e.
    /// it was popped from a ring or the free pool and not handed on yet.
    #[inline]
    pub unsafe fn frame(&self, addr: u64, len: usize) -> &[u8] {
        debug_assert!(self.contains(addr, len));
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(addr as usize), len) }
    }

    /// Mutable view of the first `len` bytes of a frame.
    ///
    /// # Safety
    /// Same as [`Umem::frame`]. No other view of the same frame may exist.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, addr: u64, len: usize) -> &mut [u8] {
        debug_assert!(self.contains(addr, len));
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(addr as usize), len) }
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        // SAFETY: base/size describe the mapping created in new()
        unsafe {
            let _ = munmap(self.base.cast(), self.size);
        }
        debug!(size_kb = self.size / 1024, "UMEM unmapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small(frame_count: u32) -> Umem {
        let config = EngineConfig::default()
            .with_frame_count(frame_count)
            .with_hugepages(false);
        Umem::new(&config).unwrap()
    }

    #[test]
    fn test_frames_are_distinct_and_aligned() {
        let umem = small(16);
        let mut seen = HashSet::new();
        while let Some(addr) = umem.alloc_frame() {
            assert!(umem.is_frame(addr));
            assert!(seen.insert(addr));
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_exhaustion_and_return() {
        let umem = small(2);
        let a = umem.alloc_frame().unwrap();
        let _b = umem.alloc_frame().unwrap();
        assert!(umem.alloc_frame().is_none());
        assert_eq!(umem.available(), 0);

        umem.free_frame(a);
        assert_eq!(umem.available(), 1);
        assert_eq!(umem.alloc_frame(), Some(a));
    }

    #[test]
    fn test_frame_contents_are_isolated() {
        let umem = small(4);
        let a = umem.alloc_frame().unwrap();
        let b = umem.alloc_frame().unwrap();
        unsafe {
            umem.frame_mut(a, 4).copy_from_slice(&[1, 2, 3, 4]);
            umem.frame_mut(b, 4).copy_from_slice(&[9, 9, 9, 9]);
            assert_eq!(umem.frame(a, 4), &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_contains_bounds() {
        let umem = small(4);
        assert!(umem.contains(0, 2048));
        assert!(!umem.contains(0, 2049));
        assert!(!umem.contains(100, 10));
        assert!(!umem.contains(4 * 2048, 10));
    }

    #[test]
    fn test_double_free_is_ignored() {
        let umem = small(4);
        let a = umem.alloc_frame().unwrap();
        let _b = umem.alloc_frame().unwrap();

        assert!(umem.free_frame(a));
        assert!(!umem.free_frame(a));
        assert_eq!(umem.available(), 3);

        // Every frame is handed out exactly once
        let mut seen = HashSet::new();
        while let Some(addr) = umem.alloc_frame() {
            assert!(seen.insert(addr), "frame {addr} handed out twice");
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_free_of_unallocated_frame_is_ignored() {
        let umem = small(4);
        assert!(!umem.free_frame(2048));
        assert!(!umem.free_frame(100));
        assert!(!umem.free_frame(4 * 2048));
        assert_eq!(umem.available(), 4);
    }
}
