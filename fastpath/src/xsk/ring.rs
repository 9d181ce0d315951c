//! Single-producer/single-consumer descriptor rings.
//!
//! Indices are free-running `u32`s; a slot is addressed with `index & mask`.
//! The producer side runs reserve -> write -> publish, the consumer side
//! peek -> read -> release. Publishing stores the producer index with
//! `Release` after the slots are written, and the consumer loads it with
//! `Acquire` before reading them; the consumer index works the same way in
//! the other direction. `producer - consumer` never exceeds the ring size.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// RX/TX descriptor: a frame address inside the UMEM and the packet length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
}

struct RingInner<T> {
    slots: Box<[UnsafeCell<T>]>,
    size: u32,
    mask: u32,
    producer: AtomicU32,
    consumer: AtomicU32,
}

// SAFETY: a slot is written only by the single Producer while it lies in the
// free region and read only by the single Consumer after it was published.
// The index handoff above orders those accesses.
unsafe impl<T: Send> Sync for RingInner<T> {}

impl<T> RingInner<T> {
    #[inline]
    fn slot(&self, index: u32) -> *mut T {
        self.slots[(index & self.mask) as usize].get()
    }
}

/// Create a ring with `size` slots.
///
/// # Panics
/// Panics if `size` is not a power of two.
pub fn ring<T: Copy + Default>(size: u32) -> (Producer<T>, Consumer<T>) {
    ring_starting_at(size, 0)
}

fn ring_starting_at<T: Copy + Default>(size: u32, start: u32) -> (Producer<T>, Consumer<T>) {
    assert!(size.is_power_of_two(), "ring size must be a power of two");
    let inner = Arc::new(RingInner {
        slots: (0..size).map(|_| UnsafeCell::new(T::default())).collect(),
        size,
        mask: size - 1,
        producer: AtomicU32::new(start),
        consumer: AtomicU32::new(start),
    });
    (
        Producer {
            inner: Arc::clone(&inner),
            head: start,
            reserved: 0,
        },
        Consumer {
            inner,
            tail: start,
            peeked: 0,
        },
    )
}

/// Producer end of a ring
pub struct Producer<T> {
    inner: Arc<RingInner<T>>,
    /// Local copy of the producer index
    head: u32,
    reserved: u32,
}

impl<T: Copy> Producer<T> {
    pub fn size(&self) -> u32 {
        self.inner.size
    }

    /// Entries published but not yet released by the consumer
    #[inline]
    pub fn occupancy(&self) -> u32 {
        self.head
            .wrapping_sub(self.inner.consumer.load(Ordering::Acquire))
    }

    #[inline]
    pub fn free(&self) -> u32 {
        self.inner.size - self.occupancy()
    }

    /// Reserve up to `n` slots; returns how many were reserved.
    #[inline]
    pub fn reserve(&mut self, n: u32) -> u32 {
        self.reserved = n.min(self.free());
        self.reserved
    }

    /// Write the `offset`-th reserved slot.
    ///
    /// # Panics
    /// Panics if `offset` is outside the current reservation.
    #[inline]
    pub fn write(&mut self, offset: u32, value: T) {
        assert!(offset < self.reserved, "write outside reservation");
        // SAFETY: the slot is reserved, so the consumer cannot be reading it.
        unsafe { *self.inner.slot(self.head.wrapping_add(offset)) = value };
    }

    /// Make the first `n` reserved slots visible to the consumer.
    ///
    /// # Panics
    /// Panics if `n` exceeds the current reservation.
    #[inline]
    pub fn publish(&mut self, n: u32) {
        assert!(n <= self.reserved, "publish beyond reservation");
        self.head = self.head.wrapping_add(n);
        self.reserved = 0;
        self.inner.producer.store(self.head, Ordering::Release);
    }

    /// Reserve, write and publish one entry.
    #[inline]
    pub fn push(&mut self, value: T) -> bool {
        if self.reserve(1) == 0 {
            return false;
        }
        self.write(0, value);
        self.publish(1);
        true
    }

    pub fn index(&self) -> u32 {
        self.head
    }
}

/// Consumer end of a ring
pub struct Consumer<T> {
    inner: Arc<RingInner<T>>,
    /// Local copy of the consumer index
    tail: u32,
    peeked: u32,
}

impl<T: Copy> Consumer<T> {
    pub fn size(&self) -> u32 {
        self.inner.size
    }

    /// Entries ready to be read
    #[inline]
    pub fn available(&self) -> u32 {
        self.inner
            .producer
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail)
    }

    /// Look at up to `n` ready entries; returns how many can be read.
    #[inline]
    pub fn peek(&mut self, n: u32) -> u32 {
        self.peeked = n.min(self.available());
        self.peeked
    }

    /// Read the `offset`-th peeked entry.
    ///
    /// # Panics
    /// Panics if `offset` is outside the current peek.
    #[inline]
    pub fn read(&self, offset: u32) -> T {
        assert!(offset < self.peeked, "read outside peek");
        // SAFETY: the slot was published and is not released yet, so the
        // producer cannot be writing it.
        unsafe { *self.inner.slot(self.tail.wrapping_add(offset)) }
    }

    /// Hand the first `n` peeked entries back to the producer.
    ///
    /// # Panics
    /// Panics if `n` exceeds the current peek.
    #[inline]
    pub fn release(&mut self, n: u32) {
        assert!(n <= self.peeked, "release beyond peek");
        self.tail = self.tail.wrapping_add(n);
        self.peeked -= n;
        self.inner.consumer.store(self.tail, Ordering::Release);
    }

    /// Peek, read and release one entry.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        if self.peek(1) == 0 {
            return None;
        }
        let value = self.read(0);
        self.release(1);
        Some(value)
    }

    pub fn index(&self) -> u32 {
        self.tail
    }
}
