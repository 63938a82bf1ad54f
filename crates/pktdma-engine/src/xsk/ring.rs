//! Single-producer/single-consumer descriptor rings.
//!
//! Each side keeps a cached index ahead of the published one: producers
//! reserve slots and publish them later with [`DescRing::flush`], consumers
//! peek entries and hand the slots back with [`DescRing::release`]. This is
//! what lets the receive path batch redirects until the poll loop flushes
//! and lets the transmit drain look ahead without consuming.

use std::sync::Mutex;

struct RingInner<T> {
    slots: Box<[T]>,
    producer: u32,
    consumer: u32,
    cached_prod: u32,
    cached_cons: u32,
}

impl<T: Copy> RingInner<T> {
    fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    fn mask(&self) -> u32 {
        self.size() - 1
    }

    /// Free slots for the producer, counting unpublished reservations
    fn available(&self) -> u32 {
        self.size() - self.cached_prod.wrapping_sub(self.consumer)
    }

    /// Published entries the consumer has not peeked yet
    fn ready(&self) -> u32 {
        self.producer.wrapping_sub(self.cached_cons)
    }

    fn reserve(&mut self, count: u32) -> Option<u32> {
        if self.available() < count {
            return None;
        }
        let idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(count);
        Some(idx)
    }

    fn peek(&mut self, count: u32) -> Option<u32> {
        if self.ready() < count {
            return None;
        }
        let idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(count);
        Some(idx)
    }

    fn slot(&mut self, idx: u32) -> &mut T {
        let mask = self.mask();
        &mut self.slots[(idx & mask) as usize]
    }
}

/// Descriptor ring shared between the engine and a pool consumer
pub struct DescRing<T> {
    inner: Mutex<RingInner<T>>,
}

impl<T: Copy + Default> DescRing<T> {
    /// Create a ring with `size` slots, rounded up to a power of two
    pub fn new(size: u32) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            inner: Mutex::new(RingInner {
                slots: vec![T::default(); size as usize].into_boxed_slice(),
                producer: 0,
                consumer: 0,
                cached_prod: 0,
                cached_cons: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of slots
    pub fn size(&self) -> u32 {
        self.lock().size()
    }

    /// Write one entry without publishing it
    pub fn produce_pending(&self, item: T) -> bool {
        let mut ring = self.lock();
        match ring.reserve(1) {
            Some(idx) => {
                *ring.slot(idx) = item;
                true
            }
            None => false,
        }
    }

    /// Write and publish one entry
    pub fn produce(&self, item: T) -> bool {
        let mut ring = self.lock();
        match ring.reserve(1) {
            Some(idx) => {
                *ring.slot(idx) = item;
                ring.producer = ring.cached_prod;
                true
            }
            None => false,
        }
    }

    /// Publish up to `count` pending entries, returning how many were published
    pub fn submit(&self, count: u32) -> u32 {
        let mut ring = self.lock();
        let pending = ring.cached_prod.wrapping_sub(ring.producer);
        let n = pending.min(count);
        ring.producer = ring.producer.wrapping_add(n);
        n
    }

    /// Publish every pending entry
    pub fn flush(&self) -> u32 {
        self.submit(u32::MAX)
    }

    /// Entries written but not yet published
    pub fn pending(&self) -> u32 {
        let ring = self.lock();
        ring.cached_prod.wrapping_sub(ring.producer)
    }

    /// Look at the next entry without freeing its slot
    pub fn peek(&self) -> Option<T> {
        let mut ring = self.lock();
        let idx = ring.peek(1)?;
        Some(*ring.slot(idx))
    }

    /// Free every peeked slot
    pub fn release(&self) {
        let mut ring = self.lock();
        ring.consumer = ring.cached_cons;
    }

    /// Peek and release one entry
    pub fn consume(&self) -> Option<T> {
        let mut ring = self.lock();
        let idx = ring.peek(1)?;
        let item = *ring.slot(idx);
        ring.consumer = ring.cached_cons;
        Some(item)
    }

    /// Published entries not yet peeked
    pub fn ready(&self) -> u32 {
        self.lock().ready()
    }

    /// Free slots for the producer
    pub fn available(&self) -> u32 {
        self.lock().available()
    }

    /// Whether nothing is published or pending
    pub fn is_empty(&self) -> bool {
        let ring = self.lock();
        ring.cached_prod == ring.consumer
    }
}

impl<T> std::fmt::Debug for DescRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescRing").finish_non_exhaustive()
    }
}
