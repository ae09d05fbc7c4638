//! Single-producer single-consumer envelope ring over raw shared memory.
//!
//! One ring lives in each arena's reserved region and carries traffic in
//! one direction only: the arena's creator produces, the opener consumes.
//! Head and tail sit on separate cache lines; indices grow monotonically
//! and wrap through a power-of-two mask.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::envelope::Envelope;
use crate::error::Error;

/// Ring bookkeeping, three cache lines.
#[repr(C, align(64))]
pub struct RingHeader {
    /// Next slot to consume. Written only by the consumer.
    head: AtomicU32,
    _pad0: [u8; 60],
    /// Next slot to fill. Written only by the producer.
    tail: AtomicU32,
    _pad1: [u8; 60],
    /// Slot count, power of two. Set once at init, read-only after.
    capacity: u32,
    _pad2: [u8; 60],
}

pub const RING_HEADER_SIZE: usize = core::mem::size_of::<RingHeader>();

const _: () = assert!(RING_HEADER_SIZE == 192);

/// Largest slot count an attach will accept.
const MAX_CAPACITY: u32 = 1 << 16;

/// Bytes of reserved space a ring with `capacity` slots occupies.
pub const fn ring_bytes(capacity: u32) -> usize {
    RING_HEADER_SIZE + capacity as usize * core::mem::size_of::<Envelope>()
}

/// Process-local view over a ring embedded at some shared address.
pub struct Ring {
    header: *const RingHeader,
    slots: *mut Envelope,
    mask: u32,
}

// SAFETY: ring state is accessed through atomics; slot hand-off is ordered
// by the head/tail Release/Acquire pairs.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Initialize a fresh ring at `base` and return a view of it.
    ///
    /// # Safety
    ///
    /// `base` must point at `ring_bytes(capacity)` zero-initialized,
    /// 64-byte-aligned bytes that outlive the view. `capacity` must be a
    /// power of two.
    pub unsafe fn init(base: *mut u8, capacity: u32) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let header = base as *mut RingHeader;
        // SAFETY: caller guarantees extent and exclusivity during init.
        unsafe {
            (*header).head = AtomicU32::new(0);
            (*header).tail = AtomicU32::new(0);
            (*header).capacity = capacity;
        }
        // SAFETY: slots follow the header within the caller's extent.
        let slots = unsafe { base.add(RING_HEADER_SIZE) } as *mut Envelope;
        Self {
            header,
            slots,
            mask: capacity - 1,
        }
    }

    /// Attach to a ring a peer initialized at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a region laid out by [`Ring::init`] that
    /// outlives the view.
    pub unsafe fn attach(base: *mut u8) -> Result<Self, Error> {
        let header = base as *const RingHeader;
        // SAFETY: the header is within the caller's extent.
        let capacity = unsafe { (*header).capacity };
        if !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(Error::HandshakeMismatch("bad ring capacity"));
        }
        // SAFETY: as in init.
        let slots = unsafe { base.add(RING_HEADER_SIZE) } as *mut Envelope;
        Ok(Self {
            header,
            slots,
            mask: capacity - 1,
        })
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: valid for the view's lifetime per init/attach contract.
        unsafe { &*self.header }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Envelopes currently queued.
    pub fn len(&self) -> u32 {
        let h = self.header();
        h.tail
            .load(Ordering::Acquire)
            .wrapping_sub(h.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: enqueue one envelope. Returns false when full.
    pub fn try_push(&self, env: Envelope) -> bool {
        let h = self.header();
        let tail = h.tail.load(Ordering::Relaxed);
        let head = h.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.mask {
            return false;
        }
        // SAFETY: this slot index is owned by the producer until the tail
        // store below publishes it.
        unsafe {
            self.slots.add((tail & self.mask) as usize).write(env);
        }
        h.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side: dequeue one envelope, if any.
    pub fn try_pop(&self) -> Option<Envelope> {
        let h = self.header();
        let head = h.head.load(Ordering::Relaxed);
        let tail = h.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the Acquire on tail ordered the producer's slot write
        // before this read; the slot stays ours until the head store.
        let env = unsafe { self.slots.add((head & self.mask) as usize).read() };
        h.head.store(head.wrapping_add(1), Ordering::Release);
        Some(env)
    }
}
