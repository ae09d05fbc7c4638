//! The shared arena segment: header, bump heap, and free lists.
//!
//! # Segment layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ArenaHeader (64 bytes)                                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Free-list heads (one tagged AtomicU64 per size class)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Reserved region (embedding layer: link header, ring, ...)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Heap (bump allocated, high-water mark in the header)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one process creates a given name; everyone else opens it. The
//! creator owns the backing file and unlinks it on drop. All heap
//! addressing is by offset relative to the heap base; either side of a
//! connection may allocate and free, which is why the free-list heads
//! live inside the segment and use tagged CAS pushes/pops.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ArenaError;
use crate::mapping::{file_len, map_file, Mapping};

/// Magic bytes at the start of every arena segment.
pub const ARENA_MAGIC: [u8; 8] = *b"QUARRY\0\0";

/// Segment format version (major.minor packed into u32).
pub const ARENA_VERSION: u32 = 1 << 16; // v1.0

/// Smallest heap block; also the block alignment.
pub const MIN_BLOCK: u32 = 16;

/// Sentinel heap offset meaning "none".
pub const NIL: u32 = u32::MAX;

/// Number of power-of-two size classes (2^4 ..= 2^31).
const NUM_CLASSES: usize = 28;

const HEADER_SIZE: usize = 64;
const FREE_HEADS_SIZE: usize = NUM_CLASSES * 8;

/// Which side of the segment this handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the segment and owns the backing file.
    Creator,
    /// Opened a segment created by a peer.
    Opener,
}

/// Segment header at offset 0 (64 bytes).
#[repr(C, align(64))]
struct ArenaHeader {
    magic: [u8; 8],
    version: u32,
    reserved_len: u32,
    heap_offset: u64,
    heap_capacity: u64,
    /// Bump pointer, relative to the heap base.
    high_water: AtomicU64,
    _pad: [u8; 24],
}

const _: () = assert!(core::mem::size_of::<ArenaHeader>() == HEADER_SIZE);

impl ArenaHeader {
    fn validate(&self) -> Result<(), ArenaError> {
        if self.magic != ARENA_MAGIC {
            return Err(ArenaError::BadSegment("invalid magic bytes"));
        }
        if self.version >> 16 != ARENA_VERSION >> 16 {
            return Err(ArenaError::VersionMismatch {
                expected: ARENA_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Map a logical channel name to its backing file.
///
/// Names are opaque at this layer; anything outside `[A-Za-z0-9._-]` is
/// replaced so schemes like `ipc://calc` stay usable.
pub fn segment_path(name: &str) -> PathBuf {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    std::env::temp_dir().join(format!("quarry-{}.shm", sanitized))
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Round an allocation up to its block size (power of two, >= MIN_BLOCK).
#[inline]
pub(crate) fn block_size(size: u32) -> u32 {
    size.max(MIN_BLOCK).next_power_of_two()
}

#[inline]
fn class_of(block: u32) -> usize {
    debug_assert!(block.is_power_of_two() && block >= MIN_BLOCK);
    (block.trailing_zeros() - MIN_BLOCK.trailing_zeros()) as usize
}

/// A named, fixed-capacity shared-memory arena.
pub struct Arena {
    name: String,
    role: Role,
    mapping: Arc<Mapping>,
}

// SAFETY: all cross-process state in the segment is accessed through
// atomics; the mapping itself stays valid for the Arena's lifetime.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create a new named segment.
    ///
    /// `reserved_len` bytes between the header and the heap are left to the
    /// embedding layer (see [`Arena::reserved`]); `heap_capacity` is the
    /// usable allocation space. Fails if the name is already taken.
    #[tracing::instrument(level = "debug", skip(name), fields(name = %name.as_ref()))]
    pub fn create(
        name: impl AsRef<str>,
        reserved_len: u32,
        heap_capacity: u64,
    ) -> Result<Arc<Self>, ArenaError> {
        let name = name.as_ref();
        if heap_capacity == 0 {
            return Err(ArenaError::InvalidConfig("heap capacity must be > 0"));
        }
        if heap_capacity > u32::MAX as u64 {
            return Err(ArenaError::InvalidConfig("heap capacity must fit in 32 bits"));
        }

        let reserved_len = align_up(reserved_len as usize, 64);
        let heap_offset = align_up(HEADER_SIZE + FREE_HEADS_SIZE, 64) + reserved_len;
        let total = heap_offset
            .checked_add(heap_capacity as usize)
            .ok_or(ArenaError::InvalidConfig("segment size overflow"))?;

        let path = segment_path(name);
        let mapping = map_file(&path, total, true)?;

        // The file is fresh and zero-filled; only the header needs writing.
        // SAFETY: the mapping is at least HEADER_SIZE bytes and exclusive
        // until the name is published.
        unsafe {
            let header = &mut *(mapping.base_ptr() as *mut ArenaHeader);
            header.magic = ARENA_MAGIC;
            header.version = ARENA_VERSION;
            header.reserved_len = reserved_len as u32;
            header.heap_offset = heap_offset as u64;
            header.heap_capacity = heap_capacity;
            header.high_water = AtomicU64::new(0);
        }

        tracing::info!(name, total, heap_capacity, "created arena segment");

        Ok(Arc::new(Self {
            name: name.to_owned(),
            role: Role::Creator,
            mapping,
        }))
    }

    /// Open a segment created by a peer.
    #[tracing::instrument(level = "debug", skip(name), fields(name = %name.as_ref()))]
    pub fn open(name: impl AsRef<str>) -> Result<Arc<Self>, ArenaError> {
        let name = name.as_ref();
        let path = segment_path(name);
        let total = file_len(&path)?;
        if total < HEADER_SIZE {
            return Err(ArenaError::BadSegment("segment file too small"));
        }
        let mapping = map_file(&path, total, false)?;

        // SAFETY: the mapping is at least HEADER_SIZE bytes.
        let header = unsafe { &*(mapping.base_ptr() as *const ArenaHeader) };
        header.validate()?;
        let end = header
            .heap_offset
            .checked_add(header.heap_capacity)
            .ok_or(ArenaError::BadSegment("heap extent overflow"))?;
        if end > total as u64 {
            return Err(ArenaError::BadSegment("heap extends past segment end"));
        }

        tracing::debug!(name, total, "opened arena segment");

        Ok(Arc::new(Self {
            name: name.to_owned(),
            role: Role::Opener,
            mapping,
        }))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Base address of the mapping in this process. Only meaningful for
    /// identity comparisons; never derive offsets from it directly.
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.mapping.base_addr()
    }

    #[inline]
    fn header(&self) -> &ArenaHeader {
        // SAFETY: validated at create/open time.
        unsafe { &*(self.mapping.base_ptr() as *const ArenaHeader) }
    }

    #[inline]
    fn free_heads(&self) -> &[AtomicU64; NUM_CLASSES] {
        // SAFETY: the free-head array sits immediately after the header and
        // is within the mapping by construction.
        unsafe { &*(self.mapping.base_ptr().add(HEADER_SIZE) as *const [AtomicU64; NUM_CLASSES]) }
    }

    #[inline]
    fn heap_base(&self) -> *mut u8 {
        // SAFETY: heap_offset validated against the mapping extent.
        unsafe { self.mapping.base_ptr().add(self.header().heap_offset as usize) }
    }

    #[inline]
    pub fn heap_capacity(&self) -> u64 {
        self.header().heap_capacity
    }

    /// Current high-water mark (bytes bumped so far).
    #[inline]
    pub fn high_water(&self) -> u64 {
        self.header().high_water.load(Ordering::Acquire)
    }

    /// The embedding layer's region between header and heap.
    ///
    /// Returns a pointer/length pair; layout within it is the embedder's
    /// contract with its peer.
    pub fn reserved(&self) -> (*mut u8, usize) {
        let header = self.header();
        let off = align_up(HEADER_SIZE + FREE_HEADS_SIZE, 64);
        // SAFETY: within the mapping by construction.
        let ptr = unsafe { self.mapping.base_ptr().add(off) };
        (ptr, header.reserved_len as usize)
    }

    /// True if `[offset, offset + len)` lies within the heap.
    #[inline]
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        (offset as u64).saturating_add(len as u64) <= self.header().heap_capacity
    }

    /// Raw pointer to a heap offset.
    ///
    /// # Safety
    ///
    /// `offset` must be within the heap (see [`Arena::contains`]) and the
    /// caller must respect the block ownership rules: only the allocator of
    /// a live block, or the receiver of a transmitted one, may write it.
    #[inline]
    pub unsafe fn heap_ptr(&self, offset: u32) -> *mut u8 {
        debug_assert!(self.contains(offset, 0));
        // SAFETY: caller guarantees offset is within the heap.
        unsafe { self.heap_base().add(offset as usize) }
    }

    /// Allocate `size` bytes, rounded up to a power-of-two block.
    ///
    /// Tries the matching free list first, then bumps the high-water mark.
    /// A failed bump leaves the mark untouched so later, smaller
    /// allocations still succeed.
    pub fn alloc(&self, size: u32) -> Result<u32, ArenaError> {
        let block = block_size(size);

        if let Some(offset) = self.pop_free(class_of(block)) {
            return Ok(offset);
        }

        let header = self.header();
        let capacity = header.heap_capacity;
        let mut cur = header.high_water.load(Ordering::Relaxed);
        loop {
            let end = cur + block as u64;
            if end > capacity {
                return Err(ArenaError::OutOfSpace {
                    requested: size,
                    available: capacity.saturating_sub(cur),
                });
            }
            match header.high_water.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(cur as u32),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Return a block to its size-class free list.
    ///
    /// `size` must be the size passed to [`Arena::alloc`] (or the grown
    /// size after [`Arena::try_extend`]).
    pub fn free(&self, offset: u32, size: u32) {
        let block = block_size(size);
        debug_assert!(self.contains(offset, block));
        self.push_free(class_of(block), offset);
    }

    /// Try to grow a trailing block in place from `old_size` to `new_size`.
    ///
    /// Succeeds only when the block is the most recent bump allocation, by
    /// CASing the high-water mark from the block's old end to its new end.
    pub fn try_extend(&self, offset: u32, old_size: u32, new_size: u32) -> bool {
        let old_block = block_size(old_size) as u64;
        let new_block = block_size(new_size) as u64;
        if new_block <= old_block {
            return true;
        }
        let header = self.header();
        let old_end = offset as u64 + old_block;
        let new_end = offset as u64 + new_block;
        if new_end > header.heap_capacity {
            return false;
        }
        header
            .high_water
            .compare_exchange(old_end, new_end, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    // Free lists are Treiber stacks threaded through the blocks themselves:
    // the first 4 bytes of a free block hold the next offset. Heads carry a
    // 32-bit tag in the high half, bumped on every successful swap (same
    // ABA defense as a tagged slab free_head).

    fn pop_free(&self, class: usize) -> Option<u32> {
        let head = &self.free_heads()[class];
        let mut cur = head.load(Ordering::Acquire);
        loop {
            let offset = (cur & 0xFFFF_FFFF) as u32;
            if offset == NIL {
                return None;
            }
            // SAFETY: offsets on the free list were valid blocks when pushed
            // and the mapping never shrinks.
            let next = unsafe { (*(self.heap_ptr(offset) as *const AtomicU32)).load(Ordering::Acquire) };
            let tag = (cur >> 32).wrapping_add(1);
            let replacement = (tag << 32) | next as u64;
            match head.compare_exchange_weak(cur, replacement, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(offset),
                Err(seen) => cur = seen,
            }
        }
    }

    fn push_free(&self, class: usize, offset: u32) {
        let head = &self.free_heads()[class];
        let mut cur = head.load(Ordering::Acquire);
        loop {
            let next = (cur & 0xFFFF_FFFF) as u32;
            // SAFETY: the block being freed is owned by the caller and at
            // least MIN_BLOCK bytes.
            unsafe {
                (*(self.heap_ptr(offset) as *const AtomicU32)).store(next, Ordering::Release);
            }
            let tag = (cur >> 32).wrapping_add(1);
            let replacement = (tag << 32) | offset as u64;
            match head.compare_exchange_weak(cur, replacement, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Write bytes into the heap at `offset`.
    ///
    /// # Safety
    ///
    /// Caller must own the block at `offset` and `data` must fit in it.
    pub unsafe fn write_bytes(&self, offset: u32, data: &[u8]) {
        debug_assert!(self.contains(offset, data.len() as u32));
        // SAFETY: per the caller contract above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.heap_ptr(offset), data.len());
        }
    }

    /// Read bytes from the heap at `offset`.
    ///
    /// # Safety
    ///
    /// `[offset, offset + len)` must be a transmitted or owned block; the
    /// returned slice is valid until the block is freed.
    pub unsafe fn read_bytes(&self, offset: u32, len: u32) -> &[u8] {
        debug_assert!(self.contains(offset, len));
        // SAFETY: per the caller contract above.
        unsafe { std::slice::from_raw_parts(self.heap_ptr(offset), len as usize) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.role == Role::Creator {
            let path = self.mapping.path().to_path_buf();
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, path = %path.display(), "failed to unlink arena");
                }
            }
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("heap_capacity", &self.heap_capacity())
            .field("high_water", &self.high_water())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::AtomicU64;
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "test-arena-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn create_and_open() {
        let name = unique_name("open");
        let creator = Arena::create(&name, 0, 4096).unwrap();
        let opener = Arena::open(&name).unwrap();
        assert_eq!(creator.role(), Role::Creator);
        assert_eq!(opener.role(), Role::Opener);
        assert_eq!(opener.heap_capacity(), 4096);
    }

    #[test]
    fn create_twice_fails() {
        let name = unique_name("dup");
        let _a = Arena::create(&name, 0, 4096).unwrap();
        assert!(matches!(
            Arena::create(&name, 0, 4096),
            Err(ArenaError::System(_))
        ));
    }

    #[test]
    fn creator_unlinks_on_drop() {
        let name = unique_name("unlink");
        let path = segment_path(&name);
        {
            let _a = Arena::create(&name, 0, 4096).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn bump_allocation_rounds_to_blocks() {
        let name = unique_name("bump");
        let a = Arena::create(&name, 0, 4096).unwrap();
        let x = a.alloc(1).unwrap();
        let y = a.alloc(17).unwrap();
        assert_eq!(x, 0);
        assert_eq!(y, 16); // 1 -> 16-byte block
        assert_eq!(a.high_water(), 16 + 32); // 17 -> 32-byte block
    }

    #[test]
    fn exhaustion_leaves_high_water_intact() {
        let name = unique_name("oom");
        let a = Arena::create(&name, 0, 64).unwrap();
        a.alloc(64).unwrap();
        let before = a.high_water();
        assert!(matches!(a.alloc(64), Err(ArenaError::OutOfSpace { .. })));
        assert_eq!(a.high_water(), before);
        // A smaller follow-up allocation still fails cleanly too.
        assert!(matches!(a.alloc(1), Err(ArenaError::OutOfSpace { .. })));
    }

    #[test]
    fn free_list_reuses_same_size() {
        let name = unique_name("reuse");
        let a = Arena::create(&name, 0, 4096).unwrap();
        let x = a.alloc(32).unwrap();
        a.free(x, 32);
        let y = a.alloc(20).unwrap(); // same 32-byte class
        assert_eq!(x, y);
    }

    #[test]
    fn extend_in_place_only_when_trailing() {
        let name = unique_name("extend");
        let a = Arena::create(&name, 0, 4096).unwrap();
        let x = a.alloc(32).unwrap();
        assert!(a.try_extend(x, 32, 64));
        assert_eq!(a.high_water(), 64);
        // Another allocation lands after x; x is no longer trailing.
        let _y = a.alloc(16).unwrap();
        assert!(!a.try_extend(x, 64, 128));
    }

    #[test]
    fn offsets_agree_across_mappings() {
        let name = unique_name("two-views");
        let a = Arena::create(&name, 0, 4096).unwrap();
        let b = Arena::open(&name).unwrap();
        let off = a.alloc(64).unwrap();
        unsafe {
            a.write_bytes(off, b"shared");
            assert_eq!(b.read_bytes(off, 6), b"shared");
        }
        // Distinct mappings of the same file.
        assert_ne!(a.base_addr(), b.base_addr());
    }
}
