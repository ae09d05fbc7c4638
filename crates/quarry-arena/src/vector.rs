//! `ArenaVec`: a growable vector living entirely inside one arena.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::arena::{block_size, Arena, NIL};
use crate::element::ArenaElement;
use crate::error::ArenaError;

/// In-arena vector header (16 bytes, one minimum block).
#[repr(C)]
struct VecHeader {
    len: u32,
    cap: u32,
    /// Heap offset of the data block, or NIL while empty.
    data: u32,
    _pad: u32,
}

const _: () = assert!(core::mem::size_of::<VecHeader>() == 16);

/// A vector of `T` whose header and storage both live inside one [`Arena`].
///
/// The handle itself is just `{arena, header offset}`; transmitting the
/// header offset is enough for the peer to attach to the whole structure,
/// nested containers included. Element addresses are resolved through the
/// handle on every access — growth may relocate the data block, so raw
/// pointers must never be cached across mutation.
///
/// Storage is released explicitly via [`ArenaVec::dispose`] (or by storing
/// the vector into a parent container, which takes ownership). Dropping
/// the handle alone leaks the arena blocks until the segment goes away.
pub struct ArenaVec<T: ArenaElement> {
    arena: Arc<Arena>,
    header: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ArenaElement> ArenaVec<T> {
    /// Construct an empty vector inside `arena`.
    pub fn new(arena: &Arc<Arena>) -> Result<Self, ArenaError> {
        let header = arena.alloc(core::mem::size_of::<VecHeader>() as u32)?;
        // SAFETY: freshly allocated, exclusively owned block.
        unsafe {
            (arena.heap_ptr(header) as *mut VecHeader).write(VecHeader {
                len: 0,
                cap: 0,
                data: NIL,
                _pad: 0,
            });
        }
        Ok(Self {
            arena: arena.clone(),
            header,
            _marker: PhantomData,
        })
    }

    /// Attach to a vector previously constructed at `header` — the
    /// receiving side of a transmitted root offset.
    pub fn attach(arena: &Arc<Arena>, header: u32) -> Self {
        debug_assert!(arena.contains(header, core::mem::size_of::<VecHeader>() as u32));
        Self {
            arena: arena.clone(),
            header,
            _marker: PhantomData,
        }
    }

    /// Heap offset of the header; the transmittable root reference.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.header
    }

    /// The arena this vector lives in.
    #[inline]
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    #[inline]
    fn hdr(&self) -> &VecHeader {
        // SAFETY: header block validated at new/attach time.
        unsafe { &*(self.arena.heap_ptr(self.header) as *const VecHeader) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn hdr_mut(&self) -> &mut VecHeader {
        // SAFETY: mutation is confined to the side owning the live handle.
        unsafe { &mut *(self.arena.heap_ptr(self.header) as *mut VecHeader) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hdr().len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hdr().len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.hdr().cap as usize
    }

    #[inline]
    fn slot(&self, index: u32) -> u32 {
        self.hdr().data + index * T::SIZE as u32
    }

    /// Read the element at `index`. For nested containers the returned
    /// handle is a view; do not dispose it.
    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.len() {
            return None;
        }
        Some(T::load(&self.arena, self.slot(index as u32)))
    }

    /// Replace the element at `index`, releasing whatever it owned.
    pub fn set(&mut self, index: usize, value: T) -> Result<(), ArenaError> {
        if index >= self.len() {
            return Err(ArenaError::InvalidConfig("index out of bounds"));
        }
        let at = self.slot(index as u32);
        T::drop_in_place(&self.arena, at);
        value.store(&self.arena, at);
        Ok(())
    }

    /// Append an element, growing if needed.
    pub fn push(&mut self, value: T) -> Result<(), ArenaError> {
        let len = self.hdr().len;
        self.reserve(len as usize + 1)?;
        value.store(&self.arena, self.slot(len));
        self.hdr_mut().len = len + 1;
        Ok(())
    }

    /// Ensure capacity for at least `want` elements.
    ///
    /// Growth extends the data block in place when it is the arena's
    /// trailing allocation, otherwise relocates it and frees the old block.
    /// Relocation invalidates any previously computed element address.
    pub fn reserve(&mut self, want: usize) -> Result<(), ArenaError> {
        let hdr = self.hdr();
        if want <= hdr.cap as usize {
            return Ok(());
        }
        let new_cap = want.max(hdr.cap as usize * 2).max(4) as u32;
        let old_bytes = hdr.cap * T::SIZE as u32;
        let new_bytes = new_cap
            .checked_mul(T::SIZE as u32)
            .ok_or(ArenaError::InvalidConfig("vector too large"))?;

        if hdr.data != NIL && self.arena.try_extend(hdr.data, old_bytes, new_bytes) {
            self.hdr_mut().cap = new_cap;
            return Ok(());
        }

        let new_data = self.arena.alloc(new_bytes)?;
        if hdr.data != NIL {
            let used = hdr.len * T::SIZE as u32;
            // SAFETY: both blocks are owned by this vector; regions are
            // disjoint (new_data is a fresh block).
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.arena.heap_ptr(hdr.data),
                    self.arena.heap_ptr(new_data),
                    used as usize,
                );
            }
            let (old_data, old_block) = (hdr.data, block_size(old_bytes));
            let h = self.hdr_mut();
            h.data = new_data;
            h.cap = new_cap;
            self.arena.free(old_data, old_block);
        } else {
            let h = self.hdr_mut();
            h.data = new_data;
            h.cap = new_cap;
        }
        Ok(())
    }

    /// Grow or shrink to `new_len`.
    ///
    /// New slots are fill-constructed from copies of `fill`; removed
    /// elements are destroyed. Shrinking keeps the capacity.
    pub fn resize(&mut self, new_len: usize, fill: &T) -> Result<(), ArenaError> {
        let len = self.len();
        if new_len > len {
            self.reserve(new_len)?;
            for i in len..new_len {
                let copy = fill.duplicate(&self.arena)?;
                copy.store(&self.arena, self.slot(i as u32));
            }
        } else {
            for i in new_len..len {
                T::drop_in_place(&self.arena, self.slot(i as u32));
            }
        }
        self.hdr_mut().len = new_len as u32;
        Ok(())
    }

    /// Iterate elements by value (views, for nested containers).
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len()).map(move |i| T::load(&self.arena, self.slot(i as u32)))
    }

    /// Deep-copy this vector (and everything nested) into `arena`.
    pub fn duplicate_into(&self, arena: &Arc<Arena>) -> Result<Self, ArenaError> {
        let mut copy = Self::new(arena)?;
        copy.reserve(self.len())?;
        for i in 0..self.len() {
            let elem = T::load(&self.arena, self.slot(i as u32));
            let dup = elem.duplicate(arena)?;
            dup.store(arena, copy.slot(i as u32));
            copy.hdr_mut().len = i as u32 + 1;
        }
        Ok(copy)
    }

    /// Destroy all elements and release the vector's storage back to the
    /// arena. Safe to call from either side of the connection.
    pub fn dispose(self) {
        let hdr = self.hdr();
        let (len, cap, data) = (hdr.len, hdr.cap, hdr.data);
        for i in 0..len {
            T::drop_in_place(&self.arena, data + i * T::SIZE as u32);
        }
        if data != NIL {
            self.arena.free(data, cap * T::SIZE as u32);
        }
        self.arena
            .free(self.header, core::mem::size_of::<VecHeader>() as u32);
    }
}

impl<T: ArenaElement> std::fmt::Debug for ArenaVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaVec")
            .field("offset", &self.header)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Nested containers: an `ArenaVec` is itself an element, stored as the
/// inner header offset. Storage always stays in the parent's arena.
impl<T: ArenaElement> ArenaElement for ArenaVec<T> {
    const SIZE: usize = 4;

    fn store(self, arena: &Arc<Arena>, at: u32) {
        assert_eq!(
            self.arena.base_addr(),
            arena.base_addr(),
            "nested container must live in the parent's arena"
        );
        let offset = self.header;
        // SAFETY: 4-byte slot owned by the parent container.
        unsafe {
            (arena.heap_ptr(at) as *mut u32).write(offset);
        }
    }

    fn load(arena: &Arc<Arena>, at: u32) -> Self {
        // SAFETY: the slot holds an offset stored by `store`.
        let offset = unsafe { (arena.heap_ptr(at) as *const u32).read() };
        Self::attach(arena, offset)
    }

    fn drop_in_place(arena: &Arc<Arena>, at: u32) {
        let inner = Self::load(arena, at);
        inner.dispose();
    }

    fn duplicate(&self, arena: &Arc<Arena>) -> Result<Self, ArenaError> {
        self.duplicate_into(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena(tag: &str, heap: u64) -> Arc<Arena> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "test-vec-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Arena::create(name, 0, heap).unwrap()
    }

    #[test]
    fn push_get_len() {
        let arena = test_arena("basic", 1 << 16);
        let mut v = ArenaVec::<i32>::new(&arena).unwrap();
        for i in 0..10 {
            v.push(i).unwrap();
        }
        assert_eq!(v.len(), 10);
        assert_eq!(v.get(3), Some(3));
        assert_eq!(v.get(10), None);
        v.dispose();
    }

    #[test]
    fn resize_with_fill() {
        // Add 0..99, resize to 200 with fill 1: count 200, sum 4950 + 100.
        let arena = test_arena("resize", 1 << 16);
        let mut v = ArenaVec::<i64>::new(&arena).unwrap();
        for i in 0..100 {
            v.push(i).unwrap();
        }
        v.resize(200, &1).unwrap();
        assert_eq!(v.len(), 200);
        assert_eq!(v.iter().sum::<i64>(), 4950 + 100);
        v.dispose();
    }

    #[test]
    fn resize_shrink_keeps_capacity() {
        let arena = test_arena("shrink", 1 << 16);
        let mut v = ArenaVec::<u32>::new(&arena).unwrap();
        v.resize(64, &7).unwrap();
        let cap = v.capacity();
        v.resize(8, &0).unwrap();
        assert_eq!(v.len(), 8);
        assert_eq!(v.capacity(), cap);
        assert!(v.iter().all(|x| x == 7));
        v.dispose();
    }

    #[test]
    fn nested_vectors_stay_in_one_arena() {
        let arena = test_arena("nested", 1 << 20);
        let mut outer = ArenaVec::<ArenaVec<i32>>::new(&arena).unwrap();
        for _ in 0..5 {
            let mut inner = ArenaVec::<i32>::new(&arena).unwrap();
            inner.resize(5, &123).unwrap();
            outer.push(inner).unwrap();
        }
        assert_eq!(outer.len(), 5);
        let total: i64 = outer
            .iter()
            .map(|inner| inner.iter().map(i64::from).sum::<i64>())
            .sum();
        assert_eq!(total, 5 * 5 * 123);
        outer.dispose();
    }

    #[test]
    fn nested_rountrip_via_offset() {
        // Attach from a second mapping, by root offset only.
        let arena = test_arena("attach", 1 << 20);
        let mut outer = ArenaVec::<ArenaVec<i32>>::new(&arena).unwrap();
        for _ in 0..5 {
            let mut inner = ArenaVec::<i32>::new(&arena).unwrap();
            inner.resize(5, &123).unwrap();
            outer.push(inner).unwrap();
        }
        let root = outer.offset();

        let peer = Arena::open(arena.name()).unwrap();
        let view = ArenaVec::<ArenaVec<i32>>::attach(&peer, root);
        assert_eq!(view.len(), 5);
        for inner in view.iter() {
            assert_eq!(inner.iter().sum::<i32>(), 615);
        }
        let total: i32 = view.iter().map(|inner| inner.iter().sum::<i32>()).sum();
        assert_eq!(total, 3075);
    }

    #[test]
    fn dispose_returns_storage() {
        let arena = test_arena("dispose", 1 << 12);
        let mut v = ArenaVec::<u64>::new(&arena).unwrap();
        v.resize(16, &0).unwrap();
        let hw = arena.high_water();
        v.dispose();
        // Same shapes come back out of the free lists, no new bump.
        let mut w = ArenaVec::<u64>::new(&arena).unwrap();
        w.resize(16, &0).unwrap();
        assert_eq!(arena.high_water(), hw);
        w.dispose();
    }

    #[test]
    fn growth_relocates_when_not_trailing() {
        let arena = test_arena("relocate", 1 << 16);
        let mut v = ArenaVec::<u32>::new(&arena).unwrap();
        v.push(1).unwrap();
        // Pin an allocation after the data block so growth must relocate.
        let _pin = arena.alloc(64).unwrap();
        for i in 2..=100 {
            v.push(i).unwrap();
        }
        assert_eq!(v.len(), 100);
        assert_eq!(v.get(0), Some(1));
        assert_eq!(v.get(99), Some(100));
        v.dispose();
    }
}
