//! Element traits for in-arena containers.

use std::sync::Arc;

use crate::arena::Arena;
use crate::error::ArenaError;

/// Marker for types that can be stored in an arena byte-for-byte.
///
/// # Safety
///
/// Implementors must be `repr(C)` (or primitive), contain no pointers,
/// references, padding-dependent invariants, or drop glue, and have an
/// alignment of at most 16. Any bit pattern must be a valid value, since
/// the bytes cross a process boundary.
pub unsafe trait Plain: Copy + Send + 'static {}

unsafe impl Plain for u8 {}
unsafe impl Plain for i8 {}
unsafe impl Plain for u16 {}
unsafe impl Plain for i16 {}
unsafe impl Plain for u32 {}
unsafe impl Plain for i32 {}
unsafe impl Plain for u64 {}
unsafe impl Plain for i64 {}
unsafe impl Plain for f32 {}
unsafe impl Plain for f64 {}

/// A type storable as an element of an [`crate::ArenaVec`].
///
/// Implemented for every [`Plain`] type (stored by value) and for
/// `ArenaVec<T>` itself (stored as the inner header offset), which is what
/// makes nested containers work: the whole structure stays inside one
/// arena and travels as a single root offset.
pub trait ArenaElement: Sized + Send + 'static {
    /// Bytes one element occupies inside the container's data block.
    const SIZE: usize;

    /// Move `self` into the arena at heap offset `at`.
    ///
    /// Ownership of any arena storage the element holds transfers to the
    /// container; the handle must not be used (or disposed) afterwards.
    fn store(self, arena: &Arc<Arena>, at: u32);

    /// Read the element stored at heap offset `at`.
    ///
    /// For nested containers this returns a view handle: it aliases the
    /// slot and must not be disposed by the caller.
    fn load(arena: &Arc<Arena>, at: u32) -> Self;

    /// Release arena storage owned by the element at `at`.
    fn drop_in_place(arena: &Arc<Arena>, at: u32);

    /// Produce an independent copy of `self` for fill-construction,
    /// allocating in `arena` if the element owns storage.
    fn duplicate(&self, arena: &Arc<Arena>) -> Result<Self, ArenaError>;
}

impl<T: Plain> ArenaElement for T {
    const SIZE: usize = core::mem::size_of::<T>();

    fn store(self, arena: &Arc<Arena>, at: u32) {
        debug_assert!(core::mem::align_of::<T>() <= 16);
        // SAFETY: Plain guarantees a pointer-free POD layout; the container
        // guarantees `at` addresses an owned, aligned slot of SIZE bytes.
        unsafe {
            (arena.heap_ptr(at) as *mut T).write(self);
        }
    }

    fn load(arena: &Arc<Arena>, at: u32) -> Self {
        // SAFETY: as in `store`; Plain makes any bit pattern valid.
        unsafe { (arena.heap_ptr(at) as *const T).read() }
    }

    fn drop_in_place(_arena: &Arc<Arena>, _at: u32) {}

    fn duplicate(&self, _arena: &Arc<Arena>) -> Result<Self, ArenaError> {
        Ok(*self)
    }
}
