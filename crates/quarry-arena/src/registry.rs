//! Type registry: erased construction and teardown of in-arena objects.
//!
//! The transport layer moves objects between processes as bare root
//! offsets. To build or destroy those objects without static knowledge of
//! the concrete type at every call site, each payload type is registered
//! once and looked up by `TypeId` afterwards.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::arena::Arena;
use crate::element::ArenaElement;
use crate::error::ArenaError;
use crate::vector::ArenaVec;

/// An object that can be constructed at a fresh root inside an arena and
/// later re-attached from that root alone.
pub trait ArenaConstruct: Sized + 'static {
    fn construct(arena: &Arc<Arena>) -> Result<Self, ArenaError>;

    /// The transmittable root offset.
    fn root(&self) -> u32;

    fn attach(arena: &Arc<Arena>, root: u32) -> Self;

    /// Release everything the object owns back to its arena.
    fn destroy(self);
}

impl<T: ArenaElement> ArenaConstruct for ArenaVec<T> {
    fn construct(arena: &Arc<Arena>) -> Result<Self, ArenaError> {
        ArenaVec::new(arena)
    }

    fn root(&self) -> u32 {
        self.offset()
    }

    fn attach(arena: &Arc<Arena>, root: u32) -> Self {
        ArenaVec::attach(arena, root)
    }

    fn destroy(self) {
        self.dispose();
    }
}

struct Entry {
    type_name: &'static str,
    construct: fn(&Arc<Arena>) -> Result<u32, ArenaError>,
    destroy: fn(&Arc<Arena>, u32),
}

/// Maps `TypeId`s to erased constructors and destructors.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<TypeId, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `C`. Idempotent; re-registering replaces the entry.
    pub fn register<C: ArenaConstruct>(&mut self) {
        self.entries.insert(
            TypeId::of::<C>(),
            Entry {
                type_name: std::any::type_name::<C>(),
                construct: |arena| C::construct(arena).map(|obj| {
                    let root = obj.root();
                    // Ownership transfers to the root offset; the handle
                    // is re-attached by whoever consumes it.
                    std::mem::forget(obj);
                    root
                }),
                destroy: |arena, root| C::attach(arena, root).destroy(),
            },
        );
    }

    pub fn is_registered<C: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<C>())
    }

    fn entry(&self, id: TypeId, name: &'static str) -> Result<&Entry, ArenaError> {
        self.entries
            .get(&id)
            .ok_or(ArenaError::TypeNotRegistered { type_name: name })
    }

    /// Construct a registered type in `arena`, returning its root offset.
    pub fn construct_root<C: 'static>(&self, arena: &Arc<Arena>) -> Result<u32, ArenaError> {
        let entry = self.entry(TypeId::of::<C>(), std::any::type_name::<C>())?;
        (entry.construct)(arena)
    }

    /// Construct a registered type and hand back an attached handle.
    pub fn construct<C: ArenaConstruct>(&self, arena: &Arc<Arena>) -> Result<C, ArenaError> {
        let root = self.construct_root::<C>(arena)?;
        Ok(C::attach(arena, root))
    }

    /// Destroy a registered type rooted at `root` in `arena`.
    pub fn destroy_root<C: 'static>(
        &self,
        arena: &Arc<Arena>,
        root: u32,
    ) -> Result<(), ArenaError> {
        let entry = self.entry(TypeId::of::<C>(), std::any::type_name::<C>())?;
        (entry.destroy)(arena, root);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(self.entries.values().map(|e| e.type_name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena(tag: &str) -> Arc<Arena> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "test-reg-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Arena::create(name, 0, 1 << 16).unwrap()
    }

    #[test]
    fn construct_attach_destroy_by_type() {
        let arena = test_arena("roundtrip");
        let mut registry = Registry::new();
        registry.register::<ArenaVec<i32>>();

        let root = registry.construct_root::<ArenaVec<i32>>(&arena).unwrap();
        let mut v = ArenaVec::<i32>::attach(&arena, root);
        v.push(42).unwrap();
        assert_eq!(v.get(0), Some(42));

        registry.destroy_root::<ArenaVec<i32>>(&arena, root).unwrap();
    }

    #[test]
    fn unregistered_type_is_an_error() {
        let arena = test_arena("missing");
        let registry = Registry::new();
        let err = registry.construct_root::<ArenaVec<u64>>(&arena).unwrap_err();
        assert!(matches!(err, ArenaError::TypeNotRegistered { .. }));
    }

    #[test]
    fn destroy_releases_nested_storage() {
        let arena = test_arena("nested");
        let mut registry = Registry::new();
        registry.register::<ArenaVec<ArenaVec<i32>>>();

        let hw_before = arena.high_water();
        let root = registry
            .construct_root::<ArenaVec<ArenaVec<i32>>>(&arena)
            .unwrap();
        let mut outer = ArenaVec::<ArenaVec<i32>>::attach(&arena, root);
        for _ in 0..3 {
            let mut inner = ArenaVec::<i32>::new(&arena).unwrap();
            inner.resize(4, &9).unwrap();
            outer.push(inner).unwrap();
        }
        registry
            .destroy_root::<ArenaVec<ArenaVec<i32>>>(&arena, root)
            .unwrap();

        // Everything went back to free lists; the same build bumps no
        // further than the first.
        let hw_after_first = arena.high_water();
        let root2 = registry
            .construct_root::<ArenaVec<ArenaVec<i32>>>(&arena)
            .unwrap();
        let mut outer2 = ArenaVec::<ArenaVec<i32>>::attach(&arena, root2);
        for _ in 0..3 {
            let mut inner = ArenaVec::<i32>::new(&arena).unwrap();
            inner.resize(4, &9).unwrap();
            outer2.push(inner).unwrap();
        }
        assert_eq!(arena.high_water(), hw_after_first);
        assert!(hw_after_first >= hw_before);
        registry
            .destroy_root::<ArenaVec<ArenaVec<i32>>>(&arena, root2)
            .unwrap();
    }
}
