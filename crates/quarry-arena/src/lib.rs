//! quarry-arena: named shared-memory arenas with in-place constructed values.
//!
//! An [`Arena`] is a fixed-capacity memory segment shared by two processes.
//! One process creates it (and owns the backing file), the other opens it.
//! Values are built directly inside the arena and referenced by offsets
//! relative to the heap base, never by pointer value, so a structure built
//! on one side is readable on the other without copying.
//!
//! # Pieces
//!
//! - [`Arena`]: create/open a named segment; bump allocation with a
//!   high-water mark plus same-size free-list reuse.
//! - [`ArenaVec`]: a growable vector living entirely inside one arena.
//!   Elements may themselves be `ArenaVec`s (stored as offsets), which is
//!   how nested containers stay transportable across the process boundary.
//! - [`Registry`]: an explicit type-to-constructor table, populated at
//!   startup, used to build container payloads by type.

#![forbid(unsafe_op_in_unsafe_fn)]

mod arena;
mod element;
mod error;
mod mapping;
mod registry;
mod vector;

pub use arena::{segment_path, Arena, Role, ARENA_MAGIC, ARENA_VERSION, MIN_BLOCK, NIL};
pub use element::{ArenaElement, Plain};
pub use error::ArenaError;
pub use registry::{ArenaConstruct, Registry};
pub use vector::ArenaVec;
