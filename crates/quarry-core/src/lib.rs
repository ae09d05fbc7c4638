//! quarry-core: the wire layer under the quarry transport.
//!
//! Everything here is layout and hand-off: the 64-byte [`Envelope`]
//! descriptor, the SPSC [`Ring`] it travels through, the [`Link`] that
//! embeds a ring plus liveness state in an arena's reserved region, the
//! rendezvous [`Hub`] connectors dial, and the [`Payload`] codec that
//! decides whether a value rides inline or by arena offset.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod link;
pub mod payload;
pub mod ring;

pub use config::{Config, Timeout};
pub use envelope::{Envelope, EnvelopeFlags, INLINE_CAPACITY};
pub use error::Error;
pub use hub::Hub;
pub use link::{Link, RING_CAPACITY};
pub use payload::Payload;
pub use ring::Ring;

// Re-exported so `plain_payload!` expansions resolve, and so the
// connection layer has one import surface.
pub use quarry_arena::{Arena, ArenaConstruct, ArenaElement, ArenaVec, Plain, Registry, Role};
