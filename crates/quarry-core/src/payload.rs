//! Payload codec: how a value crosses the ring.
//!
//! Small fixed-layout values ride inline in the envelope descriptor.
//! Larger fixed-layout values and containers live in the sender's
//! outbound arena and cross as a heap offset. The receiver owns whatever
//! it decodes: heap-resident payloads are freed on (or after) decode.

use std::sync::Arc;

use quarry_arena::{Arena, ArenaElement, ArenaVec, Plain};

use crate::envelope::{Envelope, EnvelopeFlags, INLINE_CAPACITY};
use crate::error::Error;

/// A value that can be carried by an envelope.
pub trait Payload: Send + Sized + 'static {
    /// Write `self` into `env`, allocating in `arena` (the sender's
    /// outbound arena) when the value does not fit inline.
    fn encode(self, arena: &Arc<Arena>, env: &mut Envelope) -> Result<(), Error>;

    /// Reconstruct from `env` against `arena` (the receiver's inbound
    /// arena, which is the sender's outbound one).
    fn decode(arena: &Arc<Arena>, env: &Envelope) -> Result<Self, Error>;
}

/// Encode a fixed-layout value: inline when it fits, otherwise through a
/// heap block the receiver frees on decode.
pub fn encode_plain<T: Plain>(value: T, arena: &Arc<Arena>, env: &mut Envelope) -> Result<(), Error> {
    let size = core::mem::size_of::<T>();
    // SAFETY: Plain guarantees a pointer-free POD layout.
    let bytes =
        unsafe { core::slice::from_raw_parts(&value as *const T as *const u8, size) };
    if size <= INLINE_CAPACITY {
        env.set_inline(bytes);
    } else {
        let offset = arena.alloc(size as u32)?;
        // SAFETY: freshly allocated block of at least `size` bytes.
        unsafe {
            arena.write_bytes(offset, bytes);
        }
        env.set_offset(offset, size as u32);
    }
    Ok(())
}

/// Decode a fixed-layout value and release its heap block, if any.
pub fn decode_plain<T: Plain>(arena: &Arc<Arena>, env: &Envelope) -> Result<T, Error> {
    let size = core::mem::size_of::<T>();
    if env.payload_len as usize != size {
        return Err(Error::HandshakeMismatch("payload size disagrees"));
    }
    if env.flags().contains(EnvelopeFlags::INLINE) {
        // SAFETY: length checked; Plain makes any bit pattern valid.
        // The inline bytes are only 8-aligned, hence the unaligned read.
        return Ok(unsafe { (env.inline.as_ptr() as *const T).read_unaligned() });
    }
    if !arena.contains(env.payload_offset, env.payload_len) {
        return Err(Error::HandshakeMismatch("payload offset out of range"));
    }
    // SAFETY: extent checked against the heap.
    let value = unsafe { (arena.heap_ptr(env.payload_offset) as *const T).read_unaligned() };
    arena.free(env.payload_offset, env.payload_len);
    Ok(value)
}

/// Implement [`Payload`] for a `Plain` fixed-layout type.
#[macro_export]
macro_rules! plain_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::Payload for $ty {
                fn encode(
                    self,
                    arena: &std::sync::Arc<$crate::Arena>,
                    env: &mut $crate::Envelope,
                ) -> Result<(), $crate::Error> {
                    $crate::payload::encode_plain(self, arena, env)
                }

                fn decode(
                    arena: &std::sync::Arc<$crate::Arena>,
                    env: &$crate::Envelope,
                ) -> Result<Self, $crate::Error> {
                    $crate::payload::decode_plain(arena, env)
                }
            }
        )*
    };
}

plain_payload!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Containers cross as their root offset. The handle must have been
/// built in the sender's outbound arena; the receiver re-attaches by
/// offset and disposes when done.
impl<E: ArenaElement> Payload for ArenaVec<E> {
    fn encode(self, arena: &Arc<Arena>, env: &mut Envelope) -> Result<(), Error> {
        if self.arena().base_addr() != arena.base_addr() {
            return Err(Error::InvalidConfig(
                "container payload must live in the outbound arena",
            ));
        }
        env.set_offset(self.offset(), 16);
        Ok(())
    }

    fn decode(arena: &Arc<Arena>, env: &Envelope) -> Result<Self, Error> {
        if env.flags().contains(EnvelopeFlags::INLINE)
            || !arena.contains(env.payload_offset, env.payload_len)
        {
            return Err(Error::HandshakeMismatch("bad container payload reference"));
        }
        Ok(ArenaVec::attach(arena, env.payload_offset))
    }
}

/// Error-reply text: inline when short, heap bytes otherwise.
pub fn encode_message(msg: &str, arena: &Arc<Arena>, env: &mut Envelope) -> Result<(), Error> {
    let bytes = msg.as_bytes();
    if bytes.len() <= INLINE_CAPACITY {
        env.set_inline(bytes);
        return Ok(());
    }
    let len = bytes.len().min(u32::MAX as usize) as u32;
    let offset = arena.alloc(len)?;
    // SAFETY: freshly allocated block of at least `len` bytes.
    unsafe {
        arena.write_bytes(offset, &bytes[..len as usize]);
    }
    env.set_offset(offset, len);
    Ok(())
}

/// Release the heap block an envelope references without decoding it.
///
/// For an envelope nobody will consume (a late response whose invocation
/// already timed out, a duplicate). Frees exactly the referenced block:
/// a plain or message payload is fully reclaimed; a container payload
/// gives back its root block only, since walking nested storage needs
/// the element type.
pub fn release_payload(arena: &Arc<Arena>, env: &Envelope) {
    if env.flags().contains(EnvelopeFlags::INLINE) || env.payload_len == 0 {
        return;
    }
    if !arena.contains(env.payload_offset, env.payload_len) {
        return;
    }
    arena.free(env.payload_offset, env.payload_len);
}

/// Read an error-reply text and release its heap block, if any.
pub fn decode_message(arena: &Arc<Arena>, env: &Envelope) -> String {
    if env.flags().contains(EnvelopeFlags::INLINE) {
        return String::from_utf8_lossy(env.inline_bytes()).into_owned();
    }
    if !arena.contains(env.payload_offset, env.payload_len) {
        return String::from("malformed error payload");
    }
    // SAFETY: extent checked against the heap.
    let bytes = unsafe { arena.read_bytes(env.payload_offset, env.payload_len) };
    let msg = String::from_utf8_lossy(bytes).into_owned();
    arena.free(env.payload_offset, env.payload_len);
    msg
}
