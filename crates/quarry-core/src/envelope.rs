//! The wire descriptor exchanged through an envelope ring.

use bitflags::bitflags;

/// Bytes of payload an envelope can carry without touching the heap.
pub const INLINE_CAPACITY: usize = 24;

bitflags! {
    /// Envelope kind and payload encoding bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvelopeFlags: u32 {
        /// Client-to-server invocation.
        const REQUEST = 1 << 0;
        /// Server-to-client completion.
        const RESPONSE = 1 << 1;
        /// Completion carrying a handler failure message instead of a
        /// payload value.
        const ERROR = 1 << 2;
        /// Payload rides in the descriptor's inline bytes.
        const INLINE = 1 << 3;
        /// Orderly shutdown sentinel; no payload.
        const CLOSE = 1 << 4;
    }
}

/// One 64-byte descriptor slot: a cache line, exchanged by value through
/// the ring. Container payloads are referenced by heap offset in the
/// sender's outbound arena; small fixed-layout payloads ride inline.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct Envelope {
    pub correlation_id: u64,
    pub flags: u32,
    /// Heap offset of the payload root, or 0 when inline/absent.
    pub payload_offset: u32,
    /// Payload length in bytes (inline) or the encoded root's byte size.
    pub payload_len: u32,
    _reserved: u32,
    pub inline: [u8; INLINE_CAPACITY],
    _pad: [u8; 16],
}

const _: () = assert!(core::mem::size_of::<Envelope>() == 64);
const _: () = assert!(core::mem::align_of::<Envelope>() == 64);

impl Envelope {
    pub fn new(correlation_id: u64, flags: EnvelopeFlags) -> Self {
        Self {
            correlation_id,
            flags: flags.bits(),
            payload_offset: 0,
            payload_len: 0,
            _reserved: 0,
            inline: [0; INLINE_CAPACITY],
            _pad: [0; 16],
        }
    }

    pub fn request(correlation_id: u64) -> Self {
        Self::new(correlation_id, EnvelopeFlags::REQUEST)
    }

    pub fn response(correlation_id: u64) -> Self {
        Self::new(correlation_id, EnvelopeFlags::RESPONSE)
    }

    pub fn close() -> Self {
        Self::new(0, EnvelopeFlags::CLOSE)
    }

    #[inline]
    pub fn flags(&self) -> EnvelopeFlags {
        EnvelopeFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        self.flags().contains(EnvelopeFlags::CLOSE)
    }

    /// Copy `data` into the inline bytes. Panics when it does not fit;
    /// the payload codec checks sizes before choosing this path.
    pub fn set_inline(&mut self, data: &[u8]) {
        assert!(data.len() <= INLINE_CAPACITY);
        self.inline[..data.len()].copy_from_slice(data);
        self.payload_len = data.len() as u32;
        self.flags |= EnvelopeFlags::INLINE.bits();
    }

    /// The inline payload bytes, when [`EnvelopeFlags::INLINE`] is set.
    pub fn inline_bytes(&self) -> &[u8] {
        let len = (self.payload_len as usize).min(INLINE_CAPACITY);
        &self.inline[..len]
    }

    /// Reference a heap-resident payload root.
    pub fn set_offset(&mut self, offset: u32, len: u32) {
        self.payload_offset = offset;
        self.payload_len = len;
        self.flags &= !EnvelopeFlags::INLINE.bits();
    }
}
