//! The rendezvous hub: a small well-known segment per acceptor name where
//! connectors drop hello markers.
//!
//! A hello is just the name of the arena the connector created for its
//! outbound traffic. The acceptor drains hellos, opens each named arena,
//! and answers through that arena's ack slot. Slots move
//! `Free -> Writing -> Ready` under CAS so a half-written name is never
//! observed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use quarry_arena::Arena;

use crate::error::Error;

const SLOT_FREE: u32 = 0;
const SLOT_WRITING: u32 = 1;
const SLOT_READY: u32 = 2;

/// Concurrent un-acked dials one hub can hold.
pub const HELLO_SLOTS: usize = 16;

/// Longest arena name a hello slot can carry.
pub const HELLO_NAME_CAP: usize = 56;

#[repr(C, align(64))]
struct HubHeader {
    /// Non-zero while the acceptor is listening.
    open: AtomicU32,
    _pad: [u8; 60],
}

#[repr(C, align(64))]
struct HelloSlot {
    state: AtomicU32,
    len: u32,
    name: [u8; HELLO_NAME_CAP],
}

const _: () = assert!(core::mem::size_of::<HubHeader>() == 64);
const _: () = assert!(core::mem::size_of::<HelloSlot>() == 64);

const HUB_RESERVED: usize =
    core::mem::size_of::<HubHeader>() + HELLO_SLOTS * core::mem::size_of::<HelloSlot>();

fn hub_segment_name(channel: &str) -> String {
    format!("{channel}-hub")
}

/// Mapped hub segment. The acceptor creates it; connectors open it.
pub struct Hub {
    arena: Arc<Arena>,
    header: *const HubHeader,
    slots: *const HelloSlot,
}

// SAFETY: all hub state is atomic or published under the slot CAS
// protocol; the mapping outlives the views.
unsafe impl Send for Hub {}
unsafe impl Sync for Hub {}

impl Hub {
    /// Create the hub for `channel` and mark it listening.
    ///
    /// An acceptor owns its channel name, so a leftover segment file from
    /// a crashed predecessor is reclaimed rather than refused.
    #[tracing::instrument(level = "debug", skip(channel), fields(channel = %channel.as_ref()))]
    pub fn create(channel: impl AsRef<str>) -> Result<Arc<Self>, Error> {
        let segment = hub_segment_name(channel.as_ref());
        let arena = match Arena::create(&segment, HUB_RESERVED as u32, 64) {
            Ok(arena) => arena,
            Err(quarry_arena::ArenaError::System(err))
                if err.kind() == std::io::ErrorKind::AlreadyExists =>
            {
                tracing::warn!(channel = channel.as_ref(), "reclaiming stale hub segment");
                std::fs::remove_file(quarry_arena::segment_path(&segment))?;
                Arena::create(&segment, HUB_RESERVED as u32, 64)?
            }
            Err(err) => return Err(err.into()),
        };
        let hub = Self::attach(arena)?;
        hub.header().open.store(1, Ordering::Release);
        Ok(Arc::new(hub))
    }

    /// Open an existing hub. `System(NotFound)` means nobody is (or ever
    /// was) listening on this channel.
    pub fn open(channel: impl AsRef<str>) -> Result<Arc<Self>, Error> {
        let arena = Arena::open(hub_segment_name(channel.as_ref()))?;
        Ok(Arc::new(Self::attach(arena)?))
    }

    fn attach(arena: Arc<Arena>) -> Result<Self, Error> {
        let (base, len) = arena.reserved();
        if len < HUB_RESERVED {
            return Err(Error::HandshakeMismatch("hub region too small"));
        }
        // SAFETY: extent checked above.
        let slots = unsafe { base.add(core::mem::size_of::<HubHeader>()) } as *const HelloSlot;
        Ok(Self {
            header: base as *const HubHeader,
            slots,
            arena,
        })
    }

    #[inline]
    fn header(&self) -> &HubHeader {
        // SAFETY: points into the mapping owned by self.arena.
        unsafe { &*self.header }
    }

    #[inline]
    fn slot(&self, index: usize) -> &HelloSlot {
        debug_assert!(index < HELLO_SLOTS);
        // SAFETY: index bounded by HELLO_SLOTS, extent checked at attach.
        unsafe { &*self.slots.add(index) }
    }

    /// Whether the acceptor is still listening.
    pub fn is_listening(&self) -> bool {
        self.header().open.load(Ordering::Acquire) != 0
    }

    /// Acceptor shutdown: further dials see `ConnectRefused`.
    pub fn shut_down(&self) {
        self.header().open.store(0, Ordering::Release);
    }

    /// Connector side: drop a hello carrying our outbound arena name.
    ///
    /// Returns false when every slot is busy; the caller yields and
    /// retries until its dial deadline.
    pub fn try_publish(&self, arena_name: &str) -> Result<bool, Error> {
        if arena_name.len() > HELLO_NAME_CAP {
            return Err(Error::InvalidConfig("arena name too long for hello slot"));
        }
        if !self.is_listening() {
            return Err(Error::ConnectRefused);
        }
        for index in 0..HELLO_SLOTS {
            let slot = self.slot(index);
            if slot
                .state
                .compare_exchange(SLOT_FREE, SLOT_WRITING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // SAFETY: the WRITING state grants exclusive access until the
            // READY store publishes. Raw copies only: taking a reference
            // into the shared mapping would be an implicit autoref through
            // the raw pointer.
            unsafe {
                let s = (self.slots as *mut HelloSlot).add(index);
                core::ptr::copy_nonoverlapping(
                    arena_name.as_ptr(),
                    core::ptr::addr_of_mut!((*s).name) as *mut u8,
                    arena_name.len(),
                );
                (*s).len = arena_name.len() as u32;
            }
            slot.state.store(SLOT_READY, Ordering::Release);
            tracing::debug!(arena_name, index, "published hello");
            return Ok(true);
        }
        Ok(false)
    }

    /// Acceptor side: claim one pending hello, if any.
    pub fn take_hello(&self) -> Option<String> {
        for index in 0..HELLO_SLOTS {
            let slot = self.slot(index);
            if slot
                .state
                .compare_exchange(SLOT_READY, SLOT_WRITING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let len = (slot.len as usize).min(HELLO_NAME_CAP);
            let name = String::from_utf8_lossy(&slot.name[..len]).into_owned();
            slot.state.store(SLOT_FREE, Ordering::Release);
            tracing::debug!(name, index, "took hello");
            return Some(name);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        use std::sync::atomic::AtomicU64;
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "test-hub-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn publish_then_take() {
        let channel = unique("basic");
        let acceptor = Hub::create(&channel).unwrap();
        let connector = Hub::open(&channel).unwrap();

        assert!(acceptor.take_hello().is_none());
        assert!(connector.try_publish("conn-arena-1").unwrap());
        assert_eq!(acceptor.take_hello().as_deref(), Some("conn-arena-1"));
        assert!(acceptor.take_hello().is_none());
    }

    #[test]
    fn shut_down_refuses_dials() {
        let channel = unique("refuse");
        let acceptor = Hub::create(&channel).unwrap();
        let connector = Hub::open(&channel).unwrap();

        acceptor.shut_down();
        assert!(matches!(
            connector.try_publish("conn-arena"),
            Err(Error::ConnectRefused)
        ));
    }

    #[test]
    fn slots_recycle() {
        let channel = unique("recycle");
        let acceptor = Hub::create(&channel).unwrap();
        let connector = Hub::open(&channel).unwrap();

        // Far more dials than slots, drained as we go.
        for round in 0..HELLO_SLOTS * 3 {
            let name = format!("conn-{round}");
            assert!(connector.try_publish(&name).unwrap());
            assert_eq!(acceptor.take_hello().as_deref(), Some(name.as_str()));
        }
    }

    #[test]
    fn full_hub_reports_busy() {
        let channel = unique("full");
        let _acceptor = Hub::create(&channel).unwrap();
        let connector = Hub::open(&channel).unwrap();

        for i in 0..HELLO_SLOTS {
            assert!(connector.try_publish(&format!("conn-{i}")).unwrap());
        }
        assert!(!connector.try_publish("one-too-many").unwrap());
    }

    #[test]
    fn open_missing_hub_fails() {
        assert!(Hub::open(unique("missing")).is_err());
    }
}
