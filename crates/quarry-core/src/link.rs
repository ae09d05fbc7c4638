//! One direction of a connection: an arena whose reserved region holds a
//! link header and an envelope ring.
//!
//! The arena's creator is the producer side (it pushes envelopes and
//! refreshes the heartbeat); the opener is the consumer. A full duplex
//! connection is two links cross-attached, each side creating its
//! outbound one. The ring is single-producer; any number of tasks may
//! send on a link, so pushes go through a producer-side lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quarry_arena::{Arena, Role};

use crate::envelope::Envelope;
use crate::error::Error;
use crate::ring::{ring_bytes, Ring, RING_HEADER_SIZE};

/// Longest arena name the ack slot can carry.
pub const ACK_NAME_CAP: usize = 64;

const ACK_EMPTY: u32 = 0;
const ACK_WRITING: u32 = 1;
const ACK_READY: u32 = 2;

/// Per-link shared state, two cache lines at the start of the reserved
/// region. The ack slot is only used during the handshake: the acceptor
/// writes its outbound arena name into the connector's link so the
/// connector knows what to open.
#[repr(C, align(64))]
struct LinkHeader {
    closed: AtomicU32,
    ack_state: AtomicU32,
    /// Producer liveness, nanos since the unix epoch.
    heartbeat_ns: AtomicU64,
    ack_len: u32,
    _reserved: u32,
    ack_name: [u8; ACK_NAME_CAP],
    _pad: [u8; 40],
}

const LINK_HEADER_SIZE: usize = core::mem::size_of::<LinkHeader>();

const _: () = assert!(LINK_HEADER_SIZE == 128);

/// Envelope slots per ring.
pub const RING_CAPACITY: u32 = 256;

/// Reserved-region bytes a link occupies in its arena.
pub const fn link_reserved_len() -> usize {
    LINK_HEADER_SIZE + ring_bytes(RING_CAPACITY)
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A mapped link: the arena plus views over its embedded header and ring.
pub struct Link {
    arena: Arc<Arena>,
    header: *const LinkHeader,
    ring: Ring,
    /// Serializes producers; the ring itself is single-producer.
    send_lock: parking_lot::Mutex<()>,
}

// SAFETY: header state is atomic; the ring carries its own ordering; the
// arena mapping outlives the views.
unsafe impl Send for Link {}
unsafe impl Sync for Link {}

impl Link {
    /// Create the outbound link: a fresh arena with header and ring
    /// embedded in its reserved region.
    #[tracing::instrument(level = "debug", skip(name), fields(name = %name.as_ref()))]
    pub fn create(name: impl AsRef<str>, heap_capacity: u64) -> Result<Arc<Self>, Error> {
        let arena = Arena::create(name, link_reserved_len() as u32, heap_capacity)?;
        let (base, len) = arena.reserved();
        debug_assert!(len >= link_reserved_len());
        // The segment file is zero-filled; only non-zero fields need
        // writing. SAFETY: reserved region is exclusive until the name is
        // dialed by a peer.
        unsafe {
            (*(base as *mut LinkHeader))
                .heartbeat_ns
                .store(now_ns(), Ordering::Release);
        }
        // SAFETY: the ring region follows the header within reserved(),
        // zeroed and 64-byte aligned.
        let ring = unsafe { Ring::init(base.add(LINK_HEADER_SIZE), RING_CAPACITY) };
        Ok(Arc::new(Self {
            arena,
            header: base as *const LinkHeader,
            ring,
            send_lock: parking_lot::Mutex::new(()),
        }))
    }

    /// Open the peer's outbound link as our inbound one.
    #[tracing::instrument(level = "debug", skip(name), fields(name = %name.as_ref()))]
    pub fn open(name: impl AsRef<str>) -> Result<Arc<Self>, Error> {
        let arena = Arena::open(name)?;
        let (base, len) = arena.reserved();
        if len < LINK_HEADER_SIZE + RING_HEADER_SIZE {
            return Err(Error::HandshakeMismatch("reserved region too small"));
        }
        // SAFETY: extent checked above; the creator initialized the ring.
        let ring = unsafe { Ring::attach(base.add(LINK_HEADER_SIZE)) }?;
        Ok(Arc::new(Self {
            arena,
            header: base as *const LinkHeader,
            ring,
            send_lock: parking_lot::Mutex::new(()),
        }))
    }

    #[inline]
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.arena.name()
    }

    #[inline]
    fn header(&self) -> &LinkHeader {
        // SAFETY: points into the mapping owned by self.arena.
        unsafe { &*self.header }
    }

    /// Raise the closed flag. Observable by a purely polling peer.
    pub fn mark_closed(&self) {
        self.header().closed.store(1, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    /// Refresh the producer heartbeat. Called from the owning side's
    /// background loop.
    pub fn update_heartbeat(&self) {
        debug_assert_eq!(self.arena.role(), Role::Creator);
        self.header().heartbeat_ns.store(now_ns(), Ordering::Release);
    }

    /// Whether the producer refreshed its heartbeat recently enough.
    pub fn is_peer_alive(&self, max_staleness: Duration) -> bool {
        let beat = self.header().heartbeat_ns.load(Ordering::Acquire);
        now_ns().saturating_sub(beat) <= max_staleness.as_nanos() as u64
    }

    /// Enqueue without waiting. Used for the close sentinel, where a full
    /// ring must not stall teardown.
    pub fn try_send(&self, env: Envelope) -> bool {
        debug_assert_eq!(self.arena.role(), Role::Creator);
        let _guard = self.send_lock.lock();
        self.ring.try_push(env)
    }

    /// Enqueue one envelope, yielding while the ring is full.
    ///
    /// Fails with `ComponentClosed` once this link is marked closed; a
    /// vanished consumer is detected by the component watching its
    /// inbound link and closing.
    pub async fn send(&self, env: Envelope) -> Result<(), Error> {
        debug_assert_eq!(self.arena.role(), Role::Creator);
        loop {
            if self.is_closed() {
                return Err(Error::ComponentClosed);
            }
            // Not held across the yield.
            let pushed = {
                let _guard = self.send_lock.lock();
                self.ring.try_push(env)
            };
            if pushed {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    /// Dequeue one envelope, yielding while the ring is empty.
    ///
    /// Drains queued envelopes even after close; fails with
    /// `ComponentClosed` only once the ring is empty and the closed flag
    /// is up.
    pub async fn recv(&self) -> Result<Envelope, Error> {
        debug_assert_eq!(self.arena.role(), Role::Opener);
        loop {
            if let Some(env) = self.ring.try_pop() {
                return Ok(env);
            }
            if self.is_closed() {
                return Err(Error::ComponentClosed);
            }
            tokio::task::yield_now().await;
        }
    }

    /// Non-blocking dequeue. The component's recv loop uses this so it
    /// can interleave heartbeat and liveness checks.
    pub fn try_recv(&self) -> Option<Envelope> {
        debug_assert_eq!(self.arena.role(), Role::Opener);
        self.ring.try_pop()
    }

    /// Handshake: publish the acceptor's outbound arena name into this
    /// link's ack slot. One writer only.
    pub fn write_ack(&self, name: &str) -> Result<(), Error> {
        if name.len() > ACK_NAME_CAP {
            return Err(Error::InvalidConfig("arena name too long for ack slot"));
        }
        let header = self.header();
        header
            .ack_state
            .compare_exchange(ACK_EMPTY, ACK_WRITING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::HandshakeMismatch("ack slot already claimed"))?;
        // SAFETY: the WRITING state grants exclusive access to the name
        // bytes until READY is published. Raw copies only: taking a
        // reference into the shared mapping would be an implicit autoref
        // through the raw pointer.
        unsafe {
            let h = self.header as *mut LinkHeader;
            core::ptr::copy_nonoverlapping(
                name.as_ptr(),
                core::ptr::addr_of_mut!((*h).ack_name) as *mut u8,
                name.len(),
            );
            (*h).ack_len = name.len() as u32;
        }
        header.ack_state.store(ACK_READY, Ordering::Release);
        Ok(())
    }

    /// Handshake: poll for the acceptor's ack.
    pub fn try_read_ack(&self) -> Option<String> {
        let header = self.header();
        if header.ack_state.load(Ordering::Acquire) != ACK_READY {
            return None;
        }
        let len = (header.ack_len as usize).min(ACK_NAME_CAP);
        Some(String::from_utf8_lossy(&header.ack_name[..len]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeFlags;

    fn unique(tag: &str) -> String {
        use std::sync::atomic::AtomicU64;
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "test-link-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[tokio::test]
    async fn send_and_recv_across_mappings() {
        let name = unique("duplex");
        let tx = Link::create(&name, 1 << 16).unwrap();
        let rx = Link::open(&name).unwrap();

        tx.send(Envelope::request(11)).await.unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(env.correlation_id, 11);
        assert!(env.flags().contains(EnvelopeFlags::REQUEST));
    }

    #[tokio::test]
    async fn recv_drains_before_reporting_close() {
        let name = unique("drain");
        let tx = Link::create(&name, 1 << 16).unwrap();
        let rx = Link::open(&name).unwrap();

        tx.send(Envelope::request(1)).await.unwrap();
        tx.mark_closed();
        assert_eq!(rx.recv().await.unwrap().correlation_id, 1);
        assert!(matches!(rx.recv().await, Err(Error::ComponentClosed)));
    }

    #[tokio::test]
    async fn send_fails_once_closed() {
        let name = unique("sendclosed");
        let tx = Link::create(&name, 1 << 16).unwrap();
        tx.mark_closed();
        assert!(matches!(
            tx.send(Envelope::request(1)).await,
            Err(Error::ComponentClosed)
        ));
    }

    #[test]
    fn ack_slot_round_trip() {
        let name = unique("ack");
        let tx = Link::create(&name, 1 << 16).unwrap();
        let rx = Link::open(&name).unwrap();

        assert!(tx.try_read_ack().is_none());
        rx.write_ack("peer-arena-name").unwrap();
        assert_eq!(tx.try_read_ack().as_deref(), Some("peer-arena-name"));
        // Second writer loses.
        assert!(rx.write_ack("other").is_err());
    }

    #[test]
    fn parallel_senders_lose_no_envelopes() {
        let name = unique("mpsc");
        let tx = Link::create(&name, 1 << 16).unwrap();
        let rx = Link::open(&name).unwrap();

        const SENDERS: u64 = 4;
        const PER_SENDER: u64 = 20_000;
        let handles: Vec<_> = (0..SENDERS)
            .map(|s| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_SENDER {
                        let env = Envelope::request(s * PER_SENDER + i + 1);
                        while !tx.try_send(env) {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let total = SENDERS * PER_SENDER;
        let deadline = std::time::Instant::now() + Duration::from_secs(60);
        let mut seen = 0u64;
        let mut sum = 0u64;
        while seen < total {
            match rx.try_recv() {
                Some(env) => {
                    seen += 1;
                    sum += env.correlation_id;
                }
                None => {
                    assert!(std::time::Instant::now() < deadline, "envelopes lost");
                    std::thread::yield_now();
                }
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sum, total * (total + 1) / 2);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn heartbeat_staleness() {
        let name = unique("beat");
        let tx = Link::create(&name, 1 << 16).unwrap();
        let rx = Link::open(&name).unwrap();

        assert!(rx.is_peer_alive(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!rx.is_peer_alive(Duration::from_millis(1)));
        tx.update_heartbeat();
        assert!(rx.is_peer_alive(Duration::from_millis(50)));
    }
}
