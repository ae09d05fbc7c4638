//! The base connection endpoint: two cross-attached links and a
//! close-once state machine.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_core::{Arena, Envelope, Error, Link};
use tokio::sync::{mpsc, watch};

use crate::notify::Notifier;

/// How long without a peer heartbeat before the peer counts as gone.
const PEER_STALENESS: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One endpoint of an open connection.
///
/// `input` is the peer's outbound link (we consume), `output` is ours
/// (we produce). `Client` and `Server` wrap this with their respective
/// invocation protocols.
pub struct Component {
    pub(crate) input: Arc<Link>,
    pub(crate) output: Arc<Link>,
    state: AtomicU8,
    closed_tx: watch::Sender<bool>,
    on_closed: Notifier<()>,
}

impl Component {
    pub(crate) fn new(input: Arc<Link>, output: Arc<Link>) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            input,
            output,
            state: AtomicU8::new(STATE_OPEN),
            closed_tx,
            on_closed: Notifier::new(),
        })
    }

    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => State::Open,
            STATE_CLOSING => State::Closing,
            _ => State::Closed,
        }
    }

    /// True once the component left `Open`; operations fail from then on.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_OPEN
    }

    pub fn input_arena(&self) -> &Arc<Arena> {
        self.input.arena()
    }

    pub fn output_arena(&self) -> &Arc<Arena> {
        self.output.arena()
    }

    /// Subscribe to the Closed notification. Fires exactly once.
    pub fn on_closed(&self) -> mpsc::UnboundedReceiver<()> {
        self.on_closed.subscribe()
    }

    /// Await the transition to `Closed`. Resolves immediately if already
    /// there.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// First phase of teardown: `Open -> Closing`, exactly one winner.
    ///
    /// The winner marks the outbound link closed (observable by a polling
    /// peer) and best-effort enqueues the close sentinel, then returns
    /// true; it must finish with [`Component::finish_close`] after its
    /// role-specific drain. Losers observe the transition already taken.
    pub(crate) fn begin_close(&self) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.output.mark_closed();
        if !self.output.try_send(Envelope::close()) {
            tracing::debug!("close sentinel dropped, ring full; peer sees the closed flag");
        }
        true
    }

    /// Second phase: `Closing -> Closed`, Closed notification fires once.
    pub(crate) fn finish_close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.closed_tx.send_replace(true);
        self.on_closed.emit(());
        tracing::debug!(
            input = self.input.name(),
            output = self.output.name(),
            "component closed"
        );
    }

    /// Pull the next inbound envelope, refreshing the outbound heartbeat
    /// while polling.
    ///
    /// Fails with `ComponentClosed` when this side is closing, the close
    /// sentinel arrives, the peer marks its link closed (after draining),
    /// or the peer's heartbeat goes stale.
    pub(crate) async fn next_envelope(&self) -> Result<Envelope, Error> {
        loop {
            if self.is_closed() {
                return Err(Error::ComponentClosed);
            }
            self.output.update_heartbeat();
            if let Some(env) = self.input.try_recv() {
                if env.is_close() {
                    return Err(Error::ComponentClosed);
                }
                return Ok(env);
            }
            if self.input.is_closed() {
                return Err(Error::ComponentClosed);
            }
            if !self.input.is_peer_alive(PEER_STALENESS) {
                tracing::warn!(input = self.input.name(), "peer heartbeat went stale");
                return Err(Error::ComponentClosed);
            }
            tokio::task::yield_now().await;
        }
    }
}
