//! The invoking endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_core::{Arena, Config, Envelope, EnvelopeFlags, Error, Link, Payload, Timeout};
use tokio::sync::{mpsc, oneshot};

use crate::component::Component;

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Envelope, Error>>>>;

/// A live client connection.
///
/// Concurrent `invoke` calls are routed by correlation id through the
/// pending map; responses may complete in any order. Closing (either
/// side) resolves every outstanding invocation with `ComponentClosed`.
pub struct Client {
    component: Arc<Component>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    config: Config,
}

impl Client {
    pub(crate) fn start(input: Arc<Link>, output: Arc<Link>, config: Config) -> Arc<Self> {
        let client = Arc::new(Self {
            component: Component::new(input, output),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            config,
        });
        tokio::spawn(recv_loop(client.clone()));
        client
    }

    /// The arena request containers must be built in.
    pub fn output_arena(&self) -> &Arc<Arena> {
        self.component.output_arena()
    }

    /// The arena decoded responses live in.
    pub fn input_arena(&self) -> &Arc<Arena> {
        self.component.input_arena()
    }

    pub fn is_closed(&self) -> bool {
        self.component.is_closed()
    }

    pub fn state(&self) -> crate::component::State {
        self.component.state()
    }

    /// Subscribe to the Closed notification.
    pub fn on_closed(&self) -> mpsc::UnboundedReceiver<()> {
        self.component.on_closed()
    }

    /// Await the transition to `Closed`.
    pub async fn closed(&self) {
        self.component.closed().await;
    }

    /// Issue one correlated invocation.
    ///
    /// The request is encoded into the outbound arena before the envelope
    /// is transmitted; a container request must already live there (see
    /// [`Client::output_arena`]). A `Timeout::Default` deadline resolves
    /// against the config; `Timeout::Never` waits indefinitely. A timeout
    /// cancels only the local wait, never the server's handler; a late
    /// response for a timed-out id is discarded by the recv loop.
    pub async fn invoke<Req: Payload, Resp: Payload>(
        &self,
        request: Req,
        timeout: Timeout,
    ) -> Result<Resp, Error> {
        if self.is_closed() {
            return Err(Error::ComponentClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut env = Envelope::request(id);
        request.encode(self.output_arena(), &mut env)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // Re-check: a close racing the insert may already have drained the
        // map, and nothing would ever resolve this entry.
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(Error::ComponentClosed);
        }

        if let Err(err) = self.component.output.send(env).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        let outcome = match timeout.resolve(&self.config) {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    return Err(Error::RequestTimeout);
                }
            },
            None => rx.await,
        };
        // A dropped sender means the map was drained by close.
        let env = outcome.map_err(|_| Error::ComponentClosed)??;

        if env.flags().contains(EnvelopeFlags::ERROR) {
            return Err(Error::Handler(quarry_core::payload::decode_message(
                self.input_arena(),
                &env,
            )));
        }
        Resp::decode(self.input_arena(), &env)
    }

    /// Close this endpoint. Idempotent; every outstanding invocation
    /// resolves with `ComponentClosed`.
    pub fn close(&self) {
        if !self.component.begin_close() {
            return;
        }
        self.fail_pending();
        self.component.finish_close();
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (id, tx) in drained {
            tracing::debug!(correlation_id = id, "failing pending invocation on close");
            let _ = tx.send(Err(Error::ComponentClosed));
        }
    }

    fn route(&self, env: Envelope) {
        let flags = env.flags();
        if !flags.intersects(EnvelopeFlags::RESPONSE | EnvelopeFlags::ERROR) {
            tracing::warn!(?flags, "client dropped non-response envelope");
            return;
        }
        match self.pending.lock().remove(&env.correlation_id) {
            Some(tx) => {
                if let Err(Ok(env)) = tx.send(Ok(env)) {
                    // The waiter timed out between our map lookup and the
                    // delivery; nobody will consume the payload.
                    quarry_core::payload::release_payload(self.input_arena(), &env);
                }
            }
            // Late or duplicate response; the invocation already resolved.
            // Give its payload back to the arena, or sustained timeouts
            // would bleed it dry.
            None => {
                tracing::debug!(
                    correlation_id = env.correlation_id,
                    "discarding unmatched response"
                );
                quarry_core::payload::release_payload(self.input_arena(), &env);
            }
        }
    }
}

async fn recv_loop(client: Arc<Client>) {
    loop {
        match client.component.next_envelope().await {
            Ok(env) => client.route(env),
            Err(_) => {
                client.close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unique(tag: &str) -> String {
        use std::sync::atomic::AtomicU64;
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "test-client-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    // A client whose inbound traffic the test scripts by hand.
    fn harness() -> (Arc<Client>, Arc<Link>) {
        let name = unique("route");
        let peer_tx = Link::create(&format!("{name}-in"), 1 << 20).unwrap();
        let input = Link::open(&format!("{name}-in")).unwrap();
        let output = Link::create(&format!("{name}-out"), 1 << 20).unwrap();
        (Client::start(input, output, Config::default()), peer_tx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unmatched_response_releases_its_payload() {
        let (_client, peer_tx) = harness();
        let arena = peer_tx.arena().clone();

        // A response nobody asked for, carrying a heap block.
        let offset = arena.alloc(64).unwrap();
        let mut env = Envelope::response(7777);
        env.set_offset(offset, 64);
        assert!(peer_tx.try_send(env));

        // The recv loop discards it and the block returns to its free
        // list, where the next same-class alloc finds it. Allocations
        // that miss come off the bump heap and are deliberately not
        // freed, so the list can only ever hand back the discarded block.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            peer_tx.update_heartbeat();
            let reclaimed = arena.alloc(64).unwrap();
            if reclaimed == offset {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "discarded payload block was never freed"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}
