//! Long-lived façades over reconnection and acceptance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quarry_core::{Config, Error};
use tokio::sync::{mpsc, watch};

use crate::acceptor::ServerAcceptor;
use crate::client::Client;
use crate::connector::ClientConnector;
use crate::notify::Notifier;
use crate::server::Server;

/// What [`ClientAccessor::client`] does when no connection is live.
/// Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Await availability.
    Blocking,
    /// Fail fast with `NotConnected`.
    NonBlocking,
}

/// Connection state changes published by the accessors.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// A reconnect attempt failed; the loop retries.
    Error(String),
}

/// Owns one logical client slot and redials whenever the current client
/// closes.
pub struct ClientAccessor {
    mode: AccessMode,
    current: Mutex<Option<Arc<Client>>>,
    connected_tx: watch::Sender<bool>,
    events: Notifier<ConnectionEvent>,
    stopped: AtomicBool,
}

impl ClientAccessor {
    pub(crate) fn start(channel: String, config: Config, mode: AccessMode) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        let accessor = Arc::new(Self {
            mode,
            current: Mutex::new(None),
            connected_tx,
            events: Notifier::new(),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(reconnect_loop(Arc::downgrade(&accessor), channel, config));
        accessor
    }

    /// Subscribe to Connected/Disconnected/Error events.
    pub fn on_event(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.current.lock().is_some()
    }

    /// The currently live client.
    ///
    /// In `Blocking` mode this awaits the next connection when none is
    /// live; in `NonBlocking` mode it fails fast with `NotConnected`.
    pub async fn client(&self) -> Result<Arc<Client>, Error> {
        loop {
            if let Some(client) = self.current.lock().clone() {
                return Ok(client);
            }
            match self.mode {
                AccessMode::NonBlocking => return Err(Error::NotConnected),
                AccessMode::Blocking => {
                    let mut rx = self.connected_tx.subscribe();
                    // `subscribe` marks the current value seen, so an
                    // install or stop landing between the check above and
                    // the subscribe would never wake `changed`. Re-check
                    // both before waiting.
                    if self.stopped.load(Ordering::Acquire) {
                        return Err(Error::ComponentClosed);
                    }
                    if self.current.lock().is_some() {
                        continue;
                    }
                    if rx.changed().await.is_err() {
                        return Err(Error::ComponentClosed);
                    }
                }
            }
        }
    }

    /// Stop reconnecting and close the current client, if any.
    pub fn shut_down(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(client) = self.current.lock().take() {
            client.close();
        }
        // Wake blocked callers so they observe the stop.
        self.connected_tx.send_replace(false);
    }

    fn install(&self, client: Arc<Client>) {
        *self.current.lock() = Some(client);
        self.connected_tx.send_replace(true);
        self.events.emit(ConnectionEvent::Connected);
    }

    fn clear(&self) {
        self.current.lock().take();
        self.connected_tx.send_replace(false);
        self.events.emit(ConnectionEvent::Disconnected);
    }
}

impl Drop for ClientAccessor {
    fn drop(&mut self) {
        self.shut_down();
    }
}

async fn reconnect_loop(weak: Weak<ClientAccessor>, channel: String, config: Config) {
    let connector = ClientConnector::new(channel, config.clone());
    loop {
        let client = {
            let Some(accessor) = weak.upgrade() else {
                return;
            };
            if accessor.stopped.load(Ordering::Acquire) {
                return;
            }
            match connector.connect(config.reconnect_timeout).await {
                Ok(client) => {
                    if accessor.stopped.load(Ordering::Acquire) {
                        client.close();
                        return;
                    }
                    accessor.install(client.clone());
                    client
                }
                Err(err) => {
                    tracing::debug!(%err, "dial failed, will retry");
                    accessor
                        .events
                        .emit(ConnectionEvent::Error(err.to_string()));
                    drop(accessor);
                    tokio::time::sleep(config.reconnect_timeout).await;
                    continue;
                }
            }
        };

        client.closed().await;

        let Some(accessor) = weak.upgrade() else {
            return;
        };
        if accessor.stopped.load(Ordering::Acquire) {
            return;
        }
        accessor.clear();
        drop(accessor);
        tokio::time::sleep(config.reconnect_timeout).await;
    }
}

/// Tracks the live set of servers accepted on a channel.
pub struct ServersAccessor {
    servers: Mutex<Vec<Arc<Server>>>,
    events: Notifier<ConnectionEvent>,
}

impl ServersAccessor {
    pub(crate) fn start(acceptor: &ServerAcceptor) -> Arc<Self> {
        let accessor = Arc::new(Self {
            servers: Mutex::new(Vec::new()),
            events: Notifier::new(),
        });
        tokio::spawn(track_loop(Arc::downgrade(&accessor), acceptor.on_accepted()));
        accessor
    }

    /// Subscribe to Connected/Disconnected events for the tracked set.
    pub fn on_event(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// The currently open servers.
    pub fn snapshot(&self) -> Vec<Arc<Server>> {
        self.servers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }

    fn add(&self, server: Arc<Server>) {
        self.servers.lock().push(server);
        self.events.emit(ConnectionEvent::Connected);
    }

    fn remove(&self, server: &Arc<Server>) {
        self.servers.lock().retain(|s| !Arc::ptr_eq(s, server));
        self.events.emit(ConnectionEvent::Disconnected);
    }
}

async fn track_loop(weak: Weak<ServersAccessor>, mut accepted: mpsc::UnboundedReceiver<Arc<Server>>) {
    while let Some(server) = accepted.recv().await {
        let Some(accessor) = weak.upgrade() else {
            return;
        };
        accessor.add(server.clone());
        let weak = weak.clone();
        tokio::spawn(async move {
            server.closed().await;
            if let Some(accessor) = weak.upgrade() {
                accessor.remove(&server);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::Link;
    use std::time::Duration;

    fn unique(tag: &str) -> String {
        use std::sync::atomic::AtomicU64;
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "test-accessor-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn bare(mode: AccessMode) -> Arc<ClientAccessor> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(ClientAccessor {
            mode,
            current: Mutex::new(None),
            connected_tx,
            events: Notifier::new(),
            stopped: AtomicBool::new(false),
        })
    }

    fn dummy_client() -> Arc<Client> {
        let name = unique("dummy");
        let input_peer = Link::create(&format!("{name}-a"), 1 << 16).unwrap();
        let input = Link::open(&format!("{name}-a")).unwrap();
        let output = Link::create(&format!("{name}-b"), 1 << 16).unwrap();
        drop(input_peer);
        Client::start(input, output, Config::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_client_sees_an_install_racing_the_wait() {
        let client = dummy_client();
        for _ in 0..200 {
            let accessor = bare(AccessMode::Blocking);
            let waiter = tokio::spawn({
                let accessor = accessor.clone();
                async move { accessor.client().await }
            });
            tokio::task::yield_now().await;
            accessor.install(client.clone());
            let got = tokio::time::timeout(Duration::from_secs(2), waiter).await;
            assert!(got.is_ok(), "blocking client() missed a racing install");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_client_sees_a_racing_shutdown() {
        for _ in 0..200 {
            let accessor = bare(AccessMode::Blocking);
            let waiter = tokio::spawn({
                let accessor = accessor.clone();
                async move { accessor.client().await }
            });
            tokio::task::yield_now().await;
            accessor.shut_down();
            let got = tokio::time::timeout(Duration::from_secs(2), waiter).await;
            let outcome = got.expect("blocking client() missed a racing shutdown");
            assert!(matches!(outcome.unwrap(), Err(Error::ComponentClosed)));
        }
    }
}
