//! Listening side of the handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_core::{Config, Error, Hub, Link};
use tokio::sync::mpsc;

use crate::connector::session_arena_name;
use crate::notify::Notifier;
use crate::server::{HandlerFactory, Server};

/// How often the accept loop polls the hub for hellos.
const ACCEPT_POLL: Duration = Duration::from_millis(2);

/// Listens on a named channel and materializes one [`Server`] per
/// accepted peer.
///
/// The acceptor never closes accepted servers; each one's lifetime is
/// independent once the Accepted notification fires.
pub struct ServerAcceptor {
    channel: String,
    hub: Arc<Hub>,
    on_accepted: Notifier<Arc<Server>>,
    stopped: AtomicBool,
}

impl ServerAcceptor {
    /// Claim the channel and start accepting.
    #[tracing::instrument(level = "debug", skip(channel, config, factory), fields(channel = %channel.as_ref()))]
    pub fn bind(
        channel: impl AsRef<str>,
        config: Config,
        factory: HandlerFactory,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let channel = channel.as_ref().to_owned();
        let hub = Hub::create(&channel)?;
        let acceptor = Arc::new(Self {
            channel,
            hub,
            on_accepted: Notifier::new(),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(accept_loop(Arc::downgrade(&acceptor), config, factory));
        Ok(acceptor)
    }

    /// Subscribe to the Accepted notification.
    pub fn on_accepted(&self) -> mpsc::UnboundedReceiver<Arc<Server>> {
        self.on_accepted.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop listening. Dials from then on fail with `ConnectRefused`;
    /// already-accepted servers are untouched.
    pub fn shut_down(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.shut_down();
        tracing::info!(channel = %self.channel, "acceptor shut down");
    }

    fn establish(&self, hello: &str, config: &Config, factory: &HandlerFactory) -> Result<Arc<Server>, Error> {
        let input = Link::open(hello)?;
        let name = session_arena_name(&self.channel, "srv");
        let output = Link::create(&name, config.output_arena_size)?;
        input.write_ack(&name)?;
        tracing::info!(channel = %self.channel, input = hello, output = %name, "accepted peer");
        Ok(Server::start(input, output, factory))
    }
}

impl Drop for ServerAcceptor {
    fn drop(&mut self) {
        self.shut_down();
    }
}

async fn accept_loop(acceptor: std::sync::Weak<ServerAcceptor>, config: Config, factory: HandlerFactory) {
    loop {
        // Dropping the last handle stops the loop; Drop shut the hub down.
        let Some(acceptor) = acceptor.upgrade() else {
            return;
        };
        if acceptor.is_stopped() {
            return;
        }
        match acceptor.hub.take_hello() {
            Some(hello) => match acceptor.establish(&hello, &config, &factory) {
                Ok(server) => acceptor.on_accepted.emit(server),
                // A bad hello poisons only that dial.
                Err(err) => {
                    tracing::warn!(channel = %acceptor.channel, hello, %err, "handshake failed")
                }
            },
            None => tokio::time::sleep(ACCEPT_POLL).await,
        }
    }
}
