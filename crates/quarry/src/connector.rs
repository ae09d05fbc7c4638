//! Dialing side of the handshake.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use quarry_core::{Config, Error, Hub, Link};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::Instant;

use crate::client::Client;

/// How often a dial re-polls the hub and the ack slot.
const DIAL_POLL: Duration = Duration::from_millis(2);

/// Per-connection arena names carry a random suffix so one channel can
/// host many connections.
pub(crate) fn session_arena_name(channel: &str, side: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{channel}-{side}-{suffix}")
}

/// Performs a single dial attempt against a named channel.
pub struct ClientConnector {
    channel: String,
    config: Config,
}

impl ClientConnector {
    pub fn new(channel: impl Into<String>, config: Config) -> Self {
        Self {
            channel: channel.into(),
            config,
        }
    }

    /// Dial once: wait for the hub, publish a hello carrying a fresh
    /// outbound arena, wait for the acceptor's ack, cross-attach.
    ///
    /// Fails with `ConnectTimeout` when no listener answers within
    /// `timeout` and `ConnectRefused` when the hub exists but its
    /// acceptor has shut down.
    #[tracing::instrument(level = "debug", skip(self), fields(channel = %self.channel))]
    pub async fn connect(&self, timeout: Duration) -> Result<Arc<Client>, Error> {
        let deadline = Instant::now() + timeout;

        let hub = loop {
            match Hub::open(&self.channel) {
                Ok(hub) => break hub,
                Err(Error::System(err)) if err.kind() == ErrorKind::NotFound => {
                    if Instant::now() >= deadline {
                        return Err(Error::ConnectTimeout);
                    }
                    tokio::time::sleep(DIAL_POLL).await;
                }
                Err(err) => return Err(err),
            }
        };

        let name = session_arena_name(&self.channel, "cli");
        // If the dial fails past this point the Link (and its Creator
        // arena) drops, unlinking the segment file.
        let output = Link::create(&name, self.config.output_arena_size)?;

        while !hub.try_publish(&name)? {
            if Instant::now() >= deadline {
                return Err(Error::ConnectTimeout);
            }
            tokio::time::sleep(DIAL_POLL).await;
        }

        let ack = loop {
            if let Some(ack) = output.try_read_ack() {
                break ack;
            }
            if !hub.is_listening() {
                return Err(Error::ConnectRefused);
            }
            if Instant::now() >= deadline {
                return Err(Error::ConnectTimeout);
            }
            tokio::time::sleep(DIAL_POLL).await;
        };

        let input = Link::open(&ack)?;
        tracing::info!(channel = %self.channel, output = %name, input = %ack, "connected");
        Ok(Client::start(input, output, self.config.clone()))
    }
}
