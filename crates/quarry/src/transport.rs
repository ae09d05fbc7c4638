//! Top-level assembly: a named channel plus a config, wired into the
//! four connection-management surfaces.

use std::sync::Arc;
use std::time::Duration;

use quarry_core::{Config, Error};

use crate::accessor::{AccessMode, ClientAccessor, ServersAccessor};
use crate::acceptor::ServerAcceptor;
use crate::client::Client;
use crate::connector::ClientConnector;
use crate::server::HandlerFactory;

/// Session arena names append `-cli-` / `-srv-` plus an 8-char suffix
/// and must still fit a hello slot.
const MAX_CHANNEL_LEN: usize = 40;

/// Factory for connection surfaces over one named channel.
pub struct Transport {
    channel: String,
    config: Config,
}

impl Transport {
    pub fn new(channel: impl Into<String>, config: Config) -> Result<Self, Error> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(Error::InvalidConfig("channel name must not be empty"));
        }
        if channel.len() > MAX_CHANNEL_LEN {
            return Err(Error::InvalidConfig("channel name too long"));
        }
        config.validate()?;
        Ok(Self { channel, config })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Listen on the channel. Returns the acceptor plus an accessor
    /// tracking the accepted set.
    pub fn bind(
        &self,
        factory: HandlerFactory,
    ) -> Result<(Arc<ServerAcceptor>, Arc<ServersAccessor>), Error> {
        let acceptor = ServerAcceptor::bind(&self.channel, self.config.clone(), factory)?;
        let servers = ServersAccessor::start(&acceptor);
        Ok((acceptor, servers))
    }

    /// Single dial attempt with an explicit deadline.
    pub async fn connect(&self, timeout: Duration) -> Result<Arc<Client>, Error> {
        ClientConnector::new(self.channel.clone(), self.config.clone())
            .connect(timeout)
            .await
    }

    /// Supervised client slot with automatic reconnect.
    pub fn client_accessor(&self, mode: AccessMode) -> Arc<ClientAccessor> {
        ClientAccessor::start(self.channel.clone(), self.config.clone(), mode)
    }
}
