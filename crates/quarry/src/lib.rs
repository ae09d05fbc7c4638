//! quarry: cross-process RPC over shared memory, where the payload *is*
//! the arena.
//!
//! A connection is two cross-attached shared-memory arenas, one per
//! direction. Requests and responses cross as 64-byte envelopes through
//! an SPSC ring embedded in each arena; values too big to ride inline
//! are built directly in the sender's arena and referenced by offset, so
//! structured data (vectors, vectors of vectors) moves without
//! serialization.
//!
//! ```no_run
//! use std::sync::Arc;
//! use quarry::{handler_fn, Config, Error, Timeout, Transport};
//!
//! # async fn demo() -> Result<(), Error> {
//! let transport = Transport::new("demo", Config::default())?;
//! let (_acceptor, _servers) = transport.bind(handler_fn(|x: i64| async move { Ok(x * 2) }))?;
//!
//! let client = transport.connect(std::time::Duration::from_secs(5)).await?;
//! let doubled: i64 = client.invoke(21i64, Timeout::Default).await?;
//! assert_eq!(doubled, 42);
//! # Ok(())
//! # }
//! ```

mod accessor;
mod acceptor;
mod client;
mod component;
mod connector;
mod notify;
mod server;
mod transport;

pub use accessor::{AccessMode, ClientAccessor, ConnectionEvent, ServersAccessor};
pub use acceptor::ServerAcceptor;
pub use client::Client;
pub use component::State;
pub use connector::ClientConnector;
pub use notify::Notifier;
pub use server::{handler_fn, handler_with_arena, BoxedHandler, HandlerFactory, Server};
pub use transport::Transport;

pub use quarry_core::{
    payload, plain_payload, Arena, ArenaConstruct, ArenaElement, ArenaVec, Config, Envelope,
    EnvelopeFlags, Error, Payload, Plain, Registry, Timeout,
};
