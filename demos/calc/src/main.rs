//! Calculator over quarry: the request rides inline in the envelope, the
//! answer text comes back as a byte vector built in the server's arena.
//!
//! Run `calc server` in one terminal, `calc client` in another.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use quarry::{
    handler_with_arena, plain_payload, Arena, ArenaVec, Config, Error, Plain, Registry, Timeout,
    Transport,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct CalcRequest {
    x: f64,
    y: f64,
    op: u8,
}

// SAFETY: repr(C), scalar fields only.
unsafe impl Plain for CalcRequest {}
plain_payload!(CalcRequest);

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = Registry::new();
        registry.register::<ArenaVec<u8>>();
        registry
    })
}

async fn handle(req: CalcRequest, arena: Arc<Arena>) -> Result<ArenaVec<u8>, Error> {
    let z = match req.op {
        b'+' => req.x + req.y,
        b'-' => req.x - req.y,
        b'*' => req.x * req.y,
        b'/' => {
            if req.y == 0.0 {
                return Err(Error::InvalidConfig("division by zero"));
            }
            req.x / req.y
        }
        other => {
            tracing::warn!(op = other, "unknown operator");
            return Err(Error::InvalidConfig("unknown operator"));
        }
    };

    let text = format!("{} {} {} = {}", req.x, req.op as char, req.y, z);
    let mut reply: ArenaVec<u8> = registry().construct(&arena)?;
    reply.reserve(text.len())?;
    for byte in text.bytes() {
        reply.push(byte)?;
    }
    Ok(reply)
}

async fn run_server(channel: &str) -> Result<(), Error> {
    let transport = Transport::new(channel, Config::default())?;
    let (acceptor, servers) = transport.bind(handler_with_arena(handle))?;
    tracing::info!(channel, "calc server listening, ctrl-c to stop");

    tokio::signal::ctrl_c().await.map_err(Error::System)?;
    acceptor.shut_down();
    for server in servers.snapshot() {
        server.close().await;
    }
    Ok(())
}

async fn run_client(channel: &str) -> Result<(), Error> {
    let transport = Transport::new(channel, Config::default())?;
    let client = transport.connect(Duration::from_secs(10)).await?;
    tracing::info!(channel, "connected");

    let calls = [
        (2.0, 3.0, b'+'),
        (10.0, 4.0, b'-'),
        (6.0, 7.0, b'*'),
        (1.0, 3.0, b'/'),
        // Rejected by the server; logged and skipped.
        (1.0, 0.0, b'/'),
    ];
    for (x, y, op) in calls {
        let request = CalcRequest { x, y, op };
        match client
            .invoke::<CalcRequest, ArenaVec<u8>>(request, Timeout::Default)
            .await
        {
            Ok(text) => {
                let line: String = text.iter().map(char::from).collect();
                tracing::info!("{line}");
                text.dispose();
            }
            Err(err) => {
                let op = op as char;
                tracing::warn!(%err, x, y, %op, "call failed");
            }
        }
    }

    client.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let mode = args.next();
    let channel = args.next().unwrap_or_else(|| "calc".to_owned());

    let outcome = match mode.as_deref() {
        Some("server") => run_server(&channel).await,
        Some("client") => run_client(&channel).await,
        _ => {
            eprintln!("usage: calc <server|client> [channel]");
            std::process::exit(2);
        }
    };
    if let Err(err) = outcome {
        tracing::error!(%err, "fatal");
        std::process::exit(1);
    }
}
