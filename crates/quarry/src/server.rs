//! The handling endpoint.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quarry_core::payload::encode_message;
use quarry_core::{Arena, Envelope, EnvelopeFlags, Error, Link, Payload};
use tokio::sync::{mpsc, watch, Notify};

use crate::component::Component;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Per-connection request handler: envelope in, reply envelope out.
/// Produced once per accepted connection by a [`HandlerFactory`].
pub type BoxedHandler = Arc<dyn Fn(Envelope) -> BoxFuture<Result<Envelope, Error>> + Send + Sync>;

/// Builds a handler for one connection, given its (input, output) arenas.
pub type HandlerFactory = Arc<dyn Fn(Arc<Arena>, Arc<Arena>) -> BoxedHandler + Send + Sync>;

/// One accepted connection on the serving side.
///
/// Requests with distinct correlation ids run concurrently; each reply
/// carries the request's id. Handler failures become error replies, not
/// connection teardown.
pub struct Server {
    component: Arc<Component>,
    inflight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    cancel_tx: watch::Sender<bool>,
}

impl Server {
    pub(crate) fn start(input: Arc<Link>, output: Arc<Link>, factory: &HandlerFactory) -> Arc<Self> {
        let component = Component::new(input, output);
        let handler = factory(
            component.input_arena().clone(),
            component.output_arena().clone(),
        );
        let (cancel_tx, _) = watch::channel(false);
        let server = Arc::new(Self {
            component,
            inflight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            cancel_tx,
        });
        tokio::spawn(recv_loop(server.clone(), handler));
        server
    }

    pub fn input_arena(&self) -> &Arc<Arena> {
        self.component.input_arena()
    }

    /// The arena response containers must be built in.
    pub fn output_arena(&self) -> &Arc<Arena> {
        self.component.output_arena()
    }

    pub fn is_closed(&self) -> bool {
        self.component.is_closed()
    }

    pub fn state(&self) -> crate::component::State {
        self.component.state()
    }

    pub fn on_closed(&self) -> mpsc::UnboundedReceiver<()> {
        self.component.on_closed()
    }

    pub async fn closed(&self) {
        self.component.closed().await;
    }

    /// Requests currently being handled.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Close this endpoint. Idempotent. In-flight handler futures are
    /// cancelled, and the transition to `Closed` waits for them to
    /// unwind, so a handler never allocates into a torn-down arena. The
    /// paired client resolves its outstanding invocations with
    /// `ComponentClosed` when it observes the closed link.
    pub async fn close(&self) {
        if !self.component.begin_close() {
            self.component.closed().await;
            return;
        }
        self.cancel_tx.send_replace(true);
        loop {
            let drained = self.idle.notified();
            if self.inflight.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
        self.component.finish_close();
    }

    fn dispatch(self: &Arc<Self>, handler: BoxedHandler, env: Envelope) {
        let id = env.correlation_id;
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let server = self.clone();
        let mut cancel_rx = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = handler(env) => {
                    let reply = match result {
                        Ok(mut reply) => {
                            reply.correlation_id = id;
                            reply.flags |= EnvelopeFlags::RESPONSE.bits();
                            reply
                        }
                        Err(err) => {
                            tracing::debug!(correlation_id = id, %err, "handler failed");
                            error_reply(id, &err, server.component.output_arena())
                        }
                    };
                    if server.component.output.send(reply).await.is_err() {
                        tracing::debug!(correlation_id = id, "reply dropped, connection closing");
                    }
                }
                _ = cancelled(&mut cancel_rx) => {
                    tracing::debug!(correlation_id = id, "handler cancelled by close");
                }
            }
            server.inflight.fetch_sub(1, Ordering::AcqRel);
            server.idle.notify_waiters();
        });
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn error_reply(id: u64, err: &Error, arena: &Arc<Arena>) -> Envelope {
    let mut env = Envelope::new(id, EnvelopeFlags::RESPONSE | EnvelopeFlags::ERROR);
    let msg = err.to_string();
    if encode_message(&msg, arena, &mut env).is_err() {
        // Arena exhausted; fall back to however much fits inline.
        let mut cut = msg.len().min(quarry_core::INLINE_CAPACITY);
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        env.set_inline(&msg.as_bytes()[..cut]);
    }
    env
}

async fn recv_loop(server: Arc<Server>, handler: BoxedHandler) {
    loop {
        match server.component.next_envelope().await {
            Ok(env) if env.flags().contains(EnvelopeFlags::REQUEST) => {
                server.dispatch(handler.clone(), env);
            }
            Ok(env) => {
                tracing::warn!(flags = ?env.flags(), "server dropped non-request envelope");
            }
            Err(_) => {
                server.close().await;
                return;
            }
        }
    }
}

/// Adapt a plain async function into a [`HandlerFactory`]: the request is
/// decoded from the input arena, the response encoded into the output one.
pub fn handler_fn<Req, Resp, F, Fut>(f: F) -> HandlerFactory
where
    Req: Payload,
    Resp: Payload,
    F: Fn(Req) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
{
    handler_with_arena(move |req, _arena| f(req))
}

/// Like [`handler_fn`] but hands the handler the connection's output
/// arena, for responses that build containers in place.
pub fn handler_with_arena<Req, Resp, F, Fut>(f: F) -> HandlerFactory
where
    Req: Payload,
    Resp: Payload,
    F: Fn(Req, Arc<Arena>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
{
    Arc::new(move |input: Arc<Arena>, output: Arc<Arena>| {
        let f = f.clone();
        Arc::new(move |env: Envelope| -> BoxFuture<Result<Envelope, Error>> {
            let f = f.clone();
            let input = input.clone();
            let output = output.clone();
            Box::pin(async move {
                let request = Req::decode(&input, &env)?;
                let response = f(request, output.clone()).await?;
                let mut reply = Envelope::response(env.correlation_id);
                response.encode(&output, &mut reply)?;
                Ok(reply)
            })
        }) as BoxedHandler
    })
}
