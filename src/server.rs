//! Request dispatch, the HTTP server and graceful shutdown.
//!
//! # Dispatch
//!
//! Every request runs on its own task. The dispatcher wraps the response in
//! a compressor when configured, starts a watcher that closes the response
//! once the request's lifetime is done, and runs the application chain
//! behind a panic boundary. A panic hook records the trace where the panic
//! was raised, so the logged stack starts at the failing frame. Whatever
//! happens, exactly one response goes out:
//!
//! - headers already sent: a trailing error is only logged,
//! - client gone: a bare 500,
//! - deadline passed: a 504 error,
//! - chain failed: [`Context::fail`],
//! - otherwise: headers are flushed with whatever the chain set up.
//!
//! On SIGTERM or Ctrl-C the server stops accepting and drains in-flight
//! connections before [`Server::serve`] returns.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::app::Settings;
use crate::compress;
use crate::context::Context;
use crate::error::{BoxError, Error};
use crate::handler::{Handler, Middleware, Outcome};
use crate::lifetime::{Lifetime, LifetimeError};
use crate::transport::{self, Head, ResponseBody};

/// Panic payload that aborts a request without a response.
///
/// The dispatcher re-raises it untouched and the connection is dropped.
/// Raise it with [`Context::abort`].
#[derive(Clone, Copy, Debug)]
pub struct Abort;

// ── Service ──────────────────────────────────────────────────────────────────

/// A frozen application: settings plus the composed middleware chain.
/// Cheap to clone; every connection holds one.
#[derive(Clone)]
pub struct Service {
    settings: Arc<Settings>,
    chain: Middleware,
}

impl Service {
    pub(crate) fn new(settings: Arc<Settings>, chain: Middleware) -> Self {
        install_panic_hook();
        Self { settings, chain }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs one request through the application.
    ///
    /// The body is collected up to the body parser's limit first; a larger
    /// body fails with 413 and an unreadable one with 400, both through the
    /// normal error path. Resolves once headers are committed, while the
    /// body keeps streaming. `Err` means the request was aborted and the
    /// connection should be dropped.
    pub async fn handle<B>(&self, req: http::Request<B>) -> Result<http::Response<ResponseBody>, Error>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let limit = self.settings.body_parser().max_bytes();
        let (body, rejected) = match Limited::new(body, limit).collect().await {
            Ok(collected) => (collected.to_bytes(), None),
            Err(e) if e.is::<LengthLimitError>() => {
                let err = Error::PAYLOAD_TOO_LARGE
                    .with_message(format!("request entity exceeds {limit} bytes"));
                (Bytes::new(), Some(err))
            }
            Err(e) => (Bytes::new(), Some(Error::BAD_REQUEST.from_cause(&*e))),
        };

        let lifetime = Lifetime::new(self.settings.timeout());
        let token = lifetime.token().clone();
        let (writer, head, body_out) = transport::channel(token.clone());
        let ctx = Context::build(
            Arc::clone(&self.settings),
            http::Request::from_parts(parts, body),
            Box::new(writer),
            lifetime,
        );

        // Dropping this future means hyper gave up on the request.
        let guard = token.drop_guard();
        tokio::spawn(dispatch(self.chain.clone(), ctx, rejected));

        let head = head.await;
        guard.disarm();
        match head {
            Ok(Head { status, headers }) => {
                let mut res = http::Response::new(body_out);
                *res.status_mut() = status;
                *res.headers_mut() = headers;
                Ok(res)
            }
            Err(_) => Err(Error::INTERNAL_SERVER_ERROR.with_message("request aborted")),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

async fn dispatch(chain: Middleware, ctx: Context, rejected: Option<Error>) {
    compress::install(&ctx);

    let watcher = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            ctx.lifetime().done().await;
            ctx.response().mark_ended();
        })
    };

    let outcome = match rejected {
        Some(err) => Err(err.into()),
        None => match guarded(&chain, &ctx).await {
            Ok(outcome) => outcome,
            Err(panicked) => {
                if panicked.payload.is::<Abort>() {
                    watcher.abort();
                    close(&ctx);
                    std::panic::resume_unwind(panicked.payload);
                }
                recover(&ctx, panicked);
                Ok(())
            }
        },
    };

    finish(&ctx, outcome);
    watcher.abort();
    close(&ctx);
}

/// Turns a recovered panic into an error response.
fn recover(ctx: &Context, panicked: Panicked) {
    let err = Error::capture_panic(panicked.payload, panicked.trace.as_ref());
    let res = ctx.response();
    if res.header_written() {
        error!(code = err.code(), error = %err, stack = err.stack().unwrap_or(""), "panic after headers were sent");
        return;
    }
    res.clear_before_send();
    res.reset_headers(None);
    ctx.respond_error(&err);
}

/// Resolves the terminal outcome of a chain into a response.
fn finish(ctx: &Context, outcome: Outcome) {
    let res = ctx.response();
    if res.header_written() {
        if let Err(e) = outcome {
            let err = Error::capture_with_stack(Box::new(e), 0);
            error!(code = err.code(), error = %err, stack = err.stack().unwrap_or(""), "error after headers were sent");
        }
        return;
    }

    let outcome = match ctx.err() {
        Some(LifetimeError::Canceled) => {
            if let Err(e) = res.send_headers(500) {
                debug!(error = %e, "client gone before the response");
            }
            return;
        }
        Some(cause @ LifetimeError::DeadlineExceeded) => {
            Err(Error::GATEWAY_TIMEOUT.with_message(cause.to_string()).into())
        }
        None => outcome,
    };

    match outcome {
        Err(err) => ctx.fail(&*err),
        Ok(()) => {
            if let Err(e) = res.send_headers(0) {
                debug!(error = %e, "response not delivered");
            }
        }
    }
}

fn close(ctx: &Context) {
    if let Err(e) = ctx.response().close() {
        debug!(error = %e, "closing response writer");
    }
    ctx.release();
}

// ── Panic boundary ───────────────────────────────────────────────────────────

thread_local! {
    /// Trace of the latest panic raised on this thread.
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Chains the process panic hook with one that records where each panic was
/// raised. `Abort` is neither recorded nor reported.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<Abort>() {
                return;
            }
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

struct Panicked {
    payload: Box<dyn Any + Send>,
    trace: Option<Backtrace>,
}

/// Runs `chain` on the current task, catching a panic together with the
/// trace the hook recorded for it.
async fn guarded(chain: &Middleware, ctx: &Context) -> Result<Outcome, Panicked> {
    match AssertUnwindSafe(chain.call(ctx.clone())).catch_unwind().await {
        Ok(outcome) => Ok(outcome),
        // Still on the thread that panicked: the unwind ended inside this poll.
        Err(payload) => Err(Panicked {
            payload,
            trace: PANIC_TRACE.with(|slot| slot.borrow_mut().take()),
        }),
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    ///
    /// ```rust,no_run
    /// use cog::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr
            .parse()
            .unwrap_or_else(|e| panic!("invalid socket address {addr:?}: {e}"));
        Self { addr }
    }

    /// Starts accepting connections and dispatching them through `service`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, service: Service) -> io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, env = service.settings().env(), "cog listening");

        // Tracks every connection task so shutdown can wait for them.
        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown first, so a SIGTERM stops accepting even when more
                // connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let service = service.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
                            req.extensions_mut().insert(remote_addr);
                            let service = service.clone();
                            async move { service.handle(req).await }
                        });

                        // HTTP/1.1 or HTTP/2, whatever the client negotiates.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("cog stopped");
        Ok(())
    }
}

// ── Shutdown signal ──────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C. On Windows only Ctrl-C is
/// available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
