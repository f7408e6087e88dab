//! Handler trait and type erasure.
//!
//! # How middleware is stored
//!
//! A chain holds middleware of *different* concrete types: plain `async fn`s,
//! a [`Router`](crate::Router), a [`Logger`](crate::middleware::Logger), a
//! composed chain. Collections hold one type, so every member is erased
//! behind `Arc<dyn Handler>` and wrapped in a [`Middleware`] handle:
//!
//! ```text
//! async fn hello(ctx: Context) -> Outcome { … }    ← user writes this
//!        ↓ Middleware::new(hello)
//! Arc::new(hello) as Arc<dyn Handler>              ← blanket impl below
//!        ↓
//! middleware.call(ctx)  at request time            ← one vtable dispatch
//!        ↓
//! Box::pin(hello(ctx))                             ← BoxFuture
//! ```
//!
//! Per request this costs one `Arc` clone of the context and one boxed
//! future per member that runs.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::BoxError;

// ── Types ─────────────────────────────────────────────────────────────────────

/// What a middleware returns. `Err` stops the chain; the dispatcher turns it
/// into an error response unless something was already sent.
///
/// The response status comes from a [`cog::Error`](crate::Error) in the
/// failure's source chain. Domain errors implementing
/// [`HttpError`](crate::HttpError) keep their status when converted with
/// `Error::from` before they are boxed; `?` on them directly erases it and
/// they surface as 500.
pub type Outcome = Result<(), BoxError>;

/// A heap-allocated, type-erased middleware future.
pub type BoxFuture = Pin<Box<dyn Future<Output = Outcome> + Send + 'static>>;

// ── Handler ──────────────────────────────────────────────────────────────────

/// One unit of request processing.
///
/// Satisfied automatically by any function with the signature:
///
/// ```text
/// async fn name(ctx: Context) -> Outcome
/// ```
///
/// Implement it by hand for stateful middleware; [`Router`](crate::Router)
/// and [`Logger`](crate::middleware::Logger) do.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture {
        Box::pin((self)(ctx))
    }
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// A shared, type-erased [`Handler`]. Cloning is one atomic increment.
#[derive(Clone)]
pub struct Middleware(pub(crate) Arc<dyn Handler>);

impl Middleware {
    pub fn new(handler: impl Handler) -> Self {
        Self(Arc::new(handler))
    }

    /// `true` when both handles point at the same handler.
    pub fn ptr_eq(&self, other: &Middleware) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Handler for Middleware {
    fn call(&self, ctx: Context) -> BoxFuture {
        self.0.call(ctx)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Middleware")
    }
}
