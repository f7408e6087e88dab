//! # cog
//!
//! The request-processing core of a middleware HTTP framework.
//!
//! A request becomes a [`Context`]; an ordered chain of middleware runs
//! against it; each member may finalize the one [`Response`] the request
//! owns or hand control to the next. Whatever happens along the way (an
//! error, a panic, a client that disconnects, a deadline), exactly one
//! well-formed response goes out.
//!
//! What the core owns:
//!
//! - **Write-once responses**: atomic test-and-set flags decide which of
//!   the handler path and the cancellation watcher finalizes the response
//! - **Composition**: ordered chains that short-circuit on failure or once
//!   the response ended
//! - **Routing**: radix-tree matching via [`matchit`], with redirects for
//!   trailing slashes and unclean paths, `405` with `Allow`, automatic
//!   `OPTIONS` and `HEAD`
//! - **Errors**: immutable templates, JSON bodies, pruned stack traces
//!
//! What it plugs in through narrow traits: body and query decoding
//! ([`parse`]), compression ([`compress`]), template rendering
//! ([`Renderer`]) and error observation ([`App::on_error`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cog::middleware::Logger;
//! use cog::{App, Context, Error, Outcome, Router};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let router = Router::new()
//!         .get("/users/:id", get_user)
//!         .post("/users",    create_user);
//!
//!     App::new()
//!         .use_handler(Logger::new())
//!         .use_handler(router)
//!         .listen("0.0.0.0:3000")
//!         .await
//! }
//!
//! async fn get_user(ctx: Context) -> Outcome {
//!     let id = ctx.param("id").unwrap_or_default();
//!     ctx.json(200, &serde_json::json!({ "id": id }))?;
//!     Ok(())
//! }
//!
//! async fn create_user(ctx: Context) -> Outcome {
//!     let user: serde_json::Value = ctx.parse_body()?;
//!     if user.get("name").is_none() {
//!         return Err(Error::UNPROCESSABLE_ENTITY.with_message("name is required").into());
//!     }
//!     ctx.set_header("location", "/users/99");
//!     ctx.json(201, &user)?;
//!     Ok(())
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

mod app;
mod context;
mod error;
mod handler;
mod lifetime;
mod response;
mod router;
mod server;

pub mod compress;
pub mod middleware;
pub mod parse;
pub mod status;
pub mod transport;

pub use app::{App, ErrorObserver, Renderer, Settings, SERVER_NAME};
pub use context::{Context, Key};
pub use error::{BoxError, Error, HttpError};
pub use handler::{BoxFuture, Handler, Middleware, Outcome};
pub use lifetime::{Lifetime, LifetimeError};
pub use response::{ContentType, Hook, Response};
pub use router::{Params, Router, RouterOptions};
pub use server::{Abort, Server, Service};

/// Locks `m`, taking the guard back from a poisoned mutex.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
