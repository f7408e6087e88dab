//! Middleware composition and the built-in middleware.
//!
//! [`compose`] reduces an ordered list of middleware to one. The result runs
//! members in order and stops at the first one that fails or that ends the
//! response:
//!
//! ```rust
//! use cog::middleware::compose;
//! use cog::{Context, Middleware, Outcome};
//!
//! async fn auth(ctx: Context) -> Outcome {
//!     if ctx.header("authorization").is_none() {
//!         ctx.end(401, "")?;
//!     }
//!     Ok(())
//! }
//!
//! async fn hello(ctx: Context) -> Outcome {
//!     ctx.text(200, "hello")?;
//!     Ok(())
//! }
//!
//! let chain = compose(vec![Middleware::new(auth), Middleware::new(hello)]);
//! # let _ = chain;
//! ```

mod logger;

pub use logger::{Log, Logger};

use std::sync::Arc;

use crate::context::Context;
use crate::handler::{BoxFuture, Handler, Middleware, Outcome};

/// Builds one middleware out of `members`.
///
/// - no members: a no-op that always succeeds,
/// - one member: that member, unchanged,
/// - otherwise a chain with short-circuit semantics.
pub fn compose(members: Vec<Middleware>) -> Middleware {
    match members.len() {
        0 => Middleware::new(noop),
        1 => members.into_iter().next().unwrap_or_else(|| Middleware::new(noop)),
        _ => Middleware::new(Chain(members.into())),
    }
}

async fn noop(_: Context) -> Outcome {
    Ok(())
}

struct Chain(Arc<[Middleware]>);

impl Handler for Chain {
    fn call(&self, ctx: Context) -> BoxFuture {
        let members = Arc::clone(&self.0);
        Box::pin(async move {
            for member in members.iter() {
                member.call(ctx.clone()).await?;
                if ctx.response().ended() {
                    break;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;
    use crate::transport::Recorder;

    fn ctx() -> (Context, Recorder) {
        let rec = Recorder::new();
        let req = http::Request::get("/").body(bytes::Bytes::new()).unwrap();
        (Context::new(req, Box::new(rec.clone())), rec)
    }

    /// Records which members ran under a per-context key.
    struct Trace;

    impl crate::context::Key for Trace {
        type Value = Arc<Mutex<Vec<&'static str>>>;

        fn compute(&self, _: &Context) -> Option<Result<Self::Value, Error>> {
            Some(Ok(Arc::default()))
        }
    }

    fn visit(ctx: &Context, name: &'static str) {
        ctx.any(&Trace).unwrap().lock().unwrap().push(name);
    }

    fn visited(ctx: &Context) -> Vec<&'static str> {
        ctx.any(&Trace).unwrap().lock().unwrap().clone()
    }

    async fn a(ctx: Context) -> Outcome {
        visit(&ctx, "a");
        Ok(())
    }

    async fn b(ctx: Context) -> Outcome {
        visit(&ctx, "b");
        Ok(())
    }

    async fn c(ctx: Context) -> Outcome {
        visit(&ctx, "c");
        Ok(())
    }

    async fn ends(ctx: Context) -> Outcome {
        visit(&ctx, "ends");
        ctx.end(200, "done")?;
        Ok(())
    }

    async fn fails(ctx: Context) -> Outcome {
        visit(&ctx, "fails");
        Err(Error::CONFLICT.with_message("taken").into())
    }

    #[tokio::test]
    async fn test_members_run_in_order() {
        let (ctx, _) = ctx();
        let chain = compose(vec![Middleware::new(a), Middleware::new(b), Middleware::new(c)]);
        chain.call(ctx.clone()).await.unwrap();
        assert_eq!(visited(&ctx), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_ended_response_short_circuits() {
        let (ctx, rec) = ctx();
        let chain = compose(vec![Middleware::new(ends), Middleware::new(b), Middleware::new(c)]);
        chain.call(ctx.clone()).await.unwrap();
        assert_eq!(visited(&ctx), ["ends"]);
        assert_eq!(rec.status(), Some(200));
    }

    #[tokio::test]
    async fn test_first_failure_propagates() {
        let (ctx, _) = ctx();
        let chain = compose(vec![Middleware::new(a), Middleware::new(fails), Middleware::new(c)]);
        let err = chain.call(ctx.clone()).await.unwrap_err();
        let err = err.downcast_ref::<Error>().unwrap();
        assert_eq!(err.code(), 409);
        assert_eq!(visited(&ctx), ["a", "fails"]);
    }

    #[tokio::test]
    async fn test_empty_composition_is_noop() {
        let (ctx, rec) = ctx();
        compose(Vec::new()).call(ctx.clone()).await.unwrap();
        assert!(!ctx.response().ended());
        assert_eq!(rec.snapshot().header_writes, 0);
    }

    #[test]
    fn test_single_member_is_returned_unchanged() {
        let only = Middleware::new(a);
        let composed = compose(vec![only.clone()]);
        assert!(composed.ptr_eq(&only));
    }

    #[tokio::test]
    async fn test_nested_chains_share_short_circuit() {
        let (ctx, _) = ctx();
        let inner = compose(vec![Middleware::new(a), Middleware::new(ends)]);
        let outer = compose(vec![inner, Middleware::new(c)]);
        outer.call(ctx.clone()).await.unwrap();
        assert_eq!(visited(&ctx), ["a", "ends"]);
    }
}
