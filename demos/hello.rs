//! Minimal cog application: JSON endpoints, an access log and compression.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example hello
//!
//! Try:
//!   curl -i http://localhost:3000/users/42
//!   curl -i http://localhost:3000/users/42/          (301 to /users/42)
//!   curl -i -X DELETE http://localhost:3000/users/42 (405, Allow: GET, HEAD, POST)
//!   curl -i -X POST http://localhost:3000/users/42 \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -i http://localhost:3000/slow               (504 after one second)
//!   curl -i http://localhost:3000/boom               (500 JSON, server keeps running)

use std::time::Duration;

use cog::compress::DefaultCompress;
use cog::middleware::Logger;
use cog::{App, Context, Error, Outcome, Router};
use serde::Deserialize;

#[derive(Deserialize)]
struct UpdateUser {
    name: String,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let router = Router::new()
        .get("/users/:id",  get_user)
        .post("/users/:id", update_user)
        .get("/slow",       slow)
        .get("/boom",       boom);

    App::new()
        .timeout(Duration::from_secs(1))
        .compress(DefaultCompress)
        .on_error(|ctx, err| {
            if err.code() >= 500 {
                tracing::warn!(path = ctx.path(), code = err.code(), "request failed");
            }
        })
        .use_handler(Logger::new())
        .use_handler(router)
        .listen("0.0.0.0:3000")
        .await
}

// GET /users/:id
async fn get_user(ctx: Context) -> Outcome {
    let id = ctx.param("id").unwrap_or_default();
    ctx.json(200, &serde_json::json!({ "id": id, "name": "alice" }))?;
    Ok(())
}

// POST /users/:id
async fn update_user(ctx: Context) -> Outcome {
    let input: UpdateUser = ctx.parse_body()?;
    if input.name.is_empty() {
        return Err(Error::UNPROCESSABLE_ENTITY.with_message("name must not be empty").into());
    }
    if let Some(log) = Logger::from_ctx(&ctx) {
        log.insert("user", input.name.clone());
    }
    ctx.json(200, &serde_json::json!({ "id": ctx.param("id"), "name": input.name }))?;
    Ok(())
}

// GET /slow: outlives the one-second timeout; the late write is dropped.
async fn slow(ctx: Context) -> Outcome {
    tokio::time::sleep(Duration::from_secs(2)).await;
    ctx.text(200, "too late")?;
    Ok(())
}

// GET /boom
async fn boom(_: Context) -> Outcome {
    panic!("something broke");
}
