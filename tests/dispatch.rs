//! End-to-end dispatch: a `Service` driven with in-memory requests.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cog::middleware::Logger;
use cog::{App, Context, Error, HttpError, Outcome, Service};
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use serde_json::Value;

fn request(method: &str, uri: &str) -> http::Request<Full<Bytes>> {
    http::Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn send(service: &Service, req: http::Request<Full<Bytes>>) -> (u16, HeaderMap, Bytes) {
    let res = service.handle(req).await.unwrap();
    let status = res.status().as_u16();
    let headers = res.headers().clone();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

fn json(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap()
}

async fn panics(_: Context) -> Outcome {
    panic!("handler exploded");
}

async fn hello(ctx: Context) -> Outcome {
    ctx.text(200, "hello")?;
    Ok(())
}

#[tokio::test]
async fn test_panic_becomes_500_json() {
    let service = App::new().use_handler(panics).into_service();

    let (status, headers, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 500);
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["content-type"], "application/json; charset=utf-8");
    let body = json(&body);
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(body["message"], "handler exploded");

    // The service survives and keeps answering.
    let service = App::new().use_handler(hello).into_service();
    let (status, _, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 200);
    assert_eq!(&body[..], b"hello");
}

static LATE_WRITE_ACCEPTED: AtomicUsize = AtomicUsize::new(0);

async fn slow(ctx: Context) -> Outcome {
    tokio::time::sleep(Duration::from_millis(150)).await;
    ctx.text(200, "too late")?;
    if ctx.response().header_written() && ctx.response().status() == 200 {
        LATE_WRITE_ACCEPTED.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
}

#[tokio::test]
async fn test_deadline_returns_504_and_drops_late_writes() {
    let service = App::new()
        .timeout(Duration::from_millis(30))
        .use_handler(slow)
        .into_service();

    let (status, _, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 504);
    let body = json(&body);
    assert_eq!(body["error"], "Gateway Timeout");
    assert_eq!(body["message"], "request deadline exceeded");
    assert_eq!(LATE_WRITE_ACCEPTED.load(Ordering::SeqCst), 0);
}

static AFTER_END: AtomicUsize = AtomicUsize::new(0);

async fn ends(ctx: Context) -> Outcome {
    ctx.end(202, "accepted")?;
    Ok(())
}

async fn must_not_run(_: Context) -> Outcome {
    AFTER_END.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[tokio::test]
async fn test_chain_short_circuits_after_end() {
    let service = App::new()
        .use_handler(ends)
        .use_handler(must_not_run)
        .use_handler(must_not_run)
        .into_service();

    let (status, _, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 202);
    assert_eq!(&body[..], b"accepted");
    assert_eq!(AFTER_END.load(Ordering::SeqCst), 0);
}

async fn not_found(_: Context) -> Outcome {
    Err(Error::NOT_FOUND.with_message("no such user").with_data(serde_json::json!({"id": 7})).into())
}

async fn forbidden_io(ctx: Context) -> Outcome {
    ctx.set_status(403);
    ctx.set_header("cache-control", "no-store");
    Err(std::io::Error::other("permission denied").into())
}

#[tokio::test]
async fn test_errors_render_as_json() {
    let service = App::new().use_handler(not_found).into_service();
    let (status, _, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 404);
    assert_eq!(
        json(&body),
        serde_json::json!({"error": "Not Found", "message": "no such user", "data": {"id": 7}})
    );

    let service = App::new().use_handler(forbidden_io).into_service();
    let (status, headers, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 403);
    assert!(headers.get("cache-control").is_none());
    assert_eq!(json(&body)["message"], "permission denied");
}

#[derive(Debug)]
struct Locked;

impl fmt::Display for Locked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("account locked")
    }
}

impl std::error::Error for Locked {}

impl HttpError for Locked {
    fn status(&self) -> u16 { 423 }
}

fn check_lock(name: &str) -> Result<(), Locked> {
    if name == "root" { Err(Locked) } else { Ok(()) }
}

fn open_account(name: &str) -> Result<(), Error> {
    check_lock(name)?;
    Ok(())
}

async fn locked(_: Context) -> Outcome {
    Err(Error::from(Locked).into())
}

async fn login(ctx: Context) -> Outcome {
    open_account(&ctx.query("user").unwrap_or_default())?;
    ctx.text(200, "welcome")?;
    Ok(())
}

#[tokio::test]
async fn test_errors_keep_their_own_status() {
    let service = App::new().use_handler(locked).into_service();
    let (status, _, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 423);
    assert_eq!(json(&body), serde_json::json!({"error": "Locked", "message": "account locked"}));

    let service = App::new().use_handler(login).into_service();
    let (status, _, _) = send(&service, request("POST", "/login?user=root")).await;
    assert_eq!(status, 423);
    let (status, _, body) = send(&service, request("POST", "/login?user=ada")).await;
    assert_eq!(status, 200);
    assert_eq!(&body[..], b"welcome");
}

async fn hangs_up(ctx: Context) -> Outcome {
    ctx.set_header("x-draft", "1");
    ctx.abort()
}

#[tokio::test]
async fn test_abort_drops_the_request_without_a_response() {
    let service = App::new().use_handler(hangs_up).into_service();
    let err = service.handle(request("GET", "/")).await.unwrap_err();
    assert_eq!(err.message(), "request aborted");

    let service = App::new().use_handler(hello).into_service();
    let (status, _, _) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 200);
}

async fn idle(_: Context) -> Outcome {
    Ok(())
}

#[tokio::test]
async fn test_unfinished_request_is_flagged() {
    let service = App::new().use_handler(idle).into_service();
    let (status, _, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 421);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_observer_may_respond_itself() {
    let service = App::new()
        .on_error(|ctx, err| {
            let _ = ctx.text(err.code(), format!("custom: {}", err.message()));
        })
        .use_handler(not_found)
        .into_service();

    let (status, headers, body) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 404);
    assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
    assert_eq!(&body[..], b"custom: no such user");
}

#[tokio::test]
async fn test_server_name_and_oversized_bodies() {
    let service = App::new()
        .server_name("edge/1")
        .body_parser(cog::parse::DefaultBodyParser::new(8))
        .use_handler(hello)
        .into_service();

    let (status, headers, _) = send(&service, request("GET", "/")).await;
    assert_eq!(status, 200);
    assert_eq!(headers["server"], "edge/1");

    let req = http::Request::post("/")
        .body(Full::new(Bytes::from_static(b"way more than eight bytes")))
        .unwrap();
    let (status, _, body) = send(&service, req).await;
    assert_eq!(status, 413);
    assert_eq!(json(&body)["error"], "Payload Too Large");
}

#[tokio::test]
async fn test_head_keeps_length_without_body() {
    let service = App::new().use_handler(hello).into_service();
    let (status, headers, body) = send(&service, request("HEAD", "/")).await;
    assert_eq!(status, 200);
    assert_eq!(headers["content-length"], "5");
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_compression_is_negotiated() {
    async fn big(ctx: Context) -> Outcome {
        ctx.text(200, "a".repeat(4096))?;
        Ok(())
    }

    let service = App::new()
        .compress(cog::compress::DefaultCompress)
        .use_handler(big)
        .into_service();

    let req = http::Request::get("/")
        .header("accept-encoding", "br, gzip;q=0.9")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(&service, req).await;
    assert_eq!(status, 200);
    assert_eq!(headers["content-encoding"], "gzip");
    assert_eq!(headers["vary"], "Accept-Encoding");
    assert!(headers.get("content-length").is_none());
    assert!(body.len() < 4096);

    let (_, headers, body) = send(&service, request("GET", "/")).await;
    assert!(headers.get("content-encoding").is_none());
    assert_eq!(body.len(), 4096);
}

#[tokio::test]
async fn test_logger_records_completion() {
    async fn tagged(ctx: Context) -> Outcome {
        if let Some(log) = Logger::from_ctx(&ctx) {
            log.insert("user", "ada");
        }
        ctx.end(204, "")?;
        Ok(())
    }

    let service = App::new()
        .use_handler(Logger::json())
        .use_handler(tagged)
        .into_service();
    let (status, _, _) = send(&service, request("DELETE", "/items/3")).await;
    assert_eq!(status, 204);
}
