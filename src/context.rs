//! Per-request context.
//!
//! A [`Context`] binds one request to its [`Response`], its [`Lifetime`]
//! and a private capability cache. It is a cheap handle: clones share the
//! same request, which is how middleware, the router and the dispatcher's
//! cancellation watcher all see one state.
//!
//! Terminal helpers ([`end`](Context::end), [`json`](Context::json),
//! [`redirect`](Context::redirect), …) are guarded by the response's `ended`
//! flag. The first caller wins; every later call is a silent `Ok(())`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, LOCATION, SERVER, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderMap, Method, Uri, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::app::Settings;
use crate::compress;
use crate::error::Error;
use crate::lifetime::{Lifetime, LifetimeError};
use crate::lock;
use crate::parse;
use crate::response::{ContentType, Response};
use crate::router::RouteParams;
use crate::status;
use crate::transport::ResponseWriter;

// ── Capability keys ──────────────────────────────────────────────────────────

/// A token for request-scoped data in the capability cache.
///
/// The key's type is the identity: two values of the same key type address
/// the same slot. A key that can build its value from the request overrides
/// [`compute`](Key::compute); [`Context::any`] then calls it once per request
/// and caches the result.
///
/// ```rust
/// use cog::{Context, Error, Key};
///
/// struct RequestId;
///
/// impl Key for RequestId {
///     type Value = String;
///
///     fn compute(&self, ctx: &Context) -> Option<Result<String, Error>> {
///         let id = ctx.header("x-request-id").unwrap_or("anonymous");
///         Some(Ok(id.to_owned()))
///     }
/// }
/// ```
pub trait Key: 'static {
    type Value: Clone + Send + Sync + 'static;

    /// `None` when the key cannot be computed, only stored with
    /// [`Context::set_any`].
    fn compute(&self, _ctx: &Context) -> Option<Result<Self::Value, Error>> {
        None
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Arc<Settings>,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    host: String,
    remote_addr: Option<SocketAddr>,
    res: Response,
    lifetime: Lifetime,
    cache: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Context {
    /// A context over an already-collected request, with default settings
    /// and no deadline. Useful for driving middleware against a
    /// [`Recorder`](crate::transport::Recorder).
    pub fn new(req: http::Request<Bytes>, writer: Box<dyn ResponseWriter>) -> Self {
        Self::build(Arc::new(Settings::default()), req, writer, Lifetime::new(None))
    }

    pub(crate) fn build(
        settings: Arc<Settings>,
        req: http::Request<Bytes>,
        writer: Box<dyn ResponseWriter>,
        lifetime: Lifetime,
    ) -> Self {
        let (parts, body) = req.into_parts();
        let remote_addr = parts.extensions.get::<SocketAddr>().copied();
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let res = Response::build(writer, parts.method == Method::HEAD);
        if let Some(name) = settings.server_name() {
            res.set_header(SERVER, name.clone());
        }

        Self {
            inner: Arc::new(Inner {
                settings,
                method: parts.method,
                uri: parts.uri,
                version: parts.version,
                headers: parts.headers,
                body,
                host,
                remote_addr,
                res,
                lifetime,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ── Request ──────────────────────────────────────────────────────────────

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn path(&self) -> &str {
        self.inner.uri.path()
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// A request header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The request's `Content-Type`.
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// Raw request body.
    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then
    /// the peer address.
    pub fn ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim);
        let real = self.header("x-real-ip").map(str::trim);
        forwarded
            .into_iter()
            .chain(real)
            .find_map(|s| s.parse().ok())
            .or_else(|| self.inner.remote_addr.map(|a| a.ip()))
    }

    /// First value of a query parameter.
    pub fn query(&self, name: &str) -> Option<String> {
        let query = self.inner.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// A path parameter captured by the router.
    pub fn param(&self, name: &str) -> Option<String> {
        let params = self.any(&RouteParams).ok()?;
        params.get(name).map(str::to_owned)
    }

    /// The best of `offers` according to `Accept-Encoding`.
    pub fn accept_encoding<'a>(&self, offers: &[&'a str]) -> Option<&'a str> {
        compress::negotiate(self.header("accept-encoding").unwrap_or(""), offers)
    }

    /// Decodes the body with the configured [`BodyParser`](crate::parse::BodyParser).
    ///
    /// Fails with 400 on an empty body, 413 above the parser's limit and 415
    /// on a media type outside JSON, XML and form encoding.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let parser = self.settings().body_parser();
        let body = &self.inner.body;
        if body.is_empty() {
            return Err(Error::BAD_REQUEST.with_message("request entity empty"));
        }
        if body.len() > parser.max_bytes() {
            return Err(Error::PAYLOAD_TOO_LARGE
                .with_message(format!("request entity exceeds {} bytes", parser.max_bytes())));
        }
        let (media, charset) = parse::media_type(self.content_type().unwrap_or(""));
        if !parse::is_supported(&media) {
            return Err(Error::UNSUPPORTED_MEDIA_TYPE
                .with_message(format!("unsupported media type: {media:?}")));
        }
        let value = parser.parse(body, &media, charset.as_deref())?;
        serde_json::from_value(value).map_err(|e| Error::BAD_REQUEST.from_cause(&e))
    }

    /// Decodes the query string with the configured [`UrlBinder`](crate::parse::UrlBinder).
    pub fn parse_query<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let values = parse::values(self.inner.uri.query().unwrap_or(""));
        let value = self.settings().url_binder().bind(&values)?;
        serde_json::from_value(value).map_err(|e| Error::BAD_REQUEST.from_cause(&e))
    }

    // ── Capabilities ─────────────────────────────────────────────────────────

    /// The value under `key`, computed on first access and cached for the
    /// rest of the request.
    ///
    /// Fails with `"non-existent key"` when nothing is cached and the key
    /// cannot compute itself.
    pub fn any<K: Key>(&self, key: &K) -> Result<K::Value, Error> {
        let id = TypeId::of::<K>();
        let cached = lock(&self.inner.cache)
            .get(&id)
            .and_then(|v| v.downcast_ref::<K::Value>())
            .cloned();
        if let Some(value) = cached {
            return Ok(value);
        }

        // Computed without the lock so keys may read other keys.
        let value = match key.compute(self) {
            Some(result) => result?,
            None => return Err(Error::DEFAULT.with_message("non-existent key")),
        };
        let mut cache = lock(&self.inner.cache);
        let stored = cache.entry(id).or_insert_with(|| Box::new(value.clone()));
        Ok(stored.downcast_ref::<K::Value>().cloned().unwrap_or(value))
    }

    /// Stores `value` under `key`, replacing any cached value.
    pub fn set_any<K: Key>(&self, _key: &K, value: K::Value) {
        lock(&self.inner.cache).insert(TypeId::of::<K>(), Box::new(value));
    }

    // ── Lifetime ─────────────────────────────────────────────────────────────

    /// Resolves once the request is cancelled or its deadline passes.
    pub async fn done(&self) {
        self.inner.lifetime.done().await;
    }

    /// Why the request's lifetime ended, `None` while it is live.
    pub fn err(&self) -> Option<LifetimeError> {
        self.inner.lifetime.err()
    }

    pub(crate) fn lifetime(&self) -> &Lifetime {
        &self.inner.lifetime
    }

    /// Releases the lifetime. The dispatcher calls this on every exit path.
    pub(crate) fn release(&self) {
        self.inner.lifetime.cancel();
    }

    // ── Response ─────────────────────────────────────────────────────────────

    pub fn response(&self) -> &Response {
        &self.inner.res
    }

    pub fn status(&self) -> u16 {
        self.inner.res.status()
    }

    pub fn set_status(&self, code: u16) {
        self.inner.res.set_status(code);
    }

    /// Sets a response header.
    pub fn set_header(&self, name: &str, value: &str) -> bool {
        self.inner.res.set_header(name, value)
    }

    /// Registers a hook run just before headers are sent, newest first.
    ///
    /// # Panics
    ///
    /// Panics if the response already ended.
    pub fn before_send(&self, hook: impl FnOnce(&Response) + Send + 'static) {
        if self.inner.res.ended() {
            panic!("before_send registered after the response ended");
        }
        self.inner.res.push_before_send(Box::new(hook));
    }

    /// Registers a hook run after headers are sent, newest first, off the
    /// response path.
    ///
    /// # Panics
    ///
    /// Panics if the response already ended.
    pub fn on_end(&self, hook: impl FnOnce(&Response) + Send + 'static) {
        if self.inner.res.ended() {
            panic!("on_end registered after the response ended");
        }
        self.inner.res.push_after_end(Box::new(hook));
    }

    /// Aborts the request. The connection is dropped without a response.
    pub fn abort(&self) -> ! {
        std::panic::panic_any(crate::server::Abort)
    }

    // ── Terminal operations ──────────────────────────────────────────────────

    /// Ends the response with `code` and `body`.
    pub fn end(&self, code: u16, body: impl Into<Bytes>) -> Result<(), Error> {
        if !self.inner.res.try_end() {
            return Ok(());
        }
        self.inner.res.respond(code, body).map_err(io_error)
    }

    pub fn text(&self, code: u16, body: impl Into<String>) -> Result<(), Error> {
        let body: String = body.into();
        self.send(code, ContentType::Text, Bytes::from(body))
    }

    pub fn html(&self, code: u16, body: impl Into<Bytes>) -> Result<(), Error> {
        self.send(code, ContentType::Html, body.into())
    }

    pub fn json<T: Serialize + ?Sized>(&self, code: u16, value: &T) -> Result<(), Error> {
        let body = serde_json::to_vec(value).map_err(|e| Error::INTERNAL_SERVER_ERROR.from_cause(&e))?;
        self.json_blob(code, body)
    }

    /// Sends already-encoded JSON.
    pub fn json_blob(&self, code: u16, body: impl Into<Bytes>) -> Result<(), Error> {
        self.send(code, ContentType::Json, body.into())
    }

    /// Redirects to `location`. The status stays when it is already a
    /// redirect code, otherwise it becomes 302.
    pub fn redirect(&self, location: &str) -> Result<(), Error> {
        if !self.inner.res.try_end() {
            return Ok(());
        }
        let res = &self.inner.res;
        let code = match res.status() {
            code if status::is_redirect(code) => code,
            _ => 302,
        };
        if !res.set_header(LOCATION, location) {
            return Err(Error::INTERNAL_SERVER_ERROR.with_message("invalid redirect location"));
        }
        let body = if matches!(*self.method(), Method::GET | Method::HEAD) {
            res.set_header(CONTENT_TYPE, ContentType::Html.as_str());
            let text = status::text(code).unwrap_or("Found");
            format!("<a href=\"{}\">{text}</a>.\n", escape_html(location))
        } else {
            String::new()
        };
        res.respond(code, body).map_err(io_error)
    }

    /// Streams `reader` as the body. Headers go out first, chunks follow as
    /// they are read.
    pub async fn stream<R>(&self, code: u16, content_type: &str, mut reader: R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        let res = &self.inner.res;
        if !res.try_end() {
            return Ok(());
        }
        res.set_header(CONTENT_TYPE, content_type);
        res.send_headers(code).map_err(io_error)?;

        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = reader.read(&mut buf).await.map_err(io_error)?;
            if n == 0 {
                return Ok(());
            }
            res.write(&buf[..n]).map_err(io_error)?;
        }
    }

    /// Renders template `name` with the configured
    /// [`Renderer`](crate::app::Renderer) and sends it as HTML.
    pub fn render<T: Serialize + ?Sized>(&self, code: u16, name: &str, data: &T) -> Result<(), Error> {
        let Some(renderer) = self.settings().renderer() else {
            return Err(Error::INTERNAL_SERVER_ERROR.with_message("renderer not registered"));
        };
        let data = serde_json::to_value(data).map_err(|e| Error::INTERNAL_SERVER_ERROR.from_cause(&e))?;
        let mut out = Vec::new();
        renderer.render(self, &mut out, name, &data)?;
        self.html(code, out)
    }

    /// Replaces whatever the request built so far with an error response.
    ///
    /// Pending pre-write hooks are dropped, headers are reset to the safe
    /// allow-list, `err` is normalized into an [`Error`] and handed to the
    /// application's error observer, which may respond itself. Otherwise a
    /// JSON error body goes out. A no-op once headers are sent.
    pub fn fail(&self, err: &(dyn std::error::Error + 'static)) {
        let res = &self.inner.res;
        if res.header_written() {
            return;
        }
        res.clear_before_send();
        res.reset_headers(None);

        let err = Error::parse(err, res.status());
        if let Some(observer) = self.settings().on_error() {
            observer(self, &err);
        }
        self.respond_error(&err);
    }

    /// Sends `err` as the JSON error body unless headers are already out.
    pub(crate) fn respond_error(&self, err: &Error) {
        let res = &self.inner.res;
        if res.header_written() {
            return;
        }
        let code = if status::is_valid(err.code()) { err.code() } else { 500 };
        if code == 500 || code > 501 || code < 400 {
            tracing::error!(code, error = %err, stack = err.stack().unwrap_or(""), "request failed");
        }
        res.set_header(CONTENT_TYPE, ContentType::Json.as_str());
        res.set_header(X_CONTENT_TYPE_OPTIONS, "nosniff");
        if let Err(e) = res.respond(code, err.to_json()) {
            tracing::debug!(error = %e, "error response not delivered");
        }
    }

    fn send(&self, code: u16, content_type: ContentType, body: Bytes) -> Result<(), Error> {
        let res = &self.inner.res;
        if !res.try_end() {
            return Ok(());
        }
        res.set_header(CONTENT_TYPE, content_type.as_str());
        res.respond(code, body).map_err(io_error)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("status", &self.inner.res.status())
            .field("ended", &self.inner.res.ended())
            .finish()
    }
}

fn io_error(err: io::Error) -> Error {
    Error::INTERNAL_SERVER_ERROR.from_cause(&err)
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&'  => out.push_str("&amp;"),
            '<'  => out.push_str("&lt;"),
            '>'  => out.push_str("&gt;"),
            '"'  => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c    => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::transport::Recorder;

    fn request(method: &str, uri: &str) -> http::request::Builder {
        http::Request::builder().method(method).uri(uri)
    }

    fn ctx_for(req: http::Request<Bytes>) -> (Context, Recorder) {
        let rec = Recorder::new();
        (Context::new(req, Box::new(rec.clone())), rec)
    }

    fn get(uri: &str) -> (Context, Recorder) {
        ctx_for(request("GET", uri).body(Bytes::new()).unwrap())
    }

    struct Counted;

    static COMPUTED: AtomicUsize = AtomicUsize::new(0);

    impl Key for Counted {
        type Value = usize;

        fn compute(&self, _: &Context) -> Option<Result<usize, Error>> {
            Some(Ok(COMPUTED.fetch_add(1, Ordering::SeqCst) + 100))
        }
    }

    struct Stored;

    impl Key for Stored {
        type Value = String;
    }

    #[test]
    fn test_any_computes_once_per_request() {
        let (ctx, _) = get("/");
        let first = ctx.any(&Counted).unwrap();
        let again = ctx.any(&Counted).unwrap();
        assert_eq!(first, again);

        let (other, _) = get("/");
        assert_ne!(other.any(&Counted).unwrap(), first);
    }

    #[test]
    fn test_any_unknown_key_fails() {
        let (ctx, _) = get("/");
        let err = ctx.any(&Stored).unwrap_err();
        assert_eq!(err.message(), "non-existent key");

        ctx.set_any(&Stored, "kept".to_owned());
        assert_eq!(ctx.any(&Stored).unwrap(), "kept");
    }

    #[test]
    fn test_end_is_idempotent() {
        let (ctx, rec) = get("/");
        ctx.end(201, "first").unwrap();
        ctx.end(500, "second").unwrap();
        ctx.redirect("/elsewhere").unwrap();
        ctx.fail(&Error::BAD_REQUEST);

        let snap = rec.snapshot();
        assert_eq!(snap.header_writes, 1);
        assert_eq!(snap.status, Some(http::StatusCode::CREATED));
        assert_eq!(snap.body, b"first");
    }

    #[test]
    fn test_fail_renders_json_and_resets_headers() {
        let (ctx, rec) = get("/");
        ctx.set_header("cache-control", "max-age=60");
        ctx.set_header("access-control-allow-origin", "*");
        ctx.before_send(|res| res.set_status(200));

        ctx.fail(&Error::NOT_FOUND.with_message("no such user"));

        assert_eq!(rec.status(), Some(404));
        assert_eq!(rec.header("x-content-type-options").as_deref(), Some("nosniff"));
        assert_eq!(rec.header("content-type").as_deref(), Some(ContentType::Json.as_str()));
        assert!(rec.header("cache-control").is_none());
        assert_eq!(rec.header("access-control-allow-origin").as_deref(), Some("*"));
        let body: serde_json::Value = serde_json::from_slice(&rec.body()).unwrap();
        assert_eq!(body, serde_json::json!({"error": "Not Found", "message": "no such user"}));
    }

    #[test]
    fn test_fail_adopts_failure_status_for_foreign_errors() {
        let (ctx, rec) = get("/");
        ctx.set_status(403);
        ctx.fail(&io::Error::other("denied"));
        assert_eq!(rec.status(), Some(403));
    }

    #[test]
    fn test_redirect_defaults_to_found() {
        let (ctx, rec) = get("/old");
        ctx.redirect("/new?a=1&b=2").unwrap();
        assert_eq!(rec.status(), Some(302));
        assert_eq!(rec.header("location").as_deref(), Some("/new?a=1&b=2"));
        assert_eq!(
            String::from_utf8(rec.body()).unwrap(),
            "<a href=\"/new?a=1&amp;b=2\">Found</a>.\n"
        );

        let (ctx, rec) = ctx_for(request("POST", "/old").body(Bytes::new()).unwrap());
        ctx.set_status(308);
        ctx.redirect("/new").unwrap();
        assert_eq!(rec.status(), Some(308));
        assert!(rec.body().is_empty());
    }

    #[test]
    #[should_panic(expected = "on_end registered after the response ended")]
    fn test_on_end_after_end_panics() {
        let (ctx, _) = get("/");
        ctx.end(204, "").unwrap();
        ctx.on_end(|_| {});
    }

    #[test]
    fn test_request_accessors() {
        let req = request("GET", "/search?q=rust&page=2&q=go")
            .header("host", "example.com")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Bytes::new())
            .unwrap();
        let (ctx, _) = ctx_for(req);
        assert_eq!(ctx.path(), "/search");
        assert_eq!(ctx.host(), "example.com");
        assert_eq!(ctx.query("q").as_deref(), Some("rust"));
        assert_eq!(ctx.query("missing"), None);
        assert_eq!(ctx.ip(), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_head_requests_suppress_the_body() {
        let (ctx, rec) = ctx_for(request("HEAD", "/").body(Bytes::new()).unwrap());
        ctx.text(200, "hello").unwrap();
        assert_eq!(rec.header("content-length").as_deref(), Some("5"));
        assert!(rec.body().is_empty());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Login {
        user: String,
        remember: bool,
    }

    #[test]
    fn test_parse_body_json_xml_and_form() {
        let req = request("POST", "/")
            .header("content-type", "application/json; charset=utf-8")
            .body(Bytes::from_static(br#"{"user":"ada","remember":true}"#))
            .unwrap();
        let (ctx, _) = ctx_for(req);
        let login: Login = ctx.parse_body().unwrap();
        assert_eq!(login, Login { user: "ada".into(), remember: true });

        let req = request("POST", "/")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Bytes::from_static(b"user=ada&remember=true"))
            .unwrap();
        let (ctx, _) = ctx_for(req);
        let login: Login = ctx.parse_body().unwrap();
        assert_eq!(login.user, "ada");

        let req = request("POST", "/")
            .header("content-type", "application/xml")
            .body(Bytes::from_static(b"<login><user>ada</user><remember>true</remember></login>"))
            .unwrap();
        let (ctx, _) = ctx_for(req);
        let login: Login = ctx.parse_body().unwrap();
        assert_eq!(login, Login { user: "ada".into(), remember: true });
    }

    #[test]
    fn test_parse_body_failures() {
        let (ctx, _) = get("/");
        assert_eq!(ctx.parse_body::<Login>().unwrap_err().code(), 400);

        let req = request("POST", "/")
            .header("content-type", "text/csv")
            .body(Bytes::from_static(b"a,b"))
            .unwrap();
        let (ctx, _) = ctx_for(req);
        assert_eq!(ctx.parse_body::<Login>().unwrap_err().code(), 415);

        let req = request("POST", "/")
            .header("content-type", "application/json")
            .body(Bytes::from_static(b"{\"user\":1}"))
            .unwrap();
        let (ctx, _) = ctx_for(req);
        assert_eq!(ctx.parse_body::<Login>().unwrap_err().code(), 400);
    }

    #[derive(Debug, Deserialize)]
    struct Page {
        page: u32,
        tags: Vec<String>,
    }

    #[test]
    fn test_parse_query() {
        let (ctx, _) = get("/?page=3&tags=a&tags=b");
        let page: Page = ctx.parse_query().unwrap();
        assert_eq!(page.page, 3);
        assert_eq!(page.tags, ["a", "b"]);
    }

    #[test]
    fn test_render_without_renderer_fails() {
        let (ctx, rec) = get("/");
        let err = ctx.render(200, "index", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.message(), "renderer not registered");
        assert_eq!(rec.snapshot().header_writes, 0);
    }

    #[tokio::test]
    async fn test_stream_copies_reader() {
        let (ctx, rec) = get("/");
        let data: &[u8] = b"streamed bytes";
        ctx.stream(200, "text/plain", data).await.unwrap();
        assert_eq!(rec.body(), data);
        assert!(rec.header("content-length").is_none());
    }
}
