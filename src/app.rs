//! Application configuration.
//!
//! [`App`] collects settings and application middleware at startup. Every
//! setter validates eagerly and panics on a bad value, so misconfiguration
//! never surfaces at request time. [`App::into_service`] freezes the result
//! into an immutable, cloneable [`Service`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use serde_json::Value;

use crate::compress::Compressible;
use crate::context::Context;
use crate::error::Error;
use crate::handler::{Handler, Middleware};
use crate::middleware::compose;
use crate::parse::{BodyParser, DefaultBodyParser, DefaultUrlBinder, UrlBinder};
use crate::server::{Server, Service};

/// Default `Server` header.
pub const SERVER_NAME: &str = concat!("cog/", env!("CARGO_PKG_VERSION"));

/// Observer called with every normalized failure before the error body is
/// sent. It may respond itself; the default body is skipped when it does.
pub type ErrorObserver = dyn Fn(&Context, &Error) + Send + Sync;

/// Template rendering strategy used by [`Context::render`].
pub trait Renderer: Send + Sync + 'static {
    fn render(
        &self,
        ctx: &Context,
        out: &mut dyn io::Write,
        name: &str,
        data: &Value,
    ) -> Result<(), Error>;
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// Frozen application settings, shared read-only by every request.
pub struct Settings {
    env: String,
    server_name: Option<HeaderValue>,
    timeout: Option<Duration>,
    keys: Vec<String>,
    body_parser: Arc<dyn BodyParser>,
    url_binder: Arc<dyn UrlBinder>,
    compress: Option<Arc<dyn Compressible>>,
    renderer: Option<Arc<dyn Renderer>>,
    on_error: Option<Arc<ErrorObserver>>,
    values: HashMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_owned()),
            server_name: Some(HeaderValue::from_static(SERVER_NAME)),
            timeout: None,
            keys: Vec::new(),
            body_parser: Arc::new(DefaultBodyParser::default()),
            url_binder: Arc::new(DefaultUrlBinder),
            compress: None,
            renderer: None,
            on_error: None,
            values: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn env(&self) -> &str { &self.env }
    pub fn server_name(&self) -> Option<&HeaderValue> { self.server_name.as_ref() }
    pub fn timeout(&self) -> Option<Duration> { self.timeout }
    pub fn keys(&self) -> &[String] { &self.keys }
    pub fn body_parser(&self) -> &dyn BodyParser { &*self.body_parser }
    pub fn url_binder(&self) -> &dyn UrlBinder { &*self.url_binder }
    pub fn compress(&self) -> Option<&Arc<dyn Compressible>> { self.compress.as_ref() }
    pub fn renderer(&self) -> Option<&dyn Renderer> { self.renderer.as_deref() }
    pub fn on_error(&self) -> Option<&ErrorObserver> { self.on_error.as_deref() }

    /// A free-form value stored with [`App::set`].
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("env", &self.env)
            .field("server_name", &self.server_name)
            .field("timeout", &self.timeout)
            .field("keys", &self.keys.len())
            .field("max_body", &self.body_parser.max_bytes())
            .field("compress", &self.compress.is_some())
            .field("renderer", &self.renderer.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ── App ──────────────────────────────────────────────────────────────────────

/// The application builder.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use cog::{App, Context, Outcome, Router};
/// use cog::middleware::Logger;
///
/// async fn hello(ctx: Context) -> Outcome {
///     ctx.text(200, "hello")?;
///     Ok(())
/// }
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     App::new()
///         .timeout(Duration::from_secs(5))
///         .use_handler(Logger::new())
///         .use_handler(Router::new().get("/", hello))
///         .listen("0.0.0.0:3000")
///         .await
/// }
/// ```
pub struct App {
    settings: Settings,
    middleware: Vec<Middleware>,
}

impl App {
    /// Reads `APP_ENV` (default `development`) and seeds defaults: the
    /// `cog/<version>` server name, a 2 MiB JSON/form body parser and the
    /// inferring query binder.
    pub fn new() -> Self {
        Self { settings: Settings::default(), middleware: Vec::new() }
    }

    pub fn env(mut self, env: impl Into<String>) -> Self {
        self.settings.env = env.into();
        self
    }

    /// Sets the `Server` header. An empty name omits it.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid header value.
    pub fn server_name(mut self, name: &str) -> Self {
        self.settings.server_name = if name.is_empty() {
            None
        } else {
            match HeaderValue::from_str(name) {
                Ok(value) => Some(value),
                Err(_) => panic!("server name {name:?} is not a valid header value"),
            }
        };
        self
    }

    /// Deadline for every request. Zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Signing keys, newest first.
    ///
    /// # Panics
    ///
    /// Panics if the list or any key is empty.
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() || keys.iter().any(String::is_empty) {
            panic!("keys must be a non-empty list of non-empty keys");
        }
        self.settings.keys = keys;
        self
    }

    pub fn body_parser(mut self, parser: impl BodyParser) -> Self {
        self.settings.body_parser = Arc::new(parser);
        self
    }

    pub fn url_binder(mut self, binder: impl UrlBinder) -> Self {
        self.settings.url_binder = Arc::new(binder);
        self
    }

    /// Enables response compression with `rule`.
    pub fn compress(mut self, rule: impl Compressible) -> Self {
        self.settings.compress = Some(Arc::new(rule));
        self
    }

    pub fn renderer(mut self, renderer: impl Renderer) -> Self {
        self.settings.renderer = Some(Arc::new(renderer));
        self
    }

    pub fn on_error(mut self, observer: impl Fn(&Context, &Error) + Send + Sync + 'static) -> Self {
        self.settings.on_error = Some(Arc::new(observer));
        self
    }

    /// Stores a free-form value readable through [`Settings::get`].
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.values.insert(name.into(), value.into());
        self
    }

    /// Appends application middleware. Members run in registration order.
    pub fn use_handler(mut self, handler: impl Handler) -> Self {
        self.middleware.push(Middleware::new(handler));
        self
    }

    /// Freezes the configuration.
    pub fn into_service(self) -> Service {
        Service::new(Arc::new(self.settings), compose(self.middleware))
    }

    /// Serves the application on `addr` until SIGTERM or Ctrl-C.
    pub async fn listen(self, addr: &str) -> io::Result<()> {
        Server::bind(addr).serve(self.into_service()).await
    }
}

impl Default for App {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let app = App::new();
        let expected = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_owned());
        assert_eq!(app.settings.env(), expected);
        assert_eq!(app.settings.server_name().unwrap(), SERVER_NAME);
        assert_eq!(app.settings.body_parser().max_bytes(), 2 * 1024 * 1024);
        assert!(app.settings.timeout().is_none());
        assert!(app.settings.compress().is_none());
        assert!(app.settings.renderer().is_none());
    }

    #[test]
    fn test_setters() {
        let app = App::new()
            .env("production")
            .server_name("")
            .timeout(Duration::ZERO)
            .keys(["k2", "k1"])
            .set("region", "eu-west-1");
        assert_eq!(app.settings.env(), "production");
        assert!(app.settings.server_name().is_none());
        assert!(app.settings.timeout().is_none());
        assert_eq!(app.settings.keys(), ["k2", "k1"]);
        assert_eq!(app.settings.get("region"), Some(&Value::from("eu-west-1")));

        let app = App::new().timeout(Duration::from_millis(250));
        assert_eq!(app.settings.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn test_empty_key_panics() {
        let _ = App::new().keys(["k1", ""]);
    }

    #[test]
    #[should_panic(expected = "not a valid header value")]
    fn test_invalid_server_name_panics() {
        let _ = App::new().server_name("bad\nname");
    }
}
