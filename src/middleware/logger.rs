//! Request-completion logging.
//!
//! [`Logger`] seeds a per-request [`Log`] record through the context's
//! capability cache and emits it from a post-end hook, once the status line
//! is on the wire. Entries go to `tracing` at INFO with target
//! `cog::access`.
//!
//! The hook runs as soon as headers are sent, before a streamed body is
//! written, so `length` is the buffered body size: the body given to `end`,
//! `json`, `text` and friends. Streamed bodies report `0`.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{Map, Value};

use crate::context::{Context, Key};
use crate::error::Error;
use crate::handler::{BoxFuture, Handler};
use crate::lock;

/// Mutable key/value record for one request. Clones share the record.
#[derive(Clone)]
pub struct Log {
    fields: Arc<Mutex<Map<String, Value>>>,
    start: Instant,
}

impl Log {
    fn seed(ctx: &Context) -> Self {
        let mut fields = Map::new();
        fields.insert("ip".into(), ctx.ip().map(|ip| ip.to_string()).unwrap_or_default().into());
        fields.insert("method".into(), ctx.method().as_str().into());
        fields.insert("url".into(), ctx.uri().to_string().into());
        fields.insert("proto".into(), format!("{:?}", ctx.version()).into());
        fields.insert("user_agent".into(), ctx.header("user-agent").unwrap_or_default().into());
        Self { fields: Arc::new(Mutex::new(fields)), start: Instant::now() }
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.fields).insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.fields).get(key).cloned()
    }

    /// Snapshot of the record as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(lock(&self.fields).clone())
    }

    fn field(&self, key: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s,
            Some(v) => v.to_string(),
            None => "-".to_owned(),
        }
    }

    fn dev_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}B {}ms",
            self.field("ip"),
            self.field("method"),
            self.field("url"),
            self.field("proto"),
            self.field("status"),
            self.field("length"),
            self.field("time_ms"),
        )
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Log").field(&self.to_value()).finish()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Format {
    /// Compact line in development, JSON elsewhere.
    #[default]
    Auto,
    Json,
    Dev,
}

/// Access-log middleware.
///
/// ```rust
/// use cog::App;
/// use cog::middleware::Logger;
///
/// let app = App::new().use_handler(Logger::new());
/// # let _ = app;
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Logger {
    format: Format,
}

impl Logger {
    /// Formats by application environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always one JSON object per line.
    pub fn json() -> Self {
        Self { format: Format::Json }
    }

    /// Always the compact human-readable line.
    pub fn dev() -> Self {
        Self { format: Format::Dev }
    }

    /// The request's record, created on first access.
    pub fn from_ctx(ctx: &Context) -> Option<Log> {
        ctx.any(&Logger::default()).ok()
    }
}

impl Key for Logger {
    type Value = Log;

    fn compute(&self, ctx: &Context) -> Option<Result<Log, Error>> {
        Some(Ok(Log::seed(ctx)))
    }
}

impl Handler for Logger {
    fn call(&self, ctx: Context) -> BoxFuture {
        let dev = match self.format {
            Format::Auto => ctx.settings().env() == "development",
            Format::Json => false,
            Format::Dev  => true,
        };
        let logger = *self;
        Box::pin(async move {
            let log = ctx.any(&logger)?;
            ctx.on_end(move |res| {
                log.insert("status", res.status());
                // Buffered size only; streamed bytes are still in flight.
                log.insert("length", res.body().len());
                log.insert("time_ms", log.start.elapsed().as_millis() as u64);
                if dev {
                    tracing::info!(target: "cog::access", "{}", log.dev_line());
                } else {
                    tracing::info!(target: "cog::access", "{}", log.to_value());
                }
            });
            Ok(())
        })
    }
}
