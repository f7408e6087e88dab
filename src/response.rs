//! The per-request response state machine.
//!
//! ```text
//! Fresh ──set_status / set_header / before_send──▶ HeadersPending
//!   │                                                  │
//!   │                      send_headers / write / respond
//!   │                                                  ▼
//!   └──────────── mark_ended (cancellation) ──────▶ Ended ◀── HeadersSent
//! ```
//!
//! Two one-way flags drive it. `header_written` is a test-and-set: exactly
//! one caller runs the pre-write hooks and hands the status line to the
//! transport, every other caller is a no-op. `ended` closes the response to
//! new writers; the request's cancellation watcher may flip it without ever
//! sending a byte.
//!
//! A response is a cheap handle. Clones share the same state, which is how
//! post-end hooks get to run on another thread.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, VARY};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use regex::Regex;

use crate::lock;
use crate::status;
use crate::transport::ResponseWriter;

/// Callback run around header transmission.
pub type Hook = Box<dyn FnOnce(&Response) + Send + 'static>;

/// Headers that survive [`Response::reset_headers`] by default: content
/// negotiation, method and retry hints, CORS and rate-limit headers.
static KEEP_ON_RESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:accept|allow|retry-after|warning|vary|server|access-control-|x-ratelimit-)")
        .expect("static header pattern")
});

// ── ContentType ───────────────────────────────────────────────────────────────

/// Content types the framework itself emits or parses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Form,        // application/x-www-form-urlencoded
    Html,        // text/html; charset=utf-8
    Json,        // application/json; charset=utf-8
    OctetStream, // application/octet-stream
    Text,        // text/plain; charset=utf-8
    Xml,         // application/xml; charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Form        => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json; charset=utf-8",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml; charset=utf-8",
        }
    }

    /// Media type without parameters.
    pub fn essence(self) -> &'static str {
        let full = self.as_str();
        full.split(';').next().unwrap_or(full)
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// The single authoritative response of one request.
#[derive(Clone)]
pub struct Response {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    writer: Mutex<Option<Box<dyn ResponseWriter>>>,
    header_written: AtomicBool,
    ended: AtomicBool,
    /// `HEAD` requests: headers are computed for the full body, bytes are dropped.
    suppress_body: bool,
}

struct State {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    /// The whole body is known up front, so `content-length` can be set.
    buffered: bool,
    /// Set once the pre-write hooks ran; status and headers are final.
    frozen: bool,
    before_send: Vec<Hook>,
    after_end: Vec<Hook>,
}

impl Response {
    pub fn new(writer: Box<dyn ResponseWriter>) -> Self {
        Self::build(writer, false)
    }

    pub(crate) fn build(writer: Box<dyn ResponseWriter>, suppress_body: bool) -> Self {
        let state = State {
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            buffered: false,
            frozen: false,
            before_send: Vec::new(),
            after_end: Vec::new(),
        };
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(state),
                writer: Mutex::new(Some(writer)),
                header_written: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                suppress_body,
            }),
        }
    }

    // ── Flags ────────────────────────────────────────────────────────────────

    pub fn header_written(&self) -> bool {
        self.inner.header_written.load(Ordering::Acquire)
    }

    pub fn ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Claims the right to finalize. `true` for exactly one caller.
    pub(crate) fn try_end(&self) -> bool {
        !self.inner.ended.swap(true, Ordering::AcqRel)
    }

    /// Closes the response to new writers without sending anything.
    pub(crate) fn mark_ended(&self) {
        self.inner.ended.store(true, Ordering::Release);
    }

    // ── Status, headers, body ────────────────────────────────────────────────

    /// The current status; `0` until someone sets one.
    pub fn status(&self) -> u16 {
        lock(&self.inner.state).status
    }

    /// Ignored once headers are final.
    pub fn set_status(&self, code: u16) {
        self.mutate(|s| s.status = code);
    }

    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.inner.state)
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    pub fn headers(&self) -> HeaderMap {
        lock(&self.inner.state).headers.clone()
    }

    /// Replaces a header. Returns `false` when the name or value is invalid or
    /// headers are already final.
    pub fn set_header<K, V>(&self, name: K, value: V) -> bool
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        let (Ok(name), Ok(value)) = (
            TryInto::<HeaderName>::try_into(name),
            TryInto::<HeaderValue>::try_into(value),
        ) else {
            return false;
        };
        self.mutate(|s| {
            s.headers.insert(name, value);
        })
        .is_some()
    }

    /// Adds a header value next to existing ones.
    pub fn append_header<K, V>(&self, name: K, value: V) -> bool
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        let (Ok(name), Ok(value)) = (
            TryInto::<HeaderName>::try_into(name),
            TryInto::<HeaderValue>::try_into(value),
        ) else {
            return false;
        };
        self.mutate(|s| {
            s.headers.append(name, value);
        })
        .is_some()
    }

    pub fn remove_header(&self, name: &str) {
        self.mutate(|s| {
            s.headers.remove(name);
        });
    }

    /// Adds `field` to `Vary` unless it is already listed.
    pub fn vary(&self, field: &str) {
        self.mutate(|s| {
            let listed = s.headers.get_all(VARY).iter().any(|v| {
                v.to_str()
                    .map(|v| v.split(',').any(|f| f.trim().eq_ignore_ascii_case(field)))
                    .unwrap_or(false)
            });
            if !listed {
                if let Ok(value) = HeaderValue::from_str(field) {
                    s.headers.append(VARY, value);
                }
            }
        });
    }

    pub fn content_type(&self) -> Option<String> {
        self.header(CONTENT_TYPE.as_str())
    }

    pub fn body(&self) -> Bytes {
        lock(&self.inner.state).body.clone()
    }

    /// Ignored once headers are final.
    pub fn set_body(&self, body: impl Into<Bytes>) {
        let body = body.into();
        self.mutate(|s| s.body = body);
    }

    /// Deletes every header whose name does not match `keep` (default: the
    /// negotiation, CORS and rate-limit allow-list). Used when a failure
    /// replaces whatever earlier middleware had started to build.
    pub fn reset_headers(&self, keep: Option<&Regex>) {
        let keep = keep.unwrap_or(&KEEP_ON_RESET);
        self.mutate(|s| {
            let doomed: Vec<HeaderName> = s
                .headers
                .keys()
                .filter(|name| !keep.is_match(name.as_str()))
                .cloned()
                .collect();
            for name in doomed {
                s.headers.remove(&name);
            }
        });
    }

    // ── Hooks ────────────────────────────────────────────────────────────────

    pub(crate) fn push_before_send(&self, hook: Hook) {
        lock(&self.inner.state).before_send.push(hook);
    }

    pub(crate) fn push_after_end(&self, hook: Hook) {
        lock(&self.inner.state).after_end.push(hook);
    }

    pub(crate) fn clear_before_send(&self) {
        lock(&self.inner.state).before_send.clear();
    }

    // ── Transmission ─────────────────────────────────────────────────────────

    /// Commits the status line and headers.
    ///
    /// A no-op for every caller but the first. The winner marks the response
    /// ended, applies `code` when positive, runs the pre-write hooks in LIFO
    /// order, coerces an invalid status (200 with a body, 421 without),
    /// drops the body of empty-body statuses and hands everything to the
    /// transport. Post-end hooks then run in LIFO order on a blocking worker.
    pub fn send_headers(&self, code: u16) -> io::Result<()> {
        self.commit(code, None).map(|_| ())
    }

    /// Writes body bytes, committing headers first with a default 200.
    ///
    /// Once the response has ended without headers ever being sent (the
    /// request was cancelled or lost a finalization race), writes are
    /// dropped and report `0` bytes.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.header_written() {
            if self.ended() {
                return Ok(0);
            }
            let code = if status::is_valid(self.status()) { 0 } else { StatusCode::OK.as_u16() };
            self.commit(code, None)?;
        }
        self.write_body(buf)
    }

    /// Sets the body, commits headers with `code` and writes the body.
    ///
    /// Every terminal operation (end, JSON, HTML, redirect, error) goes
    /// through here. Losing the commit race leaves the response untouched.
    pub fn respond(&self, code: u16, body: impl Into<Bytes>) -> io::Result<()> {
        if !self.commit(code, Some(body.into()))? {
            return Ok(());
        }
        let body = self.body();
        if !body.is_empty() {
            self.write_body(&body)?;
        }
        Ok(())
    }

    /// Releases the transport. Further writes fail.
    pub fn close(&self) -> io::Result<()> {
        let writer = lock(&self.inner.writer).take();
        match writer {
            Some(mut w) => w.close(),
            None => Ok(()),
        }
    }

    pub(crate) fn wrap_writer(
        &self,
        wrap: impl FnOnce(Box<dyn ResponseWriter>) -> Box<dyn ResponseWriter>,
    ) {
        let mut slot = lock(&self.inner.writer);
        if let Some(writer) = slot.take() {
            *slot = Some(wrap(writer));
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        let mut state = lock(&self.inner.state);
        if state.frozen { None } else { Some(f(&mut state)) }
    }

    /// `Ok(true)` when this call sent the headers. Only the winner touches
    /// the state, so a losing `respond` cannot clobber the body.
    fn commit(&self, code: u16, body: Option<Bytes>) -> io::Result<bool> {
        if self.inner.header_written.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.mark_ended();

        let hooks = {
            let mut s = lock(&self.inner.state);
            if code > 0 {
                s.status = code;
            }
            if let Some(body) = body {
                s.body = body;
                s.buffered = true;
            }
            mem::take(&mut s.before_send)
        };
        // Hooks lock the state themselves through the setters.
        for hook in hooks.into_iter().rev() {
            hook(self);
        }

        let (code, mut headers, body_len, after_end) = {
            let mut s = lock(&self.inner.state);
            if !status::is_valid(s.status) {
                s.status = if s.body.is_empty() { status::MISDIRECTED } else { StatusCode::OK.as_u16() };
            }
            if status::is_empty(s.status) {
                s.body = Bytes::new();
                s.headers.remove(CONTENT_LENGTH);
            } else if s.buffered && !s.headers.contains_key(CONTENT_LENGTH) {
                let len = HeaderValue::from(s.body.len());
                s.headers.insert(CONTENT_LENGTH, len);
            }
            s.frozen = true;
            (s.status, s.headers.clone(), s.body.len(), mem::take(&mut s.after_end))
        };

        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let sent = match lock(&self.inner.writer).as_mut() {
            Some(writer) => writer.write_header(status, &mut headers, body_len),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        };
        // Wrapping writers may have edited the headers on the way out.
        lock(&self.inner.state).headers = headers;

        if !after_end.is_empty() {
            run_after_end(self.clone(), after_end);
        }
        sent.map(|()| true)
    }

    fn write_body(&self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.suppress_body {
            return Ok(buf.len());
        }
        match lock(&self.inner.writer).as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

/// Runs post-end hooks off the response path, newest first.
fn run_after_end(res: Response, hooks: Vec<Hook>) {
    let run = move || {
        for hook in hooks.into_iter().rev() {
            hook(&res);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(run);
        }
        Err(_) => {
            std::thread::spawn(run);
        }
    }
}
