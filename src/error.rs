//! Structured HTTP error.
//!
//! Every failure that reaches the client goes through [`Error`]: a status
//! code, a short tag derived from the status registry, a message, an optional
//! JSON payload and an optional pruned stack trace.
//!
//! The predefined templates (`Error::NOT_FOUND`, `Error::BAD_REQUEST`, …) are
//! associated constants, and every `with_*` method takes `&self` and returns a
//! fresh value. A template is never mutated, so one constant serves any number
//! of concurrent requests:
//!
//! ```rust
//! use cog::Error;
//!
//! let a = Error::NOT_FOUND.with_message("no such user");
//! let b = Error::NOT_FOUND.with_message("no such order");
//!
//! assert_eq!(a.message(), "no such user");
//! assert_eq!(b.message(), "no such order");
//! assert_eq!(Error::NOT_FOUND.message(), "");
//! ```

use std::any::Any;
use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt;

use serde::Serialize;

use crate::status;

/// Type-erased error returned by middleware. Anything that implements
/// `std::error::Error + Send + Sync` converts into it with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Frames retained in a captured stack.
const MAX_FRAMES: usize = 10;

/// An HTTP error value.
///
/// Serializes to the body the client sees:
///
/// ```json
/// {"error":"Not Found","message":"no such user","data":{"id":42}}
/// ```
///
/// `code` and `stack` never leave the process.
#[derive(Clone, Debug, Serialize)]
pub struct Error {
    #[serde(skip)]
    code: u16,
    #[serde(rename = "error")]
    tag: Cow<'static, str>,
    message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip)]
    stack: Option<String>,
}

/// A foreign error that knows its own status code.
///
/// Implement it on your domain errors. `Error::from(e)` (or `?` in a function
/// returning `Result<_, cog::Error>`) keeps the status and message;
/// [`Error::from_http`] does the same from a template:
///
/// ```rust
/// use std::fmt;
/// use cog::{Error, HttpError};
///
/// #[derive(Debug)]
/// struct Locked;
///
/// impl fmt::Display for Locked {
///     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
///         f.write_str("account locked")
///     }
/// }
///
/// impl std::error::Error for Locked {}
///
/// impl HttpError for Locked {
///     fn status(&self) -> u16 { 423 }
/// }
///
/// let err = Error::DEFAULT.from_http(&Locked);
/// assert_eq!(err.code(), 423);
/// assert_eq!(err.tag(), "Locked");
/// assert_eq!(err.message(), "account locked");
///
/// let err = Error::from(Locked);
/// assert_eq!(err.code(), 423);
/// ```
///
/// A bare `Box<dyn std::error::Error>` cannot be asked for this trait, so
/// convert before the error is erased into a [`BoxError`].
pub trait HttpError: std::error::Error {
    fn status(&self) -> u16;
}

impl Error {
    // ── Templates ────────────────────────────────────────────────────────────

    /// Generic 500 with the neutral tag `"Error"`; the root every other
    /// template could be derived from.
    pub const DEFAULT: Error = Error::template(500, "Error");

    pub const BAD_REQUEST: Error = Error::template(400, "Bad Request");
    pub const UNAUTHORIZED: Error = Error::template(401, "Unauthorized");
    pub const FORBIDDEN: Error = Error::template(403, "Forbidden");
    pub const NOT_FOUND: Error = Error::template(404, "Not Found");
    pub const METHOD_NOT_ALLOWED: Error = Error::template(405, "Method Not Allowed");
    pub const REQUEST_TIMEOUT: Error = Error::template(408, "Request Timeout");
    pub const CONFLICT: Error = Error::template(409, "Conflict");
    pub const PAYLOAD_TOO_LARGE: Error = Error::template(413, "Payload Too Large");
    pub const UNSUPPORTED_MEDIA_TYPE: Error = Error::template(415, "Unsupported Media Type");
    pub const UNPROCESSABLE_ENTITY: Error = Error::template(422, "Unprocessable Entity");
    pub const TOO_MANY_REQUESTS: Error = Error::template(429, "Too Many Requests");
    pub const INTERNAL_SERVER_ERROR: Error = Error::template(500, "Internal Server Error");
    pub const NOT_IMPLEMENTED: Error = Error::template(501, "Not Implemented");
    pub const BAD_GATEWAY: Error = Error::template(502, "Bad Gateway");
    pub const SERVICE_UNAVAILABLE: Error = Error::template(503, "Service Unavailable");
    pub const GATEWAY_TIMEOUT: Error = Error::template(504, "Gateway Timeout");

    const fn template(code: u16, tag: &'static str) -> Self {
        Self {
            code,
            tag: Cow::Borrowed(tag),
            message: Cow::Borrowed(""),
            data: None,
            stack: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn code(&self) -> u16 { self.code }
    pub fn tag(&self) -> &str { &self.tag }
    pub fn message(&self) -> &str { &self.message }
    pub fn data(&self) -> Option<&serde_json::Value> { self.data.as_ref() }
    pub fn stack(&self) -> Option<&str> { self.stack.as_deref() }

    // ── Derivation ───────────────────────────────────────────────────────────

    /// Copy with a new status code. The tag follows the registry unless the
    /// registry has no text for `code`, in which case the old tag is kept.
    pub fn with_code(&self, code: u16) -> Error {
        let mut err = self.clone();
        err.code = code;
        if let Some(text) = status::text(code) {
            err.tag = Cow::Borrowed(text);
        }
        err
    }

    pub fn with_message(&self, message: impl Into<Cow<'static, str>>) -> Error {
        let mut err = self.clone();
        err.message = message.into();
        err
    }

    /// Copy with an explicit tag, overriding the registry text.
    pub fn with_tag(&self, tag: impl Into<Cow<'static, str>>) -> Error {
        let mut err = self.clone();
        err.tag = tag.into();
        err
    }

    /// Copy carrying a JSON payload rendered under `"data"`.
    pub fn with_data(&self, data: impl Into<serde_json::Value>) -> Error {
        let mut err = self.clone();
        err.data = Some(data.into());
        err
    }

    /// Derives an error from an arbitrary cause.
    ///
    /// An `Error` cause passes through unchanged, so wrapping never nests.
    /// Anything else keeps this template's code and tag and takes the
    /// cause's text as message.
    pub fn from_cause(&self, cause: &(dyn std::error::Error + 'static)) -> Error {
        if let Some(err) = find(cause) {
            return err.clone();
        }
        self.with_message(cause.to_string())
    }

    /// Derives an error from a cause that carries its own status.
    pub fn from_http(&self, cause: &dyn HttpError) -> Error {
        self.with_code(cause.status()).with_message(cause.to_string())
    }

    /// Normalizes whatever a middleware chain failed with.
    ///
    /// An `Error` anywhere in the cause's `source()` chain wins. Otherwise
    /// `code`, the status the response held when the failure surfaced,
    /// becomes the error's code when it is a client or server failure code.
    pub fn parse(cause: &(dyn std::error::Error + 'static), code: u16) -> Error {
        if let Some(err) = find(cause) {
            return err.clone();
        }
        let err = Error::INTERNAL_SERVER_ERROR.with_message(cause.to_string());
        if status::is_error(code) { err.with_code(code) } else { err }
    }

    /// Normalizes any failure value into an `Error` and attaches a stack.
    ///
    /// Accepts the payloads a panic or a failed chain can produce: an
    /// `Error`, a [`BoxError`], a `String` or a `&'static str`. Anything else
    /// becomes an opaque 500. Values that already carry a code keep it.
    ///
    /// The stack is pruned: the innermost `skip` frames are dropped and at
    /// most ten are kept, one location per line. An error that already has a
    /// stack keeps it, so the trace always points at the first capture site.
    pub fn capture_with_stack(value: Box<dyn Any + Send>, skip: usize) -> Error {
        let mut err = normalize(value);
        if err.stack.is_none() {
            let stack = prune_stack(&Backtrace::force_capture().to_string(), skip);
            if !stack.is_empty() {
                err.stack = Some(stack);
            }
        }
        err
    }

    /// Like [`capture_with_stack`](Error::capture_with_stack), for a panic
    /// payload whose trace was recorded while the panic was raised.
    pub(crate) fn capture_panic(value: Box<dyn Any + Send>, trace: Option<&Backtrace>) -> Error {
        let mut err = normalize(value);
        if err.stack.is_none() {
            let stack = match trace {
                Some(trace) => prune_stack(&trace.to_string(), 0),
                None => prune_stack(&Backtrace::force_capture().to_string(), 0),
            };
            if !stack.is_empty() {
                err.stack = Some(stack);
            }
        }
        err
    }

    /// The JSON body sent to the client.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| br#"{"error":"Error"}"#.to_vec())
    }
}

impl<E: HttpError + Send + Sync + 'static> From<E> for Error {
    fn from(cause: E) -> Self {
        Error::DEFAULT.from_http(&cause)
    }
}

/// The first `Error` in `cause`'s source chain.
fn find<'a>(cause: &'a (dyn std::error::Error + 'static)) -> Option<&'a Error> {
    std::iter::successors(Some(cause), |e| e.source()).find_map(|e| e.downcast_ref::<Error>())
}

fn normalize(value: Box<dyn Any + Send>) -> Error {
    let value = match value.downcast::<Error>() {
        Ok(err) => return *err,
        Err(value) => value,
    };
    let value = match value.downcast::<BoxError>() {
        Ok(err) => return Error::INTERNAL_SERVER_ERROR.from_cause(&**err),
        Err(value) => value,
    };
    let value = match value.downcast::<String>() {
        Ok(msg) => return Error::INTERNAL_SERVER_ERROR.with_message(*msg),
        Err(value) => value,
    };
    match value.downcast::<&'static str>() {
        Ok(msg) => Error::INTERNAL_SERVER_ERROR.with_message(*msg),
        Err(_) => Error::INTERNAL_SERVER_ERROR.with_message("opaque panic payload"),
    }
}

/// Reduces a rendered `std::backtrace::Backtrace` to one location per frame.
///
/// A trace taken inside a panic hook starts at the frame that panicked: the
/// hook and the unwinding machinery above it are cut. Frames belonging to
/// the backtrace machinery and to this module are dropped before `skip` is
/// applied.
fn prune_stack(trace: &str, skip: usize) -> String {
    let mut frames: Vec<(&str, Option<&str>)> = Vec::new();
    for line in trace.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                frame.1.get_or_insert(location);
            }
            continue;
        }
        if let Some((index, symbol)) = line.split_once(": ") {
            if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
                frames.push((symbol, None));
            }
        }
    }

    let origin = match frames.iter().position(|(symbol, _)| raises_panic(symbol)) {
        Some(first) => frames[first..]
            .iter()
            .position(|(symbol, _)| !is_runtime(symbol))
            .map_or(frames.len(), |n| first + n),
        None => 0,
    };

    frames
        .into_iter()
        .skip(origin)
        .filter(|(symbol, _)| {
            !symbol.starts_with("std::backtrace") && !symbol.starts_with("cog::error::")
        })
        .skip(skip)
        .take(MAX_FRAMES)
        .map(|(symbol, location)| location.unwrap_or(symbol))
        .collect::<Vec<_>>()
        .join("\n")
}

fn raises_panic(symbol: &str) -> bool {
    symbol.starts_with("core::panicking::")
        || symbol.starts_with("std::panicking::begin_panic")
        || symbol.starts_with("std::panicking::rust_panic")
        || symbol.contains("rust_begin_unwind")
}

fn is_runtime(symbol: &str) -> bool {
    ["std::", "core::", "alloc::", "__rustc::"].iter().any(|p| symbol.starts_with(p))
        || symbol.contains("rust_begin_unwind")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tag, self.message)
    }
}

impl std::error::Error for Error {}
