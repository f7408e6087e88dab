//! Response compression.
//!
//! The application plugs in a [`Compressible`] rule; the dispatcher
//! negotiates `gzip` or `deflate` from `Accept-Encoding` and wraps the
//! response's writer. Whether a given response is actually compressed is
//! decided once, when its headers go out.

use std::io::{self, Write};
use std::mem;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::context::Context;
use crate::status;
use crate::transport::ResponseWriter;

/// Bodies at most this large are not worth compressing.
pub const MIN_COMPRESSION_SIZE: usize = 1024;

/// Decides whether a response is worth compressing.
pub trait Compressible: Send + Sync + 'static {
    /// `content_length` is `0` when unknown (streamed bodies).
    fn compressible(&self, content_type: &str, content_length: usize) -> bool;
}

/// Compresses textual types whose body is unknown or above
/// [`MIN_COMPRESSION_SIZE`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCompress;

impl Compressible for DefaultCompress {
    fn compressible(&self, content_type: &str, content_length: usize) -> bool {
        if content_length > 0 && content_length <= MIN_COMPRESSION_SIZE {
            return false;
        }
        let essence = content_type.split(';').next().unwrap_or("").trim();
        matches!(
            essence,
            "text/html"
                | "text/css"
                | "text/plain"
                | "text/xml"
                | "text/javascript"
                | "application/javascript"
                | "application/json"
                | "application/xml"
                | "application/xhtml+xml"
                | "application/rss+xml"
                | "application/atom+xml"
                | "application/ld+json"
                | "image/svg+xml"
        )
    }
}

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Picks the offer the client prefers by `q` value. Ties go to the earlier
/// offer; `q=0` and unlisted codings (without a `*`) are refused.
///
/// ```rust
/// use cog::compress::negotiate;
///
/// assert_eq!(negotiate("deflate;q=0.5, gzip", &["gzip", "deflate"]), Some("gzip"));
/// assert_eq!(negotiate("br", &["gzip", "deflate"]), None);
/// ```
pub fn negotiate<'a>(accept: &str, offers: &[&'a str]) -> Option<&'a str> {
    let mut best: Option<(&'a str, f32)> = None;
    for &offer in offers {
        let q = quality(accept, offer);
        if q > 0.0 && best.is_none_or(|(_, b)| q > b) {
            best = Some((offer, q));
        }
    }
    best.map(|(offer, _)| offer)
}

fn quality(accept: &str, coding: &str) -> f32 {
    let mut wildcard = None;
    for item in accept.split(',') {
        let mut parts = item.split(';');
        let name = parts.next().unwrap_or("").trim();
        let q = parts
            .find_map(|p| p.trim().strip_prefix("q="))
            .and_then(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        if name.eq_ignore_ascii_case(coding) {
            return q;
        }
        if name == "*" {
            wildcard = Some(q);
        }
    }
    wildcard.unwrap_or(0.0)
}

/// Wraps the context's writer when compression is configured, the method
/// carries a body and the client accepts a coding we speak.
pub(crate) fn install(ctx: &Context) {
    let Some(rule) = ctx.settings().compress() else {
        return;
    };
    if matches!(*ctx.method(), Method::HEAD | Method::OPTIONS) {
        return;
    }
    let encoding = match ctx.accept_encoding(&["gzip", "deflate"]) {
        Some("gzip") => Encoding::Gzip,
        Some(_) => Encoding::Deflate,
        None => return,
    };
    let rule = Arc::clone(rule);
    ctx.response()
        .wrap_writer(move |inner| Box::new(CompressWriter::new(inner, encoding, rule)));
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    fn as_str(self) -> &'static str {
        match self {
            Self::Gzip    => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

enum State {
    /// Headers not sent yet.
    Pending,
    Plain,
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
    Closed,
}

/// Compressing [`ResponseWriter`] around another writer.
///
/// Encoded output is buffered in the encoder and forwarded after every
/// write; [`close`](ResponseWriter::close) flushes the trailer.
pub(crate) struct CompressWriter {
    inner: Box<dyn ResponseWriter>,
    encoding: Encoding,
    rule: Arc<dyn Compressible>,
    state: State,
}

impl CompressWriter {
    pub(crate) fn new(
        inner: Box<dyn ResponseWriter>,
        encoding: Encoding,
        rule: Arc<dyn Compressible>,
    ) -> Self {
        Self { inner, encoding, rule, state: State::Pending }
    }

    fn forward(inner: &mut Box<dyn ResponseWriter>, out: &mut Vec<u8>) -> io::Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let chunk = mem::take(out);
        inner.write(&chunk).map(|_| ())
    }
}

impl ResponseWriter for CompressWriter {
    fn write_header(
        &mut self,
        status: StatusCode,
        headers: &mut HeaderMap,
        body_len: usize,
    ) -> io::Result<()> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let compress = !status::is_empty(status.as_u16())
            && !headers.contains_key(CONTENT_ENCODING)
            && self.rule.compressible(content_type, body_len);

        self.state = if compress {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(self.encoding.as_str()));
            headers.remove(CONTENT_LENGTH);
            let listed = headers
                .get_all(VARY)
                .iter()
                .any(|v| v.to_str().is_ok_and(|v| v.to_ascii_lowercase().contains("accept-encoding")));
            if !listed {
                headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
            }
            match self.encoding {
                Encoding::Gzip    => State::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
                Encoding::Deflate => State::Deflate(ZlibEncoder::new(Vec::new(), Compression::default())),
            }
        } else {
            State::Plain
        };
        self.inner.write_header(status, headers, body_len)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            State::Pending | State::Plain => return self.inner.write(buf),
            State::Closed => return Err(io::ErrorKind::BrokenPipe.into()),
            State::Gzip(enc) => {
                enc.write_all(buf)?;
                Self::forward(&mut self.inner, enc.get_mut())?;
            }
            State::Deflate(enc) => {
                enc.write_all(buf)?;
                Self::forward(&mut self.inner, enc.get_mut())?;
            }
        }
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        let tail = match mem::replace(&mut self.state, State::Closed) {
            State::Gzip(enc) => Some(enc.finish()),
            State::Deflate(enc) => Some(enc.finish()),
            State::Pending | State::Plain | State::Closed => None,
        };
        if let Some(tail) = tail {
            let mut tail = tail?;
            Self::forward(&mut self.inner, &mut tail)?;
        }
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::{GzDecoder, ZlibDecoder};

    use super::*;
    use crate::response::Response;
    use crate::transport::Recorder;

    fn compressed(encoding: Encoding) -> (Response, Recorder) {
        let rec = Recorder::new();
        let writer = CompressWriter::new(Box::new(rec.clone()), encoding, Arc::new(DefaultCompress));
        (Response::new(Box::new(writer)), rec)
    }

    #[test]
    fn test_negotiate_prefers_quality_then_order() {
        assert_eq!(negotiate("gzip, deflate", &["gzip", "deflate"]), Some("gzip"));
        assert_eq!(negotiate("gzip;q=0.2, deflate;q=0.8", &["gzip", "deflate"]), Some("deflate"));
        assert_eq!(negotiate("*", &["gzip", "deflate"]), Some("gzip"));
        assert_eq!(negotiate("gzip;q=0, *;q=0.1", &["gzip", "deflate"]), Some("deflate"));
        assert_eq!(negotiate("", &["gzip"]), None);
    }

    #[test]
    fn test_default_rule() {
        assert!(DefaultCompress.compressible("application/json; charset=utf-8", 4096));
        assert!(DefaultCompress.compressible("text/html", 0));
        assert!(!DefaultCompress.compressible("text/html", 512));
        assert!(!DefaultCompress.compressible("image/png", 4096));
    }

    #[test]
    fn test_large_bodies_are_gzipped() {
        let (res, rec) = compressed(Encoding::Gzip);
        let body = "x".repeat(4096);
        res.set_header(CONTENT_TYPE, "text/plain");
        res.respond(200, body.clone()).unwrap();
        res.close().unwrap();

        assert_eq!(rec.header("content-encoding").as_deref(), Some("gzip"));
        assert_eq!(rec.header("vary").as_deref(), Some("Accept-Encoding"));
        assert!(rec.header("content-length").is_none());
        assert!(res.header("content-length").is_none());

        let mut plain = String::new();
        GzDecoder::new(&rec.body()[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, body);
    }

    #[test]
    fn test_streamed_bodies_are_deflated() {
        let (res, rec) = compressed(Encoding::Deflate);
        res.set_header(CONTENT_TYPE, "application/json");
        res.write(b"[1,").unwrap();
        res.write(b"2]").unwrap();
        res.close().unwrap();

        let mut plain = String::new();
        ZlibDecoder::new(&rec.body()[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "[1,2]");
    }

    #[test]
    fn test_small_bodies_pass_through() {
        let (res, rec) = compressed(Encoding::Gzip);
        res.set_header(CONTENT_TYPE, "text/plain");
        res.respond(200, "tiny").unwrap();
        res.close().unwrap();

        assert!(rec.header("content-encoding").is_none());
        assert_eq!(rec.header("content-length").as_deref(), Some("4"));
        assert_eq!(rec.body(), b"tiny");
    }
}
