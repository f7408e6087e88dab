//! The sink a [`Response`](crate::Response) flushes into.
//!
//! The state machine never talks to a socket. It hands the status line and
//! headers to a [`ResponseWriter`] exactly once and then streams body bytes
//! through it. Three writers ship with the crate:
//!
//! - the hyper channel writer the server uses (crate-private),
//! - the compression writer from [`compress`](crate::compress), which wraps
//!   another writer,
//! - [`Recorder`], an in-memory writer for tests.

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use hyper::body::{Body, Frame};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::lock;

/// Transport side of a response.
pub trait ResponseWriter: Send {
    /// Sends the status line and headers. Called at most once, before any
    /// [`write`](ResponseWriter::write).
    ///
    /// `headers` may still be edited by wrapping writers (a compressor drops
    /// `content-length`, for instance). `body_len` is the size of the
    /// buffered body, `0` when the body is streamed.
    fn write_header(
        &mut self,
        status: StatusCode,
        headers: &mut HeaderMap,
        body_len: usize,
    ) -> io::Result<()>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Flushes and releases the sink. Further writes fail.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Recorder ─────────────────────────────────────────────────────────────────

/// What a [`Recorder`] captured.
#[derive(Clone, Debug, Default)]
pub struct Recorded {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Number of `write_header` calls. Anything other than 0 or 1 is a bug.
    pub header_writes: usize,
    pub closed: bool,
}

/// In-memory [`ResponseWriter`]. Clones share the same capture, so keep one
/// and hand the other to the response.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recorded>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Recorded {
        lock(&self.inner).clone()
    }

    pub fn status(&self) -> Option<u16> {
        lock(&self.inner).status.map(|s| s.as_u16())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.inner)
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    pub fn body(&self) -> Vec<u8> {
        lock(&self.inner).body.clone()
    }
}

impl ResponseWriter for Recorder {
    fn write_header(
        &mut self,
        status: StatusCode,
        headers: &mut HeaderMap,
        _body_len: usize,
    ) -> io::Result<()> {
        let mut rec = lock(&self.inner);
        rec.header_writes += 1;
        rec.status = Some(status);
        rec.headers = headers.clone();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rec = lock(&self.inner);
        if rec.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        rec.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        lock(&self.inner).closed = true;
        Ok(())
    }
}

// ── hyper channel ────────────────────────────────────────────────────────────

/// Status line and headers handed to hyper once the response commits.
pub(crate) struct Head {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

/// Writer feeding a hyper response.
///
/// Headers travel over a oneshot, body chunks over an unbounded channel. A
/// failed send means hyper dropped its end, i.e. the client is gone, so the
/// request lifetime is cancelled.
pub(crate) struct ChannelWriter {
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::UnboundedSender<Bytes>>,
    lifetime: CancellationToken,
}

/// Streaming body returned to hyper. Ends when the writer is closed or dropped.
#[derive(Debug)]
pub struct ResponseBody {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

pub(crate) fn channel(
    lifetime: CancellationToken,
) -> (ChannelWriter, oneshot::Receiver<Head>, ResponseBody) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::unbounded_channel();
    let writer = ChannelWriter {
        head: Some(head_tx),
        body: Some(body_tx),
        lifetime,
    };
    (writer, head_rx, ResponseBody { rx: body_rx })
}

impl ChannelWriter {
    fn gone(&self) -> io::Error {
        self.lifetime.cancel();
        io::ErrorKind::BrokenPipe.into()
    }
}

impl ResponseWriter for ChannelWriter {
    fn write_header(
        &mut self,
        status: StatusCode,
        headers: &mut HeaderMap,
        _body_len: usize,
    ) -> io::Result<()> {
        let Some(tx) = self.head.take() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        let head = Head { status, headers: headers.clone() };
        tx.send(head).map_err(|_| self.gone())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(tx) = &self.body else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        if tx.send(Bytes::copy_from_slice(buf)).is_err() {
            return Err(self.gone());
        }
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.head = None;
        self.body = None;
        Ok(())
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_counts_header_writes() {
        let rec = Recorder::new();
        let mut w = rec.clone();
        let mut headers = HeaderMap::new();
        w.write_header(StatusCode::OK, &mut headers, 0).unwrap();
        w.write(b"hi").unwrap();
        w.close().unwrap();
        assert!(w.write(b"late").is_err());

        let snap = rec.snapshot();
        assert_eq!(snap.header_writes, 1);
        assert_eq!(snap.body, b"hi");
        assert!(snap.closed);
    }

    #[tokio::test]
    async fn test_channel_writer_cancels_lifetime_when_client_leaves() {
        let token = CancellationToken::new();
        let (mut w, head, body) = channel(token.clone());
        drop(head);
        drop(body);
        let mut headers = HeaderMap::new();
        assert!(w.write_header(StatusCode::OK, &mut headers, 0).is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_channel_writer_streams_chunks() {
        use http_body_util::BodyExt;

        let (mut w, head, body) = channel(CancellationToken::new());
        let mut headers = HeaderMap::new();
        w.write_header(StatusCode::CREATED, &mut headers, 0).unwrap();
        w.write(b"ab").unwrap();
        w.write(b"cd").unwrap();
        w.close().unwrap();

        assert_eq!(head.await.unwrap().status, StatusCode::CREATED);
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"abcd");
    }
}
