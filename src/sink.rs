use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use std::collections::VecDeque;
use std::io;

/// The real response underneath a [`CompressionWriter`](crate::CompressionWriter).
///
/// Headers stay mutable until [`send_head`](Self::send_head) is called; after
/// that only body bytes flow.
pub trait ResponseSink {
    /// The response headers.
    fn headers(&self) -> &HeaderMap;

    /// The response headers, for modification before the head is sent.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commits the status line and the current headers.
    fn send_head(&mut self, status: StatusCode);

    /// Writes body bytes.
    fn write_body(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Whether [`flush`](Self::flush) does anything for this sink.
    fn supports_flush(&self) -> bool {
        false
    }

    /// Pushes body bytes written so far towards the client.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts a [`ResponseSink`] to [`io::Write`] so encoders can write into it.
pub(crate) struct BodyWriter<'a, S: ?Sized>(pub(crate) &'a mut S);

impl<S: ResponseSink + ?Sized> io::Write for BodyWriter<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_body(buf)?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_body(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An in-memory sink turning writes into body frames.
///
/// The middleware drives its writer into one of these and hands the head and
/// the queued chunks on to the server.
#[derive(Debug, Default)]
pub(crate) struct FrameSink {
    headers: HeaderMap,
    status: Option<StatusCode>,
    frames: VecDeque<Bytes>,
    current: BytesMut,
}

impl FrameSink {
    pub(crate) fn new(headers: HeaderMap) -> Self {
        Self {
            headers,
            ..Self::default()
        }
    }

    /// The status, once the head has been sent.
    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub(crate) fn head_sent(&self) -> bool {
        self.status.is_some()
    }

    pub(crate) fn take_headers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.headers)
    }

    /// Next chunk of body bytes, oldest first.
    pub(crate) fn next_frame(&mut self) -> Option<Bytes> {
        if let Some(frame) = self.frames.pop_front() {
            return Some(frame);
        }
        if self.current.is_empty() {
            None
        } else {
            Some(self.current.split().freeze())
        }
    }

    /// Number of body bytes not yet taken.
    pub(crate) fn pending_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum::<usize>() + self.current.len()
    }
}

impl ResponseSink for FrameSink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn send_head(&mut self, status: StatusCode) {
        debug_assert!(self.status.is_none(), "response head sent twice");
        self.status.get_or_insert(status);
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        self.current.extend_from_slice(buf);
        Ok(())
    }

    fn supports_flush(&self) -> bool {
        true
    }

    /// Closes the current chunk so it goes out as its own frame.
    fn flush(&mut self) -> io::Result<()> {
        if !self.current.is_empty() {
            let frame = self.current.split().freeze();
            self.frames.push_back(frame);
        }
        Ok(())
    }
}
