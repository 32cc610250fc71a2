use crate::error::BoxError;
use crate::sink::FrameSink;
use crate::writer::CompressionWriter;
use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tracing::debug;

pin_project! {
    /// A response body that may be compressed.
    ///
    /// Either the inner body passed through unchanged, or the output of a
    /// [`CompressionWriter`] fed with the inner body's data frames.
    pub struct CompressionBody<B> {
        #[pin]
        kind: Kind<B>,
    }
}

pin_project! {
    #[project = KindProj]
    enum Kind<B> {
        Passthrough {
            #[pin]
            inner: B,
        },
        Streaming {
            inner: Pin<Box<B>>,
            state: Box<StreamingBody>,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Feeding inner frames into the writer.
    Reading,
    /// The writer is done; emitting what is left.
    Finished,
}

/// The writer side of a streaming body.
///
/// The response future drives it until the head is sent, then hands it to
/// the body, which keeps driving it as the server polls.
pub(crate) struct StreamingBody {
    writer: CompressionWriter<FrameSink>,
    always_flush: bool,
    phase: Phase,
    trailers: Option<HeaderMap>,
    error: Option<io::Error>,
}

impl StreamingBody {
    pub(crate) fn new(writer: CompressionWriter<FrameSink>, always_flush: bool) -> Self {
        Self {
            writer,
            always_flush,
            phase: Phase::Reading,
            trailers: None,
            error: None,
        }
    }

    pub(crate) fn writer_mut(&mut self) -> &mut CompressionWriter<FrameSink> {
        &mut self.writer
    }

    pub(crate) fn head_sent(&self) -> bool {
        self.writer.sink().head_sent()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Feeds one poll result of the inner body into the writer.
    pub(crate) fn on_frame<D, E>(&mut self, frame: Option<Result<Frame<D>, E>>)
    where
        D: Buf,
        E: Into<BoxError>,
    {
        match frame {
            None => self.finish(),
            Some(Err(e)) => self.fail(io::Error::other(e.into())),
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => self.push(data),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        // Trailers end the data
                        self.trailers = Some(trailers);
                        self.finish();
                    }
                }
            },
        }
    }

    fn push<D: Buf>(&mut self, mut data: D) {
        while data.has_remaining() {
            let len = data.chunk().len();
            if let Err(e) = self.writer.write_body(data.chunk()) {
                self.fail(e);
                return;
            }
            data.advance(len);
        }

        if self.writer.has_failed() {
            // error response replaces the body
            self.finish();
        } else if self.always_flush {
            self.flush();
        }
    }

    /// Sends whatever the writer holds, deciding the head if still open.
    pub(crate) fn flush(&mut self) {
        if let Err(e) = self.writer.flush_body() {
            self.fail(e);
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.writer.finalize() {
            self.error = Some(e);
        }
        self.phase = Phase::Finished;
    }

    fn fail(&mut self, e: io::Error) {
        debug!(error = %e, "response body failed");
        self.writer.abort();
        self.error = Some(e);
        self.phase = Phase::Finished;
    }

    fn poll_streaming<B>(
        &mut self,
        cx: &mut Context<'_>,
        inner: &mut Pin<Box<B>>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        loop {
            if let Some(data) = self.writer.sink_mut().next_frame() {
                return Poll::Ready(Some(Ok(Frame::data(data))));
            }

            if self.phase == Phase::Finished {
                if let Some(e) = self.error.take() {
                    return Poll::Ready(Some(Err(e)));
                }
                return Poll::Ready(self.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            let frame = ready!(inner.as_mut().poll_frame(cx));
            self.on_frame(frame);
        }
    }

    fn is_end_stream(&self) -> bool {
        self.phase == Phase::Finished
            && self.writer.sink().pending_len() == 0
            && self.error.is_none()
            && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        if self.phase == Phase::Finished {
            SizeHint::with_exact(self.writer.sink().pending_len() as u64)
        } else {
            SizeHint::default()
        }
    }
}

impl<B> CompressionBody<B> {
    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self {
            kind: Kind::Passthrough { inner },
        }
    }

    pub(crate) fn streaming(inner: Pin<Box<B>>, state: StreamingBody) -> Self {
        Self {
            kind: Kind::Streaming {
                inner,
                state: Box::new(state),
            },
        }
    }

    /// Returns true if the body goes through a compression writer, whatever
    /// the writer decided.
    pub fn is_streaming(&self) -> bool {
        matches!(self.kind, Kind::Streaming { .. })
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().kind.project() {
            KindProj::Passthrough { inner } => match ready!(inner.poll_frame(cx)) {
                None => Poll::Ready(None),
                Some(Ok(frame)) => Poll::Ready(Some(Ok(frame.map_data(copy_to_bytes)))),
                Some(Err(e)) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
            },
            KindProj::Streaming { inner, state } => state.poll_streaming(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Passthrough { inner } => inner.is_end_stream(),
            Kind::Streaming { state, .. } => state.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Passthrough { inner } => inner.size_hint(),
            Kind::Streaming { state, .. } => state.size_hint(),
        }
    }
}

fn copy_to_bytes<D: Buf>(mut data: D) -> Bytes {
    let mut bytes = BytesMut::with_capacity(data.remaining());
    while data.has_remaining() {
        let chunk = data.chunk();
        bytes.extend_from_slice(chunk);
        let len = chunk.len();
        data.advance(len);
    }
    bytes.freeze()
}
