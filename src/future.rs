use crate::body::{CompressionBody, StreamingBody};
use crate::config::{Config, RequestInfo};
use crate::encoder::EncoderSpec;
use crate::error::BoxError;
use crate::sink::FrameSink;
use crate::writer::CompressionWriter;
use http::{Response, header};
use http_body::Body;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::trace;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pin_project! {
    /// Future for compression service responses.
    pub struct ResponseFuture<F, B, E> {
        #[pin]
        kind: Kind<F, B, E>,
    }
}

pin_project! {
    #[project = KindProj]
    enum Kind<F, B, E> {
        Passthrough {
            #[pin]
            inner: F,
        },
        Compressing {
            future: BoxFuture<Result<Response<CompressionBody<B>>, E>>,
        },
    }
}

impl<F, B, E> ResponseFuture<F, B, E> {
    pub(crate) fn passthrough(inner: F) -> Self {
        Self {
            kind: Kind::Passthrough { inner },
        }
    }
}

impl<F, B, E> ResponseFuture<F, B, E>
where
    F: Future<Output = Result<Response<B>, E>> + Send + 'static,
    B: Body + Send + 'static,
    B::Error: Into<BoxError>,
    E: 'static,
{
    pub(crate) fn compressing(
        inner: F,
        encoding: EncoderSpec,
        config: Arc<Config>,
        request: RequestInfo,
        cancel: CancellationToken,
    ) -> Self {
        let writer = |headers| {
            CompressionWriter::new(FrameSink::new(headers), encoding, config)
                .with_request(request)
                .with_cancellation(cancel)
        };
        Self {
            kind: Kind::Compressing {
                future: Box::pin(drive(inner, writer)),
            },
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B, E>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            KindProj::Passthrough { inner } => inner
                .poll(cx)
                .map_ok(|response| response.map(CompressionBody::passthrough)),
            KindProj::Compressing { future } => future.as_mut().poll(cx),
        }
    }
}

/// Runs the inner response through a writer until its head is decided.
///
/// The writer holds the status back while it buffers, so body frames are
/// pulled here until it sends the head (or the body ends). Responses flushed
/// eagerly get their head right away. The rest of the body is driven by
/// [`CompressionBody`].
async fn drive<F, B, E, W>(inner: F, writer: W) -> Result<Response<CompressionBody<B>>, E>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Error: Into<BoxError>,
    W: FnOnce(header::HeaderMap) -> CompressionWriter<FrameSink>,
{
    let response = inner.await?;
    let (mut parts, body) = response.into_parts();

    let always_flush = wants_eager_flush(&parts.headers);

    let mut writer = writer(std::mem::take(&mut parts.headers));
    if writer.may_compress() {
        add_vary_accept_encoding(writer.headers_mut());
    }
    let mut state = StreamingBody::new(writer, always_flush);
    let mut body = Box::pin(body);

    state.writer_mut().set_status(parts.status).await;
    if always_flush {
        // streams must not wait for their first event
        state.flush();
    }
    while !state.head_sent() && !state.is_finished() {
        state.on_frame(body.frame().await);
    }

    let writer = state.writer_mut();
    trace!(decision = ?writer.decision(), "response head decided");
    parts.status = writer.sink().status().unwrap_or(writer.status());
    parts.headers = writer.sink_mut().take_headers();

    Ok(Response::from_parts(
        parts,
        CompressionBody::streaming(body, state),
    ))
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut header::HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("*") || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(
        header::VARY,
        header::HeaderValue::from_static("accept-encoding"),
    );
}

/// Checks whether every data frame should be flushed right away.
fn wants_eager_flush(headers: &header::HeaderMap) -> bool {
    headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("no"))
        || headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().starts_with("text/event-stream"))
}
