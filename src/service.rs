use crate::body::CompressionBody;
use crate::config::{Config, RequestInfo};
use crate::error::BoxError;
use crate::future::ResponseFuture;
use http::{Request, Response, header};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::trace;

/// A Tower service that compresses HTTP response bodies.
///
/// A [`CancellationToken`] found in the request extensions aborts the wait
/// for a pool buffer when it is canceled.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> CompressionService<S> {
    /// Creates a new compression service wrapping the given inner service.
    pub fn new(inner: S, config: Config) -> Self {
        Self::from_shared(inner, Arc::new(config))
    }

    pub(crate) fn from_shared(inner: S, config: Arc<Config>) -> Self {
        Self { inner, config }
    }

    /// Returns the configuration of this service.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: Body + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let accept_encoding = req
            .headers()
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok());
        let registry = self.config.registry();
        let encoding = self
            .config
            .negotiator
            .choose(accept_encoding, registry.names())
            .and_then(|name| registry.get(name))
            .cloned();

        let Some(encoding) = encoding else {
            trace!(?accept_encoding, "no acceptable encoding");
            return ResponseFuture::passthrough(self.inner.call(req));
        };

        let request = RequestInfo::from(&req);
        let cancel = req
            .extensions()
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default();
        let inner = self.inner.call(req);

        ResponseFuture::compressing(inner, encoding, self.config.clone(), request, cancel)
    }
}
