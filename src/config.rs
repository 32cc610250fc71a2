use crate::content_type::AllowList;
use crate::encoder::{EncoderFactory, EncoderRegistry};
use crate::error::Error;
use crate::negotiate::{Negotiator, QualityNegotiator};
use crate::pool::{BufferPool, DEFAULT_POOL_CAPACITY};
use crate::sink::ResponseSink;
#[cfg(any(feature = "gzip", feature = "deflate", feature = "zstd", feature = "brotli"))]
use crate::codec::Codec;
#[cfg(any(feature = "gzip", feature = "deflate", feature = "zstd"))]
use compression_core::Level;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, Version, header};
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default minimum body size for compression, and the size of every pool
/// buffer.
pub const DEFAULT_MIN_SIZE: usize = 4096;

/// Priority of the gzip encoder registered by default.
pub const DEFAULT_GZIP_PRIORITY: i32 = 100;

/// Renders a response for an error that happened before any body byte was
/// sent.
pub type ErrorHandler = Arc<dyn Fn(&Error, &RequestInfo, &mut dyn ResponseSink) + Send + Sync>;

/// The parts of the request an [`ErrorHandler`] gets to see.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Request method.
    pub method: Method,
    /// Request URI.
    pub uri: Uri,
    /// HTTP version.
    pub version: Version,
    /// Request headers.
    pub headers: HeaderMap,
}

impl<B> From<&Request<B>> for RequestInfo {
    fn from(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }
}

/// Answers with `500 Internal Server Error` and the error message as a plain
/// text body.
pub fn default_error_handler(err: &Error, _req: &RequestInfo, sink: &mut dyn ResponseSink) {
    let headers = sink.headers_mut();
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    sink.send_head(StatusCode::INTERNAL_SERVER_ERROR);
    if let Err(e) = sink.write_body(format!("{err}\n").as_bytes()) {
        warn!(error = %e, "failed to write error response");
    }
}

/// Settings shared by every response of a compression layer.
///
/// The default registers gzip at priority 100, compresses the content types of
/// [`AllowList::default`] from 4096 bytes on, and renders encoder failures
/// with [`default_error_handler`].
#[derive(Clone)]
pub struct Config {
    pub(crate) min_size: usize,
    pub(crate) allowed: AllowList,
    pub(crate) registry: EncoderRegistry,
    pub(crate) negotiator: Arc<dyn Negotiator>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) pool: BufferPool,
    pool_capacity: usize,
    acquire_timeout: Option<Duration>,
}

impl Config {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut registry = EncoderRegistry::new();
        #[cfg(feature = "gzip")]
        registry.register(
            Codec::Gzip.content_encoding(),
            DEFAULT_GZIP_PRIORITY,
            Codec::Gzip.factory(Level::Default),
        );

        Self {
            min_size: DEFAULT_MIN_SIZE,
            allowed: AllowList::default(),
            registry,
            negotiator: Arc::new(QualityNegotiator),
            error_handler: Some(Arc::new(default_error_handler)),
            pool: BufferPool::new(DEFAULT_MIN_SIZE, DEFAULT_POOL_CAPACITY),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            acquire_timeout: None,
        }
    }

    /// Sets the minimum body size required for compression.
    ///
    /// Responses with a known Content-Length smaller than this value are sent
    /// as is. Responses of unknown length are buffered up to this many bytes
    /// before deciding.
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self.rebuild_pool();
        self
    }

    /// Replaces the content types eligible for compression.
    pub fn allowed_types(mut self, patterns: impl IntoIterator<Item = Regex>) -> Self {
        self.allowed = AllowList::new(patterns);
        self
    }

    /// Registers an encoding. A later registration of the same name replaces
    /// the earlier one.
    pub fn with_encoder(
        mut self,
        name: impl Into<String>,
        priority: i32,
        factory: EncoderFactory,
    ) -> Self {
        self.registry.register(name, priority, factory);
        self
    }

    /// Unregisters an encoding, including the default gzip one.
    pub fn without_encoder(mut self, name: &str) -> Self {
        self.registry.remove(name);
        self
    }

    /// Registers the built-in gzip encoder.
    #[cfg(feature = "gzip")]
    pub fn with_gzip(self, priority: i32, level: Level) -> Self {
        self.with_codec(Codec::Gzip, priority, level)
    }

    /// Registers the built-in deflate encoder.
    #[cfg(feature = "deflate")]
    pub fn with_deflate(self, priority: i32, level: Level) -> Self {
        self.with_codec(Codec::Deflate, priority, level)
    }

    /// Registers the built-in zstd encoder.
    #[cfg(feature = "zstd")]
    pub fn with_zstd(self, priority: i32, level: Level) -> Self {
        self.with_codec(Codec::Zstd, priority, level)
    }

    /// Registers the built-in brotli encoder.
    #[cfg(feature = "brotli")]
    pub fn with_brotli(self, priority: i32) -> Self {
        self.with_codec(Codec::Brotli, priority, compression_core::Level::Default)
    }

    #[cfg(any(feature = "gzip", feature = "deflate", feature = "zstd", feature = "brotli"))]
    fn with_codec(self, codec: Codec, priority: i32, level: compression_core::Level) -> Self {
        self.with_encoder(codec.content_encoding(), priority, codec.factory(level))
    }

    /// Sets the handler rendering encoder failures.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error, &RequestInfo, &mut dyn ResponseSink) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Sends responses uncompressed when their encoder cannot be created,
    /// instead of rendering an error.
    pub fn without_error_handler(mut self) -> Self {
        self.error_handler = None;
        self
    }

    /// Replaces the `Accept-Encoding` negotiation.
    pub fn negotiator(mut self, negotiator: impl Negotiator + 'static) -> Self {
        self.negotiator = Arc::new(negotiator);
        self
    }

    /// Sets how many responses may buffer at the same time.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self.rebuild_pool();
        self
    }

    /// Bounds the wait for a pool buffer. Responses that time out are sent
    /// uncompressed.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self.rebuild_pool();
        self
    }

    /// The minimum body size for compression.
    pub fn threshold(&self) -> usize {
        self.min_size
    }

    /// The registered encodings.
    pub fn registry(&self) -> &EncoderRegistry {
        &self.registry
    }

    /// The content types eligible for compression.
    pub fn allow_list(&self) -> &AllowList {
        &self.allowed
    }

    /// The buffer pool shared by all responses.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn rebuild_pool(&mut self) {
        self.pool =
            BufferPool::with_timeout(self.min_size, self.pool_capacity, self.acquire_timeout);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("min_size", &self.min_size)
            .field("allowed", &self.allowed)
            .field("registry", &self.registry)
            .field("error_handler", &self.error_handler.is_some())
            .field("pool", &self.pool)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}
