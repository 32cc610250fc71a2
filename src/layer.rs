use crate::config::{Config, RequestInfo};
use crate::encoder::EncoderFactory;
use crate::error::Error;
use crate::negotiate::Negotiator;
use crate::service::CompressionService;
use crate::sink::ResponseSink;
#[cfg(any(feature = "gzip", feature = "deflate", feature = "zstd"))]
use compression_core::Level;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tower::Layer;

/// A Tower layer that compresses HTTP response bodies.
///
/// This layer wraps services and compresses response bodies based on the
/// client's Accept-Encoding header. Every service built by the same layer
/// shares one configuration, and so one buffer pool.
#[derive(Debug, Clone, Default)]
pub struct CompressionLayer {
    config: Arc<Config>,
}

impl CompressionLayer {
    /// Creates a new compression layer with default settings.
    ///
    /// The default minimum size for compression is 4096 bytes and gzip is the
    /// only registered encoding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a layer from a prepared configuration.
    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Returns the configuration of this layer.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sets the minimum body size required for compression.
    ///
    /// See [`Config::min_size`].
    pub fn min_size(self, size: usize) -> Self {
        self.map(|c| c.min_size(size))
    }

    /// Replaces the content types eligible for compression.
    pub fn allowed_types(self, patterns: impl IntoIterator<Item = Regex>) -> Self {
        self.map(|c| c.allowed_types(patterns))
    }

    /// Registers an encoding.
    pub fn with_encoder(
        self,
        name: impl Into<String>,
        priority: i32,
        factory: EncoderFactory,
    ) -> Self {
        self.map(|c| c.with_encoder(name, priority, factory))
    }

    /// Unregisters an encoding.
    pub fn without_encoder(self, name: &str) -> Self {
        self.map(|c| c.without_encoder(name))
    }

    /// Registers the built-in gzip encoder.
    #[cfg(feature = "gzip")]
    pub fn with_gzip(self, priority: i32, level: Level) -> Self {
        self.map(|c| c.with_gzip(priority, level))
    }

    /// Registers the built-in deflate encoder.
    #[cfg(feature = "deflate")]
    pub fn with_deflate(self, priority: i32, level: Level) -> Self {
        self.map(|c| c.with_deflate(priority, level))
    }

    /// Registers the built-in zstd encoder.
    #[cfg(feature = "zstd")]
    pub fn with_zstd(self, priority: i32, level: Level) -> Self {
        self.map(|c| c.with_zstd(priority, level))
    }

    /// Registers the built-in brotli encoder.
    #[cfg(feature = "brotli")]
    pub fn with_brotli(self, priority: i32) -> Self {
        self.map(|c| c.with_brotli(priority))
    }

    /// Sets the handler rendering encoder failures.
    pub fn error_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&Error, &RequestInfo, &mut dyn ResponseSink) + Send + Sync + 'static,
    {
        self.map(|c| c.error_handler(handler))
    }

    /// Sends responses uncompressed when their encoder cannot be created.
    pub fn without_error_handler(self) -> Self {
        self.map(Config::without_error_handler)
    }

    /// Replaces the `Accept-Encoding` negotiation.
    pub fn negotiator(self, negotiator: impl Negotiator + 'static) -> Self {
        self.map(|c| c.negotiator(negotiator))
    }

    /// Sets how many responses may buffer at the same time.
    pub fn pool_capacity(self, capacity: usize) -> Self {
        self.map(|c| c.pool_capacity(capacity))
    }

    /// Bounds the wait for a pool buffer.
    pub fn acquire_timeout(self, timeout: Duration) -> Self {
        self.map(|c| c.acquire_timeout(timeout))
    }

    fn map(self, f: impl FnOnce(Config) -> Config) -> Self {
        Self::from_config(f(Arc::unwrap_or_clone(self.config)))
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::from_shared(inner, self.config.clone())
    }
}
