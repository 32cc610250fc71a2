//! Buffered HTTP response compression middleware for Tower.
//!
//! The layer negotiates an encoding from the request's `Accept-Encoding`
//! header and runs the response through a [`CompressionWriter`]. When the
//! response does not declare its length, the writer holds the first bytes in
//! a pooled buffer of the minimum size and only compresses once the body
//! turns out to be larger than that. Small bodies go out untouched.
//!
//! # Example
//!
//! ```ignore
//! use http_buffered_compression::{CompressionLayer, Level};
//! use tower::ServiceBuilder;
//!
//! let service = ServiceBuilder::new()
//!     .layer(CompressionLayer::new().with_zstd(50, Level::Default))
//!     .service(my_service);
//! ```
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - No registered encoding is accepted by the request
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - `Content-Type` is missing or does not match the allow-list (by default
//!   `text/*`, JSON, JavaScript, `+xml`/`+json` types and SVG)
//! - `Content-Length` is below the minimum size threshold (default: 4096 bytes)
//! - The length is unknown and the body ends, or is flushed, before it
//!   exceeds the threshold
//! - No pool buffer could be leased for a response of unknown length
//!
//! The middleware flushes after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` header is set to the negotiated encoding
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed
//!
//! `Vary` includes `Accept-Encoding` whenever an encoding was negotiated and
//! the headers leave compression possible: no `Content-Encoding` or
//! `Content-Range`, and an allowed `Content-Type`.
//!
//! Responses flushed after each chunk get their head sent before the first
//! body frame arrives.

#![deny(missing_docs)]

mod body;
mod codec;
mod config;
mod content_type;
mod encoder;
mod error;
mod future;
mod layer;
mod negotiate;
mod pool;
mod service;
mod sink;
mod writer;

pub use body::CompressionBody;
pub use codec::{Codec, CodecEncoder};
pub use compression_core::Level;
pub use config::{
    Config, DEFAULT_GZIP_PRIORITY, DEFAULT_MIN_SIZE, ErrorHandler, RequestInfo,
    default_error_handler,
};
pub use content_type::AllowList;
pub use encoder::{
    EncoderContext, EncoderFactory, EncoderRegistry, EncoderSpec, StreamEncoder, encoder_factory,
};
pub use error::{BoxError, Error};
pub use future::ResponseFuture;
pub use layer::CompressionLayer;
pub use negotiate::{Negotiator, QualityNegotiator};
pub use pool::{BufferLease, BufferPool, DEFAULT_POOL_CAPACITY};
pub use service::CompressionService;
pub use sink::ResponseSink;
pub use writer::{CompressionWriter, Decision};
