use compression_core::Level;

/// A type-erased error, as returned by encoder factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the compression layer itself.
///
/// Failures of the response sink or of the inner body are reported as
/// [`std::io::Error`] instead, since they travel through the body stream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every buffer of the pool is leased out and none came back in time.
    #[error("buffer pool exhausted")]
    PoolExhausted,

    /// The request was canceled while waiting for a buffer.
    #[error("buffer acquisition canceled")]
    AcquireCanceled,

    /// The factory of the negotiated encoding could not build an encoder.
    #[error("cannot create {encoding} encoder: {source}")]
    EncoderConstruction {
        /// Name of the negotiated encoding.
        encoding: String,
        /// Error reported by the factory.
        #[source]
        source: BoxError,
    },

    /// A built-in codec was configured with a level it does not support.
    #[error("invalid compression level {level:?} for {encoding}")]
    InvalidLevel {
        /// Name of the encoding.
        encoding: &'static str,
        /// The rejected level.
        level: Level,
    },
}

impl Error {
    /// Returns true for errors after which the response can still be sent
    /// uncompressed.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::PoolExhausted | Error::AcquireCanceled)
    }
}
