use crate::config::{Config, RequestInfo};
use crate::encoder::{EncoderContext, EncoderSpec, StreamEncoder};
use crate::error::Error;
use crate::pool::BufferLease;
use crate::sink::{BodyWriter, ResponseSink};
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Where a response is in the compression decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The head has not been finalized yet.
    Undecided,
    /// Length unknown: body bytes are held until there are enough to decide.
    Buffering,
    /// The body is compressed.
    Encoding,
    /// The body goes out as written.
    Passthrough,
}

enum State {
    Undecided,
    Buffering(BufferLease),
    Encoding(Box<dyn StreamEncoder>),
    Passthrough,
    Done,
}

/// Outcome of looking at the response headers.
enum Policy {
    Passthrough(&'static str),
    Encode,
    Buffer,
}

/// A response writer that compresses the body when it is worth it.
///
/// The writer sits between a handler and the real response (the sink). The
/// decision is taken when the head is finalized, which happens on
/// [`set_status`](Self::set_status) or on the first [`write`](Self::write):
///
/// - a response that already has a `Content-Encoding` or a `Content-Range`,
///   or whose `Content-Type` is missing or not allowed, passes through;
/// - a `Content-Length` of at least the minimum size starts the encoder right
///   away, a smaller one passes through;
/// - otherwise the body is buffered in a pool buffer of the minimum size, and
///   the status is held back. Once a write would overflow the buffer the
///   encoder starts and gets the buffered prefix first. A response that ends,
///   or is flushed, before that goes out uncompressed.
///
/// Every writer must end with [`finalize`](Self::finalize) (or
/// [`abort`](Self::abort)). Dropping it without either still returns the
/// buffer to the pool, but sends nothing.
///
/// A writer belongs to a single response and is driven through `&mut self`,
/// so it needs no internal locking.
pub struct CompressionWriter<S> {
    sink: S,
    encoding: EncoderSpec,
    config: Arc<Config>,
    request: RequestInfo,
    cancel: CancellationToken,
    status: StatusCode,
    state: State,
    decision: Decision,
    head_finalized: bool,
    status_sent: bool,
    sink_flushes: bool,
    encoder_flushes: bool,
    pending_error: Option<Error>,
    write_failed: bool,
    finalized: bool,
}

impl<S: ResponseSink> CompressionWriter<S> {
    /// Creates a writer compressing with `encoding` into `sink`.
    pub fn new(sink: S, encoding: EncoderSpec, config: Arc<Config>) -> Self {
        Self {
            sink_flushes: sink.supports_flush(),
            sink,
            encoding,
            config,
            request: RequestInfo::default(),
            cancel: CancellationToken::new(),
            status: StatusCode::OK,
            state: State::Undecided,
            decision: Decision::Undecided,
            head_finalized: false,
            status_sent: false,
            encoder_flushes: false,
            pending_error: None,
            write_failed: false,
            finalized: false,
        }
    }

    /// Sets the request handed to the error handler.
    pub fn with_request(mut self, request: RequestInfo) -> Self {
        self.request = request;
        self
    }

    /// Sets the token aborting a wait for a pool buffer. It is also handed to
    /// the encoder factory.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The response headers. Changes to them only matter until the head is
    /// finalized.
    pub fn headers(&self) -> &HeaderMap {
        self.sink.headers()
    }

    /// The response headers, for modification before the head is finalized.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.sink.headers_mut()
    }

    /// Sets the status and finalizes the head, taking the compression
    /// decision. Only the first call has any effect.
    pub async fn set_status(&mut self, status: StatusCode) {
        if self.head_finalized || self.finalized {
            debug!(%status, current = %self.status, "status already set, ignoring");
            return;
        }
        self.status = status;
        self.finalize_head().await;
    }

    /// Writes body bytes, finalizing the head with the current status first
    /// if needed.
    ///
    /// Errors of the sink are returned as is and are not retried.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.finalize_head().await;
        self.write_body(chunk)
    }

    /// Pushes out what was written so far.
    ///
    /// While buffering this settles the decision: the buffered bytes are sent
    /// uncompressed and so is the rest of the body. Flush failures are
    /// logged and ignored.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.finalize_head().await;
        self.flush_body()
    }

    /// Ends the response. Must be called exactly once; later calls do
    /// nothing.
    ///
    /// Sends the status if it was never sent, closes the encoder and forwards
    /// whatever is still buffered. If the encoder could not be created, the
    /// error handler renders the response instead.
    pub fn finalize(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.head_finalized = true;

        if let Some(err) = self.pending_error.take() {
            // held bytes are dropped with the buffer
            self.state = State::Done;
            let config = self.config.clone();
            if let Some(handler) = &config.error_handler {
                handler(&err, &self.request, &mut self.sink);
            }
            return Ok(());
        }

        let result = match std::mem::replace(&mut self.state, State::Done) {
            State::Encoding(mut encoder) => {
                self.send_status();
                encoder.close(&mut BodyWriter(&mut self.sink))
            }
            State::Buffering(lease) => {
                trace!(
                    buffered = lease.len(),
                    "response ended below minimum size, sending uncompressed"
                );
                self.decision = Decision::Passthrough;
                self.send_status();
                self.sink.write_body(lease.as_slice())
            }
            State::Undecided => {
                self.decision = Decision::Passthrough;
                self.send_status();
                Ok(())
            }
            State::Passthrough | State::Done => {
                self.send_status();
                Ok(())
            }
        };

        match result {
            Err(e) if self.write_failed => {
                debug!(error = %e, "ignoring error while finishing a failed response");
                Ok(())
            }
            Err(e) => {
                self.write_failed = true;
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Ends the response without sending anything more, releasing the
    /// buffer and dropping the encoder.
    pub fn abort(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.state = State::Done;
        trace!("response aborted");
    }

    /// Whether the current headers leave compression possible. The length
    /// is not considered, so the response may still pass through.
    pub fn may_compress(&self) -> bool {
        ineligible(self.sink.headers(), &self.config).is_none()
    }

    /// The current decision.
    pub fn decision(&self) -> Decision {
        self.decision
    }

    /// The status sent, or to be sent.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Number of body bytes held back while buffering.
    pub fn buffered_len(&self) -> usize {
        match &self.state {
            State::Buffering(lease) => lease.len(),
            _ => 0,
        }
    }

    /// The encoder failure waiting to be rendered by the error handler.
    pub fn pending_error(&self) -> Option<&Error> {
        self.pending_error.as_ref()
    }

    /// Returns true once [`finalize`](Self::finalize) or
    /// [`abort`](Self::abort) ran.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The underlying sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The underlying sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consumes the writer, returning the sink. Any held buffer goes back to
    /// the pool.
    pub fn into_sink(self) -> S {
        self.sink
    }

    pub(crate) fn write_body(&mut self, chunk: &[u8]) -> io::Result<usize> {
        if self.finalized {
            return Err(io::Error::other("write after the response was finalized"));
        }
        self.finalize_head_now();

        let overflow = match &mut self.state {
            State::Buffering(lease) => !lease.try_extend(chunk),
            _ => false,
        };

        let result = if overflow {
            self.spill(chunk)
        } else {
            match &mut self.state {
                State::Encoding(encoder) => encoder.write(chunk, &mut BodyWriter(&mut self.sink)),
                // discarded: the error handler renders the response
                State::Passthrough if self.pending_error.is_some() => Ok(()),
                State::Passthrough => self.sink.write_body(chunk),
                State::Buffering(_) | State::Undecided | State::Done => Ok(()),
            }
        };

        match result {
            Ok(()) => Ok(chunk.len()),
            Err(e) => {
                self.write_failed = true;
                Err(e)
            }
        }
    }

    pub(crate) fn flush_body(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalize_head_now();

        if matches!(self.state, State::Buffering(_)) {
            if let Err(e) = self.drain_buffer() {
                self.write_failed = true;
                return Err(e);
            }
        } else if let State::Encoding(encoder) = &mut self.state {
            if self.encoder_flushes {
                if let Err(e) = encoder.flush(&mut BodyWriter(&mut self.sink)) {
                    debug!(error = %e, "encoder flush failed");
                }
            }
        }

        if self.sink_flushes && self.pending_error.is_none() {
            if let Err(e) = self.sink.flush() {
                debug!(error = %e, "sink flush failed");
            }
        }
        Ok(())
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.pending_error.is_some()
    }

    async fn finalize_head(&mut self) {
        if self.head_finalized {
            return;
        }
        self.head_finalized = true;
        if self.apply_policy() {
            let lease = self.config.pool.acquire(&self.cancel).await;
            self.begin_buffering(lease);
        }
    }

    fn finalize_head_now(&mut self) {
        if self.head_finalized {
            return;
        }
        self.head_finalized = true;
        if self.apply_policy() {
            let lease = self.config.pool.try_acquire();
            self.begin_buffering(lease);
        }
    }

    /// Takes the decision from the headers. Returns true when the response
    /// has to be buffered, which needs a lease first.
    fn apply_policy(&mut self) -> bool {
        match policy(self.sink.headers(), &self.config) {
            Policy::Passthrough(reason) => {
                trace!(reason, "not compressing response");
                self.pass_through();
                false
            }
            Policy::Encode => {
                self.start_encoding();
                false
            }
            Policy::Buffer => true,
        }
    }

    fn begin_buffering(&mut self, lease: Result<BufferLease, Error>) {
        match lease {
            Ok(lease) => {
                trace!(capacity = lease.capacity(), "buffering response");
                self.state = State::Buffering(lease);
                self.decision = Decision::Buffering;
            }
            Err(err) => {
                if err.is_soft() {
                    debug!(error = %err, "no buffer available, sending response uncompressed");
                } else {
                    warn!(error = %err, "cannot buffer response, sending it uncompressed");
                }
                self.pass_through();
            }
        }
    }

    fn pass_through(&mut self) {
        self.state = State::Passthrough;
        self.decision = Decision::Passthrough;
        self.send_status();
    }

    /// Creates the encoder and commits the compressed head. On failure the
    /// response falls back to passthrough, or waits for the error handler.
    fn start_encoding(&mut self) -> bool {
        let encoder = HeaderValue::from_str(&self.encoding.name)
            .map_err(|e| Box::new(e) as crate::error::BoxError)
            .and_then(|value| {
                let ctx = EncoderContext {
                    encoding: &self.encoding.name,
                    cancel: &self.cancel,
                };
                (self.encoding.factory)(&ctx).map(|encoder| (value, encoder))
            });

        match encoder {
            Ok((value, encoder)) => {
                let headers = self.sink.headers_mut();
                headers.remove(header::CONTENT_LENGTH);
                headers.remove(header::ACCEPT_RANGES);
                headers.insert(header::CONTENT_ENCODING, value);

                self.encoder_flushes = encoder.supports_flush();
                self.state = State::Encoding(encoder);
                self.decision = Decision::Encoding;
                self.send_status();
                debug!(encoding = %self.encoding.name, "compressing response");
                true
            }
            Err(source) => {
                let err = Error::EncoderConstruction {
                    encoding: self.encoding.name.clone(),
                    source,
                };
                warn!(error = %err, "cannot compress response");
                if self.config.error_handler.is_some() {
                    self.state = State::Passthrough;
                    self.decision = Decision::Passthrough;
                    self.pending_error = Some(err);
                } else {
                    self.pass_through();
                }
                false
            }
        }
    }

    /// Handles a write that does not fit in the buffer anymore.
    fn spill(&mut self, chunk: &[u8]) -> io::Result<()> {
        let State::Buffering(lease) = std::mem::replace(&mut self.state, State::Passthrough) else {
            return Ok(());
        };
        trace!(
            buffered = lease.len(),
            chunk = chunk.len(),
            "minimum size exceeded"
        );

        if self.start_encoding() {
            if let State::Encoding(encoder) = &mut self.state {
                let mut out = BodyWriter(&mut self.sink);
                if !lease.is_empty() {
                    encoder.write(lease.as_slice(), &mut out)?;
                }
                lease.release();
                encoder.write(chunk, &mut out)?;
            }
            Ok(())
        } else if self.pending_error.is_some() {
            Ok(())
        } else {
            self.sink.write_body(lease.as_slice())?;
            lease.release();
            self.sink.write_body(chunk)
        }
    }

    /// Sends the buffered bytes uncompressed and switches to passthrough.
    fn drain_buffer(&mut self) -> io::Result<()> {
        let State::Buffering(lease) = std::mem::replace(&mut self.state, State::Passthrough) else {
            return Ok(());
        };
        trace!(buffered = lease.len(), "flushed while buffering, sending uncompressed");
        self.decision = Decision::Passthrough;
        self.send_status();
        self.sink.write_body(lease.as_slice())
    }

    fn send_status(&mut self) {
        if !self.status_sent {
            self.status_sent = true;
            self.sink.send_head(self.status);
        }
    }
}

/// Why the headers alone rule out compression, if they do.
fn ineligible(headers: &HeaderMap, config: &Config) -> Option<&'static str> {
    if headers.contains_key(header::CONTENT_ENCODING) {
        Some("content-encoding already set")
    } else if headers.contains_key(header::CONTENT_RANGE) {
        Some("range response")
    } else if !config.allowed.allows_headers(headers) {
        Some("content-type not allowed")
    } else {
        None
    }
}

fn policy(headers: &HeaderMap, config: &Config) -> Policy {
    if let Some(reason) = ineligible(headers, config) {
        return Policy::Passthrough(reason);
    }
    match content_length(headers) {
        Some(len) if len >= config.min_size as u64 => Policy::Encode,
        Some(_) => Policy::Passthrough("below minimum size"),
        None => Policy::Buffer,
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

impl<S> fmt::Debug for CompressionWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionWriter")
            .field("encoding", &self.encoding.name)
            .field("status", &self.status)
            .field("decision", &self.decision)
            .field("status_sent", &self.status_sent)
            .field("pending_error", &self.pending_error)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::tests::{failing_factory, marker_factory};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        headers: HeaderMap,
        statuses: Vec<StatusCode>,
        body: Vec<u8>,
        flushes: usize,
        fail_writes: bool,
    }

    impl ResponseSink for RecordingSink {
        fn headers(&self) -> &HeaderMap {
            &self.headers
        }

        fn headers_mut(&mut self) -> &mut HeaderMap {
            &mut self.headers
        }

        fn send_head(&mut self, status: StatusCode) {
            self.statuses.push(status);
        }

        fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"));
            }
            self.body.extend_from_slice(buf);
            Ok(())
        }

        fn supports_flush(&self) -> bool {
            true
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn config(min_size: usize) -> Arc<Config> {
        Arc::new(Config::new().min_size(min_size).pool_capacity(4))
    }

    fn marker() -> EncoderSpec {
        EncoderSpec {
            name: "marker".into(),
            priority: 1,
            factory: marker_factory(),
        }
    }

    fn failing() -> EncoderSpec {
        EncoderSpec {
            name: "broken".into(),
            priority: 1,
            factory: failing_factory(),
        }
    }

    fn writer(
        headers: &[(&'static str, &'static str)],
        encoding: EncoderSpec,
        config: &Arc<Config>,
    ) -> CompressionWriter<RecordingSink> {
        let mut sink = RecordingSink::default();
        for (name, value) in headers {
            sink.headers.insert(*name, HeaderValue::from_static(*value));
        }
        CompressionWriter::new(sink, encoding, config.clone())
    }

    #[cfg(feature = "gzip")]
    fn gzip() -> EncoderSpec {
        use crate::codec::Codec;
        use compression_core::Level;

        EncoderSpec {
            name: "gzip".into(),
            priority: 100,
            factory: Codec::Gzip.factory(Level::Default),
        }
    }

    #[cfg(feature = "gzip")]
    fn gunzip(data: &[u8]) -> Vec<u8> {
        use std::io::Read;

        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_existing_content_encoding_passes_through() {
        let config = config(15);
        let mut w = writer(
            &[("content-encoding", "br"), ("content-type", "text/plain")],
            marker(),
            &config,
        );

        w.write(b"already compressed bytes").await.unwrap();
        w.finalize().unwrap();

        assert_eq!(w.decision(), Decision::Passthrough);
        let sink = w.into_sink();
        assert_eq!(sink.body, b"already compressed bytes");
        assert_eq!(sink.headers.get("content-encoding").unwrap(), "br");
        assert_eq!(sink.statuses, [StatusCode::OK]);
    }

    #[tokio::test]
    async fn test_known_length_starts_encoding_before_first_write() {
        let config = config(4096);
        let mut w = writer(
            &[("content-type", "text/plain"), ("content-length", "100000")],
            marker(),
            &config,
        );

        w.set_status(StatusCode::BAD_REQUEST).await;
        assert_eq!(w.decision(), Decision::Encoding);
        assert_eq!(w.sink().statuses, [StatusCode::BAD_REQUEST]);
        assert_eq!(w.headers().get("content-encoding").unwrap(), "marker");
        assert!(w.headers().get("content-length").is_none());
        assert_eq!(config.pool().outstanding(), 0);

        w.write(b"abc").await.unwrap();
        w.finalize().unwrap();
        assert_eq!(w.sink().body, b"<abc>!");
        assert_eq!(w.sink().statuses, [StatusCode::BAD_REQUEST]);
    }

    #[tokio::test]
    async fn test_known_length_at_threshold_is_encoded() {
        let config = config(10);
        let mut w = writer(
            &[("content-type", "text/plain"), ("content-length", "10")],
            marker(),
            &config,
        );
        w.set_status(StatusCode::OK).await;
        assert_eq!(w.decision(), Decision::Encoding);
    }

    #[tokio::test]
    async fn test_known_length_below_threshold_passes_through() {
        let config = config(4096);
        let mut w = writer(
            &[("content-type", "text/plain"), ("content-length", "11")],
            marker(),
            &config,
        );

        w.write(b"hello world").await.unwrap();
        w.finalize().unwrap();

        assert_eq!(w.decision(), Decision::Passthrough);
        let sink = w.into_sink();
        assert_eq!(sink.body, b"hello world");
        assert_eq!(sink.headers.get("content-length").unwrap(), "11");
        assert!(sink.headers.get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_disallowed_content_type_passes_through() {
        let config = config(4);
        let mut w = writer(&[("content-type", "image/png")], marker(), &config);

        w.write(b"\x89PNG....").await.unwrap();
        w.write(b"more pixels").await.unwrap();
        w.finalize().unwrap();

        let sink = w.into_sink();
        assert_eq!(sink.body, b"\x89PNG....more pixels");
        assert!(sink.headers.get("content-encoding").is_none());
        assert_eq!(config.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_missing_content_type_passes_through() {
        let config = config(4);
        let mut w = writer(&[], marker(), &config);

        w.write(b"no idea what this is").await.unwrap();
        w.finalize().unwrap();

        assert_eq!(w.decision(), Decision::Passthrough);
        assert_eq!(w.sink().body, b"no idea what this is");
    }

    #[tokio::test]
    async fn test_content_range_passes_through() {
        let config = config(4);
        let mut w = writer(
            &[
                ("content-type", "text/plain"),
                ("content-range", "bytes 0-9/100"),
            ],
            marker(),
            &config,
        );
        w.write(b"0123456789").await.unwrap();
        w.finalize().unwrap();
        assert_eq!(w.sink().body, b"0123456789");
    }

    #[test]
    fn test_may_compress_ignores_length() {
        let config = config(4096);
        let cases = [
            (vec![("content-type", "text/plain")], true),
            (vec![("content-type", "text/plain"), ("content-length", "3")], true),
            (vec![("content-type", "image/png")], false),
            (vec![("content-type", "text/plain"), ("content-encoding", "br")], false),
            (vec![("content-type", "text/plain"), ("content-range", "bytes 0-9/100")], false),
            (vec![], false),
        ];
        for (headers, expected) in cases {
            let w = writer(&headers, marker(), &config);
            assert_eq!(w.may_compress(), expected, "{headers:?}");
        }
    }

    #[tokio::test]
    async fn test_buffer_spills_into_encoder_in_order() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);

        w.write(b"0123456789").await.unwrap();
        assert_eq!(w.decision(), Decision::Buffering);
        assert_eq!(w.buffered_len(), 10);
        assert!(w.sink().statuses.is_empty());
        assert_eq!(config.pool().outstanding(), 1);

        w.write(b"abcdefghij").await.unwrap();
        assert_eq!(w.decision(), Decision::Encoding);
        assert_eq!(w.sink().statuses, [StatusCode::OK]);
        assert_eq!(config.pool().outstanding(), 0);

        w.finalize().unwrap();
        let sink = w.into_sink();
        assert_eq!(sink.body, b"<0123456789><abcdefghij>!");
        assert_eq!(sink.headers.get("content-encoding").unwrap(), "marker");
    }

    #[tokio::test]
    async fn test_small_unknown_length_body_is_untouched() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);

        w.write(b"0123456789").await.unwrap();
        w.finalize().unwrap();

        assert_eq!(w.decision(), Decision::Passthrough);
        let sink = w.into_sink();
        assert_eq!(sink.body, b"0123456789");
        assert!(sink.headers.get("content-encoding").is_none());
        assert_eq!(sink.statuses, [StatusCode::OK]);
        assert_eq!(config.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_filling_buffer_exactly_does_not_spill() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);

        w.write(b"0123456789").await.unwrap();
        w.write(b"abcde").await.unwrap();
        assert_eq!(w.decision(), Decision::Buffering);
        w.finalize().unwrap();

        assert_eq!(w.sink().body, b"0123456789abcde");
    }

    #[tokio::test]
    async fn test_zero_min_size_encodes_first_byte() {
        let config = config(0);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);

        w.write(b"").await.unwrap();
        assert_eq!(w.decision(), Decision::Buffering);
        w.write(b"x").await.unwrap();
        assert_eq!(w.decision(), Decision::Encoding);
        w.finalize().unwrap();
        assert_eq!(w.sink().body, b"<x>!");
    }

    #[tokio::test]
    async fn test_unparseable_length_is_buffered() {
        let config = config(15);
        let mut w = writer(
            &[("content-type", "text/plain"), ("content-length", "lots")],
            marker(),
            &config,
        );
        w.write(b"abc").await.unwrap();
        assert_eq!(w.decision(), Decision::Buffering);
        w.finalize().unwrap();
    }

    #[tokio::test]
    async fn test_finalize_without_writes_sends_status_once() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.finalize().unwrap();
        w.finalize().unwrap();
        assert_eq!(w.sink().statuses, [StatusCode::OK]);
        assert!(w.sink().body.is_empty());

        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.set_status(StatusCode::NO_CONTENT).await;
        assert_eq!(w.decision(), Decision::Buffering);
        w.finalize().unwrap();
        assert_eq!(w.sink().statuses, [StatusCode::NO_CONTENT]);
        assert_eq!(config.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_second_status_is_ignored() {
        let config = config(15);
        let mut w = writer(&[("content-type", "image/png")], marker(), &config);
        w.set_status(StatusCode::CREATED).await;
        w.set_status(StatusCode::ACCEPTED).await;
        w.finalize().unwrap();
        assert_eq!(w.status(), StatusCode::CREATED);
        assert_eq!(w.sink().statuses, [StatusCode::CREATED]);
    }

    #[tokio::test]
    async fn test_write_after_finalize_fails() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.finalize().unwrap();
        assert!(w.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_flush_while_buffering_forces_passthrough() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/event-stream")], marker(), &config);

        w.write(b"data: 1\n\n").await.unwrap();
        assert!(w.sink().statuses.is_empty());
        w.flush().await.unwrap();

        assert_eq!(w.decision(), Decision::Passthrough);
        assert_eq!(w.sink().statuses, [StatusCode::OK]);
        assert_eq!(w.sink().body, b"data: 1\n\n");
        assert_eq!(w.sink().flushes, 1);
        assert_eq!(config.pool().outstanding(), 0);

        w.write(b"data: a much longer event\n\n").await.unwrap();
        w.finalize().unwrap();
        let sink = w.into_sink();
        assert_eq!(sink.body, b"data: 1\n\ndata: a much longer event\n\n");
        assert!(sink.headers.get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_flush_while_encoding() {
        let config = config(1);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);

        w.write(b"ab").await.unwrap();
        w.flush().await.unwrap();
        w.write(b"c").await.unwrap();
        w.finalize().unwrap();

        assert_eq!(w.sink().body, b"<ab>|<c>!");
        assert_eq!(w.sink().flushes, 1);
    }

    #[tokio::test]
    async fn test_encoder_failure_renders_error() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], failing(), &config);

        w.write(b"0123456789").await.unwrap();
        w.write(b"abcdefghij").await.unwrap();
        assert!(w.pending_error().is_some());
        assert!(w.sink().statuses.is_empty());
        assert_eq!(config.pool().outstanding(), 0);

        w.write(b"discarded").await.unwrap();
        w.finalize().unwrap();

        let sink = w.into_sink();
        assert_eq!(sink.statuses, [StatusCode::INTERNAL_SERVER_ERROR]);
        assert_eq!(sink.body, b"cannot create broken encoder: no broken today\n");
        assert!(sink.headers.get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_encoder_failure_with_known_length() {
        let config = config(4);
        let mut w = writer(
            &[("content-type", "text/plain"), ("content-length", "20")],
            failing(),
            &config,
        );

        w.set_status(StatusCode::OK).await;
        assert!(w.sink().statuses.is_empty());
        w.write(b"01234567890123456789").await.unwrap();
        w.finalize().unwrap();

        let sink = w.into_sink();
        assert_eq!(sink.statuses, [StatusCode::INTERNAL_SERVER_ERROR]);
        assert!(sink.headers.get("content-length").is_none());
    }

    #[tokio::test]
    async fn test_custom_error_handler() {
        let config = Arc::new(
            Config::new()
                .min_size(4)
                .error_handler(|err, req, sink| {
                    sink.send_head(StatusCode::SERVICE_UNAVAILABLE);
                    let body = format!("{} {}: {}", req.method, req.uri, err);
                    sink.write_body(body.as_bytes()).unwrap();
                }),
        );
        let request = RequestInfo {
            uri: "/report".parse().unwrap(),
            ..RequestInfo::default()
        };
        let mut w =
            writer(&[("content-type", "text/plain")], failing(), &config).with_request(request);

        w.write(b"0123456789").await.unwrap();
        w.finalize().unwrap();

        assert_eq!(w.sink().statuses, [StatusCode::SERVICE_UNAVAILABLE]);
        assert_eq!(
            w.sink().body,
            b"GET /report: cannot create broken encoder: no broken today"
        );
    }

    #[tokio::test]
    async fn test_encoder_failure_without_handler_passes_through() {
        let config = Arc::new(Config::new().min_size(15).without_error_handler());
        let mut w = writer(&[("content-type", "text/plain")], failing(), &config);

        w.write(b"0123456789").await.unwrap();
        w.write(b"abcdefghij").await.unwrap();
        assert_eq!(w.decision(), Decision::Passthrough);
        w.write(b"!").await.unwrap();
        w.finalize().unwrap();

        let sink = w.into_sink();
        assert_eq!(sink.statuses, [StatusCode::OK]);
        assert_eq!(sink.body, b"0123456789abcdefghij!");
        assert!(sink.headers.get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_invalid_encoding_name_is_a_construction_error() {
        let config = Arc::new(Config::new().min_size(1).without_error_handler());
        let spec = EncoderSpec {
            name: "bad\nname".into(),
            priority: 1,
            factory: marker_factory(),
        };
        let mut w = writer(&[("content-type", "text/plain")], spec, &config);
        w.write(b"abc").await.unwrap();
        w.finalize().unwrap();
        assert_eq!(w.sink().body, b"abc");
    }

    #[tokio::test]
    async fn test_exhausted_pool_falls_back_to_passthrough() {
        let config = Arc::new(
            Config::new()
                .min_size(15)
                .pool_capacity(1)
                .acquire_timeout(Duration::from_millis(10)),
        );
        let held = config.pool().try_acquire().unwrap();

        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.write(b"0123456789").await.unwrap();
        assert_eq!(w.decision(), Decision::Passthrough);
        assert_eq!(w.sink().statuses, [StatusCode::OK]);
        w.finalize().unwrap();
        assert_eq!(w.sink().body, b"0123456789");

        drop(held);
        assert_eq!(config.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_canceled_request_falls_back_to_passthrough() {
        let config = Arc::new(Config::new().min_size(15).pool_capacity(1));
        let _held = config.pool().try_acquire().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut w =
            writer(&[("content-type", "text/plain")], marker(), &config).with_cancellation(cancel);
        w.write(b"0123456789abcdefghij").await.unwrap();
        w.finalize().unwrap();

        assert_eq!(w.decision(), Decision::Passthrough);
        assert_eq!(w.sink().body, b"0123456789abcdefghij");
    }

    #[tokio::test]
    async fn test_sink_failure_is_returned() {
        let config = config(4096);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.sink_mut().fail_writes = true;

        w.write(b"small").await.unwrap();
        assert!(w.flush().await.is_err());
        assert!(w.write(b"more").await.is_err());
        w.finalize().unwrap();
        assert_eq!(config.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_close_error_swallowed_after_write_failure() {
        let config = config(1);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.write(b"ab").await.unwrap();
        w.sink_mut().fail_writes = true;

        assert!(w.write(b"cd").await.is_err());
        assert!(w.finalize().is_ok());
    }

    #[tokio::test]
    async fn test_abort_releases_buffer() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.write(b"0123").await.unwrap();
        assert_eq!(config.pool().outstanding(), 1);

        w.abort();
        assert!(w.is_finalized());
        assert_eq!(config.pool().outstanding(), 0);
        assert!(w.sink().statuses.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_writer_returns_buffer() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], marker(), &config);
        w.write(b"0123").await.unwrap();
        drop(w);
        assert_eq!(config.pool().outstanding(), 0);
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_gzip_known_length_round_trip() {
        let config = config(4096);
        let mut w = writer(
            &[("content-type", "text/plain"), ("content-length", "100000")],
            gzip(),
            &config,
        );
        let body: Vec<u8> = (0..100_000u32).map(|i| b"lorem ipsum "[i as usize % 12]).collect();

        w.set_status(StatusCode::OK).await;
        for chunk in body.chunks(7_000) {
            w.write(chunk).await.unwrap();
        }
        w.finalize().unwrap();

        let sink = w.into_sink();
        assert_eq!(sink.headers.get("content-encoding").unwrap(), "gzip");
        assert!(sink.headers.get("content-length").is_none());
        assert!(sink.body.len() < body.len());
        assert_eq!(gunzip(&sink.body), body);
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_gzip_two_writes_over_threshold() {
        let config = config(15);
        let mut w = writer(&[("content-type", "text/plain")], gzip(), &config);

        w.write(b"0123456789").await.unwrap();
        w.write(b"abcdefghij").await.unwrap();
        w.finalize().unwrap();

        let sink = w.into_sink();
        assert_eq!(sink.headers.get("content-encoding").unwrap(), "gzip");
        assert_eq!(gunzip(&sink.body), b"0123456789abcdefghij");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_gzip_output_independent_of_chunking() {
        let body: Vec<u8> = (0..5_000u32).map(|i| (i % 97) as u8).collect();

        for chunk_size in [1, 7, 15, 16, 999, 5_000] {
            let config = config(15);
            let mut w = writer(&[("content-type", "application/json")], gzip(), &config);
            for chunk in body.chunks(chunk_size) {
                w.write(chunk).await.unwrap();
            }
            w.finalize().unwrap();

            assert_eq!(w.decision(), Decision::Encoding, "chunk size {chunk_size}");
            let sink = w.into_sink();
            assert_eq!(gunzip(&sink.body), body, "chunk size {chunk_size}");
            assert_eq!(config.pool().outstanding(), 0);
        }
    }
}
