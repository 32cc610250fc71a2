use crate::error::BoxError;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A streaming compressor.
///
/// The encoder never owns the response: the sink receiving the compressed
/// bytes is handed in on every call.
pub trait StreamEncoder: Send {
    /// Compresses `chunk`, writing whatever output is ready to `sink`.
    fn write(&mut self, chunk: &[u8], sink: &mut dyn io::Write) -> io::Result<()>;

    /// Whether [`flush`](Self::flush) does anything for this format.
    fn supports_flush(&self) -> bool {
        false
    }

    /// Forces out everything compressed so far at a format-appropriate
    /// boundary, without ending the stream.
    fn flush(&mut self, _sink: &mut dyn io::Write) -> io::Result<()> {
        Ok(())
    }

    /// Ends the stream, writing pending output and the format trailer.
    fn close(&mut self, sink: &mut dyn io::Write) -> io::Result<()>;
}

/// What a factory gets to know about the response it builds an encoder for.
#[derive(Debug, Clone, Copy)]
pub struct EncoderContext<'a> {
    /// The negotiated encoding name.
    pub encoding: &'a str,
    /// Fires when the request is abandoned.
    pub cancel: &'a CancellationToken,
}

/// Builds a [`StreamEncoder`] for one response.
pub type EncoderFactory =
    Arc<dyn Fn(&EncoderContext<'_>) -> Result<Box<dyn StreamEncoder>, BoxError> + Send + Sync>;

/// Turns a closure into an [`EncoderFactory`].
pub fn encoder_factory<F>(f: F) -> EncoderFactory
where
    F: Fn(&EncoderContext<'_>) -> Result<Box<dyn StreamEncoder>, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A registered encoding.
#[derive(Clone)]
pub struct EncoderSpec {
    /// Content-Encoding token, e.g. `gzip`.
    pub name: String,
    /// Lower values are preferred when the client has no preference.
    pub priority: i32,
    /// Creates the encoder.
    pub factory: EncoderFactory,
}

impl fmt::Debug for EncoderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderSpec")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// The set of encodings the layer can produce.
///
/// Registering a name twice replaces the earlier entry.
#[derive(Clone, Default)]
pub struct EncoderRegistry {
    encoders: HashMap<String, EncoderSpec>,
    ordered: Vec<String>,
}

impl EncoderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`.
    pub fn register(&mut self, name: impl Into<String>, priority: i32, factory: EncoderFactory) {
        let name = name.into();
        self.encoders.insert(
            name.clone(),
            EncoderSpec {
                name,
                priority,
                factory,
            },
        );
        self.reorder();
    }

    /// Removes `name`, returning its entry if it was registered.
    pub fn remove(&mut self, name: &str) -> Option<EncoderSpec> {
        let removed = self.encoders.remove(name);
        if removed.is_some() {
            self.reorder();
        }
        removed
    }

    /// Looks up an encoding by name.
    pub fn get(&self, name: &str) -> Option<&EncoderSpec> {
        self.encoders.get(name)
    }

    /// Registered names, most preferred first.
    pub fn names(&self) -> &[String] {
        &self.ordered
    }

    /// Number of registered encodings.
    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    /// Returns true if no encoding is registered.
    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }

    fn reorder(&mut self) {
        let mut specs: Vec<&EncoderSpec> = self.encoders.values().collect();
        // name as tie-breaker keeps the order independent of hashing
        specs.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        self.ordered = specs.into_iter().map(|spec| spec.name.clone()).collect();
    }
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ordered.iter().filter_map(|name| self.encoders.get(name)))
            .finish()
    }
}
