use crate::encoder::{EncoderFactory, StreamEncoder, encoder_factory};
use crate::error::Error;
#[cfg(feature = "brotli")]
use compression_codecs::brotli::{BrotliEncoder, params::EncoderParams as BrotliParams};
#[cfg(feature = "deflate")]
use compression_codecs::deflate::DeflateEncoder;
#[cfg(feature = "gzip")]
use compression_codecs::gzip::GzipEncoder;
#[cfg(feature = "zstd")]
use compression_codecs::zstd::ZstdEncoder;
use compression_codecs::EncodeV2;
use compression_core::Level;
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::io;

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

/// Built-in compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Zstd compression.
    #[cfg(feature = "zstd")]
    Zstd,
    /// Brotli compression.
    #[cfg(feature = "brotli")]
    Brotli,
    /// Gzip compression.
    #[cfg(feature = "gzip")]
    Gzip,
    /// Deflate compression.
    #[cfg(feature = "deflate")]
    Deflate,
}

impl Codec {
    /// Returns the Content-Encoding header value for this codec.
    pub fn content_encoding(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => "zstd",
            #[cfg(feature = "brotli")]
            Codec::Brotli => "br",
            #[cfg(feature = "gzip")]
            Codec::Gzip => "gzip",
            #[cfg(feature = "deflate")]
            Codec::Deflate => "deflate",
        }
    }

    /// Creates a new encoder for this codec.
    ///
    /// Gzip and deflate accept `Level::Precise` values from 0 to 9, zstd from
    /// 1 to 22. Brotli always runs with its default parameters.
    pub fn encoder(&self, level: Level) -> Result<CodecEncoder, Error> {
        let encoder: Box<dyn EncodeV2 + Send> = match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => Box::new(ZstdEncoder::new(self.zstd_level(level)?)),
            #[cfg(feature = "brotli")]
            Codec::Brotli => Box::new(BrotliEncoder::new(BrotliParams::default())),
            #[cfg(feature = "gzip")]
            Codec::Gzip => Box::new(GzipEncoder::new(self.flate_level(level)?.into())),
            #[cfg(feature = "deflate")]
            Codec::Deflate => Box::new(DeflateEncoder::new(self.flate_level(level)?.into())),
        };
        Ok(CodecEncoder::new(encoder))
    }

    /// Returns a factory creating encoders of this codec at `level`.
    pub fn factory(self, level: Level) -> EncoderFactory {
        encoder_factory(move |_| Ok(Box::new(self.encoder(level)?)))
    }

    #[allow(dead_code)]
    fn flate_level(&self, level: Level) -> Result<Level, Error> {
        match level {
            Level::Precise(n) if !(0..=9).contains(&n) => Err(self.invalid(level)),
            level => Ok(level),
        }
    }

    #[allow(dead_code)]
    fn zstd_level(&self, level: Level) -> Result<i32, Error> {
        match level {
            Level::Fastest => Ok(1),
            Level::Best => Ok(19),
            Level::Precise(n) if (1..=22).contains(&n) => Ok(n),
            Level::Precise(_) => Err(self.invalid(level)),
            _ => Ok(3),
        }
    }

    #[allow(dead_code)]
    fn invalid(&self, level: Level) -> Error {
        Error::InvalidLevel {
            encoding: self.content_encoding(),
            level,
        }
    }
}

/// A [`StreamEncoder`] backed by one of the built-in codecs.
pub struct CodecEncoder {
    encoder: Box<dyn EncodeV2 + Send>,
    output_buffer: Vec<u8>,
}

impl CodecEncoder {
    fn new(encoder: Box<dyn EncodeV2 + Send>) -> Self {
        Self {
            encoder,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
        }
    }
}

impl StreamEncoder for CodecEncoder {
    fn write(&mut self, chunk: &[u8], sink: &mut dyn io::Write) -> io::Result<()> {
        let mut input_buf = PartialBuffer::new(chunk);

        // Keep encoding until all input is consumed
        loop {
            let consumed = input_buf.written_len();
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            self.encoder.encode(&mut input_buf, &mut output)?;

            let written = output.written_len();
            if written > 0 {
                sink.write_all(&self.output_buffer[..written])?;
            }

            if input_buf.written_len() >= chunk.len() {
                return Ok(());
            }

            if written == 0 && input_buf.written_len() == consumed {
                return Err(io::Error::other("encoder made no progress"));
            }
        }
    }

    fn supports_flush(&self) -> bool {
        true
    }

    fn flush(&mut self, sink: &mut dyn io::Write) -> io::Result<()> {
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.flush(&mut output)?;
            let written = output.written_len();
            if written > 0 {
                sink.write_all(&self.output_buffer[..written])?;
            }
            if done {
                return Ok(());
            }
        }
    }

    fn close(&mut self, sink: &mut dyn io::Write) -> io::Result<()> {
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.finish(&mut output)?;
            let written = output.written_len();
            if written > 0 {
                sink.write_all(&self.output_buffer[..written])?;
            }
            if done {
                return Ok(());
            }
        }
    }
}
