//! Stream compression applied uniformly to checkpoint files.

use super::file_manager::CancellableStream;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, Read, Write};

/// Codec wrapped around the raw changelog bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
}

impl CompressionCodec {
    /// Wrap an output stream.
    pub fn wrap_output(self, stream: Box<dyn CancellableStream>) -> CompressedWriter {
        match self {
            CompressionCodec::None => CompressedWriter::Plain(stream),
            CompressionCodec::Gzip => {
                CompressedWriter::Gzip(GzEncoder::new(stream, Compression::default()))
            }
        }
    }

    /// Wrap an input stream.
    pub fn wrap_input(self, input: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
        match self {
            CompressionCodec::None => input,
            CompressionCodec::Gzip => Box::new(BufReader::new(GzDecoder::new(input))),
        }
    }
}

/// Output stream with the codec applied.
pub enum CompressedWriter {
    Plain(Box<dyn CancellableStream>),
    Gzip(GzEncoder<Box<dyn CancellableStream>>),
}

impl CompressedWriter {
    /// Write the codec trailer and hand back the underlying stream.
    pub fn finish(self) -> io::Result<Box<dyn CancellableStream>> {
        match self {
            CompressedWriter::Plain(stream) => Ok(stream),
            CompressedWriter::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(stream) => stream.write(buf),
            CompressedWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(stream) => stream.flush(),
            CompressedWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}
