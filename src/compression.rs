//! Streaming and one-shot compression for blob payloads.
//! Gzip and zlib via flate2; `none` is an identity wrapper so pipelines can
//! stay shape-identical whether or not compression is on.

use std::io::{Read, Write};

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::error_handling::{utils as errors, TransferError};

/// Payloads below this size are not worth compressing.
pub const DEFAULT_MIN_COMPRESS_SIZE: usize = 1024;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Supported compression codecs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionType {
    None,
    Gzip,
    Zlib,
}

impl CompressionType {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zlib => "zlib",
        }
    }

    /// Parse a codec name. Unknown names are an invalid-input error.
    pub fn parse(name: &str) -> Result<Self, TransferError> {
        match name {
            "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "zlib" => Ok(CompressionType::Zlib),
            other => Err(errors::invalid_input(
                "parse_compression_type",
                &format!("unknown compression type: {}", other),
            )),
        }
    }
}

/// Options for one-shot and streaming compression
#[derive(Clone, Copy, Debug)]
pub struct CompressionOptions {
    pub ctype: CompressionType,
    /// flate2 level, 0 (store) to 9 (best)
    pub level: u32,
    /// Inputs shorter than this are passed through unchanged
    pub min_size: usize,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            ctype: CompressionType::Gzip,
            level: DEFAULT_COMPRESSION_LEVEL,
            min_size: DEFAULT_MIN_COMPRESS_SIZE,
        }
    }
}

enum EncoderKind<W: Write> {
    Plain(Option<W>),
    Gzip(Option<GzEncoder<W>>),
    Zlib(Option<ZlibEncoder<W>>),
}

/// Streaming compressor: bytes written come out compressed on the sink.
pub struct CompressingWriter<W: Write> {
    encoder: EncoderKind<W>,
}

impl<W: Write> CompressingWriter<W> {
    pub fn new(sink: W, opts: &CompressionOptions) -> Self {
        let level = Compression::new(opts.level.min(9));
        let encoder = match opts.ctype {
            CompressionType::None => EncoderKind::Plain(Some(sink)),
            CompressionType::Gzip => EncoderKind::Gzip(Some(GzEncoder::new(sink, level))),
            CompressionType::Zlib => EncoderKind::Zlib(Some(ZlibEncoder::new(sink, level))),
        };
        Self { encoder }
    }

    /// Finish the stream (writing trailers) and return the sink.
    pub fn finish(mut self) -> Result<W, TransferError> {
        match &mut self.encoder {
            EncoderKind::Plain(sink) => sink
                .take()
                .ok_or_else(|| errors::invalid_input("finish_compressor", "already finished")),
            EncoderKind::Gzip(encoder) => encoder
                .take()
                .ok_or_else(|| errors::invalid_input("finish_compressor", "already finished"))?
                .finish()
                .map_err(|e| errors::io_error("finish_compressor", Some("gzip"), e)),
            EncoderKind::Zlib(encoder) => encoder
                .take()
                .ok_or_else(|| errors::invalid_input("finish_compressor", "already finished"))?
                .finish()
                .map_err(|e| errors::io_error("finish_compressor", Some("zlib"), e)),
        }
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match &mut self.encoder {
            EncoderKind::Plain(Some(sink)) => sink.write(data),
            EncoderKind::Gzip(Some(encoder)) => encoder.write(data),
            EncoderKind::Zlib(Some(encoder)) => encoder.write(data),
            _ => Ok(0),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.encoder {
            EncoderKind::Plain(Some(sink)) => sink.flush(),
            EncoderKind::Gzip(Some(encoder)) => encoder.flush(),
            EncoderKind::Zlib(Some(encoder)) => encoder.flush(),
            _ => Ok(()),
        }
    }
}

enum DecoderKind<R: Read> {
    Plain(R),
    // MultiGzDecoder: parallel-compressed blobs are concatenated gzip members.
    Gzip(MultiGzDecoder<R>),
    Zlib(ZlibDecoder<R>),
}

/// Streaming decompressor: reads yield decompressed bytes from the source.
pub struct DecompressingReader<R: Read> {
    decoder: DecoderKind<R>,
}

impl<R: Read> DecompressingReader<R> {
    pub fn new(source: R, ctype: CompressionType) -> Self {
        let decoder = match ctype {
            CompressionType::None => DecoderKind::Plain(source),
            CompressionType::Gzip => DecoderKind::Gzip(MultiGzDecoder::new(source)),
            CompressionType::Zlib => DecoderKind::Zlib(ZlibDecoder::new(source)),
        };
        Self { decoder }
    }
}

impl<R: Read> Read for DecompressingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.decoder {
            DecoderKind::Plain(source) => source.read(out),
            DecoderKind::Gzip(decoder) => decoder.read(out),
            DecoderKind::Zlib(decoder) => decoder.read(out),
        }
    }
}

/// One-shot compression. Returns the input unchanged when the codec is `none`
/// or the payload is below `min_size`.
pub fn compress_bytes(data: &[u8], opts: &CompressionOptions) -> Result<Vec<u8>, TransferError> {
    if opts.ctype == CompressionType::None || data.len() < opts.min_size {
        return Ok(data.to_vec());
    }
    let mut writer = CompressingWriter::new(Vec::with_capacity(data.len() / 2), opts);
    writer
        .write_all(data)
        .map_err(|e| errors::io_error("compress_bytes", Some(opts.ctype.name()), e))?;
    writer.finish()
}

/// One-shot decompression of a full payload.
pub fn decompress_bytes(data: &[u8], ctype: CompressionType) -> Result<Vec<u8>, TransferError> {
    if ctype == CompressionType::None {
        return Ok(data.to_vec());
    }
    let mut reader = DecompressingReader::new(data, ctype);
    let mut out = Vec::with_capacity(data.len() * 2);
    reader
        .read_to_end(&mut out)
        .map_err(|e| errors::io_error("decompress_bytes", Some(ctype.name()), e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789"
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_parse_codec_names() {
        assert_eq!(CompressionType::parse("gzip").unwrap(), CompressionType::Gzip);
        assert_eq!(CompressionType::parse("zlib").unwrap(), CompressionType::Zlib);
        assert_eq!(CompressionType::parse("none").unwrap(), CompressionType::None);
        let err = CompressionType::parse("brotli").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = sample(100_000);
        let opts = CompressionOptions::default();
        let compressed = compress_bytes(&data, &opts).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_bytes(&compressed, CompressionType::Gzip).unwrap(), data);
    }

    #[test]
    fn test_zlib_round_trip() {
        let data = sample(50_000);
        let opts = CompressionOptions {
            ctype: CompressionType::Zlib,
            ..Default::default()
        };
        let compressed = compress_bytes(&data, &opts).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_bytes(&compressed, CompressionType::Zlib).unwrap(), data);
    }

    #[test]
    fn test_small_inputs_pass_through() {
        let data = b"tiny manifest".to_vec();
        let opts = CompressionOptions::default();
        assert_eq!(compress_bytes(&data, &opts).unwrap(), data);
    }

    #[test]
    fn test_none_is_identity() {
        let data = sample(10_000);
        let opts = CompressionOptions {
            ctype: CompressionType::None,
            ..Default::default()
        };
        assert_eq!(compress_bytes(&data, &opts).unwrap(), data);
        assert_eq!(decompress_bytes(&data, CompressionType::None).unwrap(), data);
    }

    #[test]
    fn test_streaming_writer_reader_round_trip() {
        let data = sample(200_000);
        let opts = CompressionOptions::default();
        let mut writer = CompressingWriter::new(Vec::new(), &opts);
        // Write in uneven slices to exercise the streaming path.
        for chunk in data.chunks(7_777) {
            writer.write_all(chunk).unwrap();
        }
        let compressed = writer.finish().unwrap();

        let mut reader = DecompressingReader::new(&compressed[..], CompressionType::Gzip);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_corrupt_stream_is_an_error() {
        let garbage = vec![0x1fu8, 0x8b, 0x00, 0xff, 0x12, 0x34];
        assert!(decompress_bytes(&garbage, CompressionType::Gzip).is_err());
    }
}
