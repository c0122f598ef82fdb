use std::borrow::Cow;
use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use super::Compression;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

pub const DEFAULT_GZIP_LEVEL: i32 = 6;
pub const DEFAULT_ZSTD_LEVEL: i32 = zstd::DEFAULT_COMPRESSION_LEVEL;

/// Encoding of a layer payload as it sits in memory or in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadFormat {
    Tar,
    Gzip,
    Zstd,
}

impl PayloadFormat {
    /// Sniffs the stream magic. Anything that is neither gzip nor zstd is
    /// treated as a plain tar stream.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            PayloadFormat::Gzip
        } else if data.starts_with(&ZSTD_MAGIC) {
            PayloadFormat::Zstd
        } else {
            PayloadFormat::Tar
        }
    }

    pub fn compression(self) -> Compression {
        match self {
            PayloadFormat::Tar => Compression::Uncompressed,
            PayloadFormat::Gzip => Compression::Gzip,
            PayloadFormat::Zstd => Compression::Zstd,
        }
    }
}

/// Decodes `data` to the raw tar stream it wraps.
pub fn decode(data: &[u8], format: PayloadFormat) -> io::Result<Cow<'_, [u8]>> {
    match format {
        PayloadFormat::Tar => Ok(Cow::Borrowed(data)),
        PayloadFormat::Gzip => {
            let mut decoder = MultiGzDecoder::new(data);
            let mut raw = Vec::new();
            decoder.read_to_end(&mut raw)?;
            Ok(Cow::Owned(raw))
        }
        PayloadFormat::Zstd => Ok(Cow::Owned(zstd::stream::decode_all(data)?)),
    }
}

/// Encodes a raw tar stream. The gzip header is written without a
/// timestamp so identical input always yields identical bytes.
pub fn encode(raw: &[u8], format: PayloadFormat, level: Option<i32>) -> io::Result<Vec<u8>> {
    match format {
        PayloadFormat::Tar => Ok(raw.to_vec()),
        PayloadFormat::Gzip => {
            let level = level.unwrap_or(DEFAULT_GZIP_LEVEL).clamp(0, 9) as u32;
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(raw)?;
            encoder.finish()
        }
        PayloadFormat::Zstd => zstd::stream::encode_all(raw, level.unwrap_or(DEFAULT_ZSTD_LEVEL)),
    }
}
