//! Payload decompression

use core::fmt;

/// Compression applied to a payload on media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionKind {
    None = 0,
    Gzip = 1,
    Bzip2 = 2,
    Lzma = 3,
    Lzo = 4,
    Lz4 = 5,
    Zstd = 6,
}

impl CompressionKind {
    /// Legacy image header encoding
    pub fn from_legacy(code: u8) -> Option<Self> {
        match code {
            0 => Some(CompressionKind::None),
            1 => Some(CompressionKind::Gzip),
            2 => Some(CompressionKind::Bzip2),
            3 => Some(CompressionKind::Lzma),
            4 => Some(CompressionKind::Lzo),
            5 => Some(CompressionKind::Lz4),
            6 => Some(CompressionKind::Zstd),
            _ => None,
        }
    }

    /// Component tree `compression` property value
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionKind::None),
            "gzip" => Some(CompressionKind::Gzip),
            "bzip2" => Some(CompressionKind::Bzip2),
            "lzma" => Some(CompressionKind::Lzma),
            "lzo" => Some(CompressionKind::Lzo),
            "lz4" => Some(CompressionKind::Lz4),
            "zstd" => Some(CompressionKind::Zstd),
            _ => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != CompressionKind::None
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Bzip2 => "bzip2",
            CompressionKind::Lzma => "lzma",
            CompressionKind::Lzo => "lzo",
            CompressionKind::Lz4 => "lz4",
            CompressionKind::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Decompression failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    Unsupported(CompressionKind),
    Corrupt,
    /// Output would not fit the destination window
    OutputTooLarge,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Unsupported(kind) => write!(f, "{} decompression not available", kind),
            CodecError::Corrupt => write!(f, "corrupt compressed stream"),
            CodecError::OutputTooLarge => write!(f, "decompressed output exceeds window"),
        }
    }
}

/// Decompressor collaborator.
pub trait Decompressor {
    /// Decompress `src` into `dst`; returns the number of bytes produced.
    fn decompress(
        &mut self,
        kind: CompressionKind,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, CodecError>;
}

/// Builds without any codec; compressed payloads fail to load.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCodec;

impl Decompressor for NoCodec {
    fn decompress(
        &mut self,
        kind: CompressionKind,
        _src: &[u8],
        _dst: &mut [u8],
    ) -> Result<usize, CodecError> {
        Err(CodecError::Unsupported(kind))
    }
}
