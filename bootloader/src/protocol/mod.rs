//! Image format detection and header parsing
//!
//! The detector looks only at magic and version fields inside the probe
//! window; lengths declared there are never trusted at this stage. Each
//! detected format has its own typed parser, selected by matching on
//! [`ImageFormatKind`]:
//!
//! - **legacy**: fixed 64-byte header with header and data CRC32
//! - **fit**: component tree image built on a flattened device tree
//! - **android**: structured OS boot image with page-aligned slots

pub mod android;
pub mod fdt;
pub mod fit;
pub mod legacy;

use arrayvec::ArrayVec;
use core::fmt;
use stageboot_api::{Architecture, IoError, MediaAccess};

use crate::boot_stage::boot_config::ParseLimits;
use crate::error::ParseError;
use crate::firmware::MediaReader;
use crate::kernel_if::descriptor::ImageDescriptor;
use crate::utils::cursor::be_u32_at;

/// Largest probe window supported
pub const MAX_PROBE_SIZE: usize = 4096;

/// Supported image formats, in detection priority order.
///
/// The discriminant is the priority: when malformed input could match more
/// than one format, the lowest value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ImageFormatKind {
    Legacy = 0,
    ComponentTree = 1,
    StructuredOsImage = 2,
}

impl ImageFormatKind {
    pub const ALL: [ImageFormatKind; 3] = [
        ImageFormatKind::Legacy,
        ImageFormatKind::ComponentTree,
        ImageFormatKind::StructuredOsImage,
    ];

    /// True when `probe` carries this format's signature
    fn matches(&self, probe: &[u8]) -> bool {
        match self {
            ImageFormatKind::Legacy => be_u32_at(probe, 0) == Ok(legacy::LEGACY_MAGIC),
            ImageFormatKind::ComponentTree => {
                be_u32_at(probe, 0) == Ok(fdt::FDT_MAGIC)
                    && matches!(
                        be_u32_at(probe, fdt::LAST_COMP_VERSION_OFFSET),
                        Ok(v) if v <= fdt::FDT_LAST_COMP_VERSION
                    )
            }
            ImageFormatKind::StructuredOsImage => probe.starts_with(android::BOOT_MAGIC),
        }
    }
}

impl fmt::Display for ImageFormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormatKind::Legacy => write!(f, "legacy image"),
            ImageFormatKind::ComponentTree => write!(f, "component tree image"),
            ImageFormatKind::StructuredOsImage => write!(f, "structured OS image"),
        }
    }
}

/// First bytes of a candidate, read once for classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeBuffer {
    bytes: ArrayVec<u8, MAX_PROBE_SIZE>,
}

impl ProbeBuffer {
    /// Read up to `size` bytes from offset 0; short media give a short probe.
    pub fn read<M: MediaAccess>(
        reader: &mut MediaReader<'_, M>,
        size: usize,
    ) -> Result<Self, IoError> {
        let len = (size.min(MAX_PROBE_SIZE) as u64).min(reader.len()) as usize;
        let mut bytes = ArrayVec::new();
        bytes.extend(core::iter::repeat(0u8).take(len));
        reader.read_exact(0, &mut bytes)?;
        Ok(Self { bytes })
    }

    /// Probe over in-memory bytes; anything past [`MAX_PROBE_SIZE`] is dropped.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut bytes = ArrayVec::new();
        bytes.extend(data.iter().copied().take(MAX_PROBE_SIZE));
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Classify a probe window. First match in priority order wins.
pub fn classify(probe: &ProbeBuffer) -> Option<ImageFormatKind> {
    ImageFormatKind::ALL
        .into_iter()
        .find(|kind| kind.matches(probe.as_bytes()))
}

/// Inputs every parser needs besides the medium
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub limits: &'a ParseLimits,
    pub arch: Architecture,
    /// Component tree configuration override
    pub configuration: Option<&'a str>,
}

/// Parse the image on `reader` as `format`.
///
/// On success the descriptor's declared size and every payload range have
/// been checked against the medium's size.
pub fn parse<M: MediaAccess>(
    format: ImageFormatKind,
    reader: &mut MediaReader<'_, M>,
    ctx: &ParseContext<'_>,
) -> Result<ImageDescriptor, ParseError> {
    let descriptor = match format {
        ImageFormatKind::Legacy => legacy::parse(reader, ctx)?,
        ImageFormatKind::ComponentTree => fit::parse(reader, ctx)?,
        ImageFormatKind::StructuredOsImage => android::parse(reader, ctx)?,
    };
    descriptor.check_bounds(reader.len())?;
    log::debug!(
        "{}: {} payload(s), {} integrity record(s), {:#x} bytes",
        format,
        descriptor.payloads.len(),
        descriptor.integrity.len(),
        descriptor.total_size
    );
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(bytes: &[u8]) -> ProbeBuffer {
        let mut data = [0u8; 64];
        data[..bytes.len()].copy_from_slice(bytes);
        ProbeBuffer::from_bytes(&data)
    }

    #[test]
    fn test_classify_each_magic() {
        assert_eq!(classify(&probe(&[0x27, 0x05, 0x19, 0x56])), Some(ImageFormatKind::Legacy));
        assert_eq!(classify(&probe(b"ANDROID!")), Some(ImageFormatKind::StructuredOsImage));

        let mut fdt = [0u8; 40];
        fdt[..4].copy_from_slice(&[0xd0, 0x0d, 0xfe, 0xed]);
        fdt[24..28].copy_from_slice(&16u32.to_be_bytes());
        assert_eq!(classify(&probe(&fdt)), Some(ImageFormatKind::ComponentTree));
    }

    #[test]
    fn test_classify_rejects_future_tree_version() {
        let mut fdt = [0u8; 40];
        fdt[..4].copy_from_slice(&[0xd0, 0x0d, 0xfe, 0xed]);
        fdt[24..28].copy_from_slice(&18u32.to_be_bytes());
        assert_eq!(classify(&probe(&fdt)), None);
    }

    #[test]
    fn test_classify_unknown_and_short() {
        assert_eq!(classify(&probe(b"\x7fELF")), None);
        assert_eq!(classify(&ProbeBuffer::from_bytes(&[0x27, 0x05])), None);
        assert_eq!(classify(&ProbeBuffer::from_bytes(&[])), None);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let p = probe(b"ANDROID!");
        assert_eq!(classify(&p), classify(&p));
    }

    #[test]
    fn test_priority_order() {
        assert!(ImageFormatKind::Legacy < ImageFormatKind::ComponentTree);
        assert!(ImageFormatKind::ComponentTree < ImageFormatKind::StructuredOsImage);
    }
}
