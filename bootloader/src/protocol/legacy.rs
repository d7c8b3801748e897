//! Legacy image format
//!
//! 64-byte big-endian header followed by the data area. The header carries
//! its own CRC32 (computed with the CRC field zeroed), which is checked here
//! before any other field is believed. The data CRC32 becomes an integrity
//! record for the verifier.
//!
//! Multi-file images start the data area with a zero-terminated list of
//! big-endian sizes; each file follows, padded to four bytes.

use alloc::string::String;
use alloc::vec::Vec;
use stageboot_api::{CompressionKind, MediaAccess};

use super::ParseContext;
use crate::error::ParseError;
use crate::firmware::MediaReader;
use crate::kernel_if::descriptor::{
    FormatHeader, ImageDescriptor, IntegrityKind, IntegrityRecord, LegacyHeader, PayloadEntry,
    PayloadRole,
};
use crate::security::checksum::crc32;
use crate::security::digest::HashAlgorithm;
use crate::utils::cursor::{align_up, fixed_str, ByteCursor};

pub const LEGACY_MAGIC: u32 = 0x2705_1956;
pub const HEADER_SIZE: usize = 64;
const HCRC_OFFSET: usize = 4;

/// Image types
pub mod image_type {
    pub const STANDALONE: u8 = 1;
    pub const KERNEL: u8 = 2;
    pub const RAMDISK: u8 = 3;
    pub const MULTI: u8 = 4;
    pub const FIRMWARE: u8 = 5;
    pub const FLATDT: u8 = 8;
    pub const KERNEL_NOLOAD: u8 = 14;
}

/// Raw header fields, in on-media order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawHeader {
    magic: u32,
    hcrc: u32,
    time: u32,
    size: u32,
    load: u32,
    ep: u32,
    dcrc: u32,
    os: u8,
    arch: u8,
    image_type: u8,
    comp: u8,
    name: [u8; 32],
}

impl RawHeader {
    fn read(bytes: &[u8; HEADER_SIZE]) -> Result<Self, ParseError> {
        let mut c = ByteCursor::new(bytes);
        Ok(Self {
            magic: c.be_u32()?,
            hcrc: c.be_u32()?,
            time: c.be_u32()?,
            size: c.be_u32()?,
            load: c.be_u32()?,
            ep: c.be_u32()?,
            dcrc: c.be_u32()?,
            os: c.u8()?,
            arch: c.u8()?,
            image_type: c.u8()?,
            comp: c.u8()?,
            name: c.array()?,
        })
    }
}

/// CRC32 of the header with the header-CRC field zeroed
pub fn header_checksum(header: &[u8; HEADER_SIZE]) -> u32 {
    let mut copy = *header;
    copy[HCRC_OFFSET..HCRC_OFFSET + 4].fill(0);
    crc32(&copy)
}

pub fn parse<M: MediaAccess>(
    reader: &mut MediaReader<'_, M>,
    ctx: &ParseContext<'_>,
) -> Result<ImageDescriptor, ParseError> {
    if reader.len() < HEADER_SIZE as u64 {
        return Err(ParseError::Truncated);
    }
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(0, &mut bytes)?;

    let raw = RawHeader::read(&bytes)?;
    if raw.magic != LEGACY_MAGIC {
        return Err(ParseError::BadMagic);
    }
    let actual = header_checksum(&bytes);
    if actual != raw.hcrc {
        return Err(ParseError::HeaderChecksum {
            expected: raw.hcrc,
            actual,
        });
    }

    // header is trustworthy from here on
    if raw.arch != ctx.arch.legacy_code() {
        return Err(ParseError::ArchitectureMismatch);
    }
    let compression =
        CompressionKind::from_legacy(raw.comp).ok_or(ParseError::UnsupportedCompression)?;
    let data_offset = HEADER_SIZE as u64;
    let data_size = raw.size as u64;
    let total_size = data_offset + data_size;
    if total_size > reader.len() {
        return Err(ParseError::BeyondMedia {
            end: total_size,
            available: reader.len(),
        });
    }

    let payloads = match raw.image_type {
        image_type::MULTI => multi_payloads(reader, ctx, &raw, compression)?,
        other => {
            let role = match other {
                image_type::STANDALONE => PayloadRole::Standalone,
                image_type::KERNEL | image_type::KERNEL_NOLOAD => PayloadRole::Kernel,
                image_type::FIRMWARE => PayloadRole::Firmware,
                image_type::RAMDISK => PayloadRole::Ramdisk,
                image_type::FLATDT => PayloadRole::DeviceTree,
                unsupported => return Err(ParseError::UnsupportedImageType(unsupported)),
            };
            let mut payload = PayloadEntry::new(role, data_offset, data_size);
            payload.compression = compression;
            if other == image_type::KERNEL_NOLOAD {
                // runs wherever it is placed; entry is relative to the image
                payload.entry_point = Some(raw.ep as u64);
            } else {
                payload.load_address = Some(raw.load as u64);
                if role.is_executable() {
                    payload.entry_point = Some(raw.ep as u64);
                }
            }
            alloc::vec![payload]
        }
    };

    let integrity = alloc::vec![IntegrityRecord::over_range(
        String::from("data"),
        IntegrityKind::Crc32,
        HashAlgorithm::Crc32,
        raw.dcrc.to_be_bytes().to_vec(),
        data_offset,
        data_size,
    )];

    Ok(ImageDescriptor {
        magic: raw.magic as u64,
        version: 0,
        total_size,
        payloads,
        integrity,
        header: FormatHeader::Legacy(LegacyHeader {
            name: String::from(fixed_str(&raw.name)?),
            timestamp: raw.time,
            os: raw.os,
            arch: raw.arch,
            image_type: raw.image_type,
            header_crc: raw.hcrc,
        }),
    })
}

/// Split a multi-file data area into payloads.
fn multi_payloads<M: MediaAccess>(
    reader: &mut MediaReader<'_, M>,
    ctx: &ParseContext<'_>,
    raw: &RawHeader,
    compression: CompressionKind,
) -> Result<Vec<PayloadEntry>, ParseError> {
    let data_offset = HEADER_SIZE as u64;
    let data_end = data_offset + raw.size as u64;

    let mut sizes = Vec::new();
    let mut pos = data_offset;
    loop {
        if pos + 4 > data_end {
            return Err(ParseError::InconsistentSizes);
        }
        let mut word = [0u8; 4];
        reader.read_cached(pos, &mut word)?;
        pos += 4;
        let size = u32::from_be_bytes(word);
        if size == 0 {
            break;
        }
        if sizes.len() == ctx.limits.max_components {
            return Err(ParseError::TooManyComponents);
        }
        sizes.push(size as u64);
    }
    if sizes.is_empty() {
        return Err(ParseError::NoPayload);
    }

    let mut payloads = Vec::with_capacity(sizes.len());
    for (index, &size) in sizes.iter().enumerate() {
        let end = pos.checked_add(size).ok_or(ParseError::SizeOverflow)?;
        if end > data_end {
            return Err(ParseError::InconsistentSizes);
        }
        let role = match index {
            0 => PayloadRole::Kernel,
            1 => PayloadRole::Ramdisk,
            2 => PayloadRole::DeviceTree,
            _ => PayloadRole::Loadable,
        };
        let mut payload = PayloadEntry::new(role, pos, size);
        if index == 0 {
            payload.load_address = Some(raw.load as u64);
            payload.entry_point = Some(raw.ep as u64);
            payload.compression = compression;
        }
        payloads.push(payload);
        pos = align_up(end, 4).ok_or(ParseError::SizeOverflow)?;
    }
    Ok(payloads)
}
