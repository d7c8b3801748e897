//! Structured OS boot images (header versions 0 to 2)
//!
//! Little-endian fixed header in the first page, followed by page-aligned
//! slots: kernel, ramdisk, second stage, then the recovery overlay (v1+) and
//! the device tree (v2). Slot offsets are always recomputed from the page
//! size; the only offset the header declares (v1 recovery overlay) is
//! cross-checked against the recomputed one.

use alloc::string::String;
use alloc::vec::Vec;
use stageboot_api::MediaAccess;

use super::ParseContext;
use crate::error::ParseError;
use crate::firmware::MediaReader;
use crate::kernel_if::descriptor::{
    FormatHeader, ImageDescriptor, IntegrityKind, IntegrityRecord, OsImageHeader, PayloadEntry,
    PayloadRole, Segment,
};
use crate::security::digest::HashAlgorithm;
use crate::utils::cursor::{align_up, fixed_str, ByteCursor};

pub const BOOT_MAGIC: &[u8] = b"ANDROID!";

const V0_HEADER_SIZE: usize = 1632;
const V1_HEADER_SIZE: usize = 1648;
const V2_HEADER_SIZE: usize = 1660;
const MAX_HEADER_VERSION: u32 = 2;

const MIN_PAGE_SIZE: u32 = 2048;
const MAX_PAGE_SIZE: u32 = 65536;

const NAME_LEN: usize = 16;
const CMDLINE_LEN: usize = 512;
const ID_LEN: usize = 32;
const EXTRA_CMDLINE_LEN: usize = 1024;

#[derive(Debug, Clone)]
struct RawHeader {
    kernel_size: u32,
    kernel_addr: u32,
    ramdisk_size: u32,
    ramdisk_addr: u32,
    second_size: u32,
    second_addr: u32,
    tags_addr: u32,
    page_size: u32,
    header_version: u32,
    os_version: u32,
    name: [u8; NAME_LEN],
    cmdline: [u8; CMDLINE_LEN],
    id: [u8; ID_LEN],
    extra_cmdline: [u8; EXTRA_CMDLINE_LEN],
    recovery_dtbo_size: u32,
    recovery_dtbo_offset: u64,
    dtb_size: u32,
    dtb_addr: u64,
}

impl RawHeader {
    fn read(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut c = ByteCursor::new(bytes);
        if c.take(BOOT_MAGIC.len())? != BOOT_MAGIC {
            return Err(ParseError::BadMagic);
        }
        let mut raw = Self {
            kernel_size: c.le_u32()?,
            kernel_addr: c.le_u32()?,
            ramdisk_size: c.le_u32()?,
            ramdisk_addr: c.le_u32()?,
            second_size: c.le_u32()?,
            second_addr: c.le_u32()?,
            tags_addr: c.le_u32()?,
            page_size: c.le_u32()?,
            header_version: c.le_u32()?,
            os_version: c.le_u32()?,
            name: c.array()?,
            cmdline: c.array()?,
            id: c.array()?,
            extra_cmdline: c.array()?,
            recovery_dtbo_size: 0,
            recovery_dtbo_offset: 0,
            dtb_size: 0,
            dtb_addr: 0,
        };
        if raw.header_version > MAX_HEADER_VERSION {
            return Err(ParseError::UnsupportedVersion(raw.header_version));
        }
        if raw.header_version >= 1 {
            raw.recovery_dtbo_size = c.le_u32()?;
            raw.recovery_dtbo_offset = c.le_u64()?;
            let declared = c.le_u32()?;
            if declared as usize != header_size(raw.header_version) {
                return Err(ParseError::SlotMismatch);
            }
        }
        if raw.header_version >= 2 {
            raw.dtb_size = c.le_u32()?;
            raw.dtb_addr = c.le_u64()?;
        }
        Ok(raw)
    }

    fn cmdline(&self) -> Result<String, ParseError> {
        let mut text = String::from(fixed_str(&self.cmdline)?);
        text.push_str(fixed_str(&self.extra_cmdline)?);
        Ok(text)
    }
}

fn header_size(version: u32) -> usize {
    match version {
        0 => V0_HEADER_SIZE,
        1 => V1_HEADER_SIZE,
        _ => V2_HEADER_SIZE,
    }
}

/// One page-aligned slot
struct Slot {
    role: PayloadRole,
    offset: u64,
    size: u32,
    load_address: Option<u64>,
}

pub fn parse<M: MediaAccess>(
    reader: &mut MediaReader<'_, M>,
    _ctx: &ParseContext<'_>,
) -> Result<ImageDescriptor, ParseError> {
    let available = reader.len().min(V2_HEADER_SIZE as u64) as usize;
    if available < V0_HEADER_SIZE {
        return Err(ParseError::Truncated);
    }
    let mut bytes = alloc::vec![0u8; available];
    reader.read_exact(0, &mut bytes)?;
    let raw = RawHeader::read(&bytes)?;

    if !raw.page_size.is_power_of_two()
        || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&raw.page_size)
    {
        return Err(ParseError::InvalidPageSize(raw.page_size));
    }
    let page = raw.page_size as u64;

    let mut declared = alloc::vec![
        (PayloadRole::Kernel, raw.kernel_size, Some(raw.kernel_addr as u64)),
        (PayloadRole::Ramdisk, raw.ramdisk_size, Some(raw.ramdisk_addr as u64)),
        (PayloadRole::Second, raw.second_size, Some(raw.second_addr as u64)),
    ];
    if raw.header_version >= 1 {
        declared.push((PayloadRole::RecoveryDtbo, raw.recovery_dtbo_size, None));
    }
    if raw.header_version >= 2 {
        declared.push((PayloadRole::DeviceTree, raw.dtb_size, Some(raw.dtb_addr)));
    }

    // header takes the first page
    let mut offset = page;
    let mut slots = Vec::with_capacity(declared.len());
    for (role, size, load_address) in declared {
        if role == PayloadRole::RecoveryDtbo
            && size != 0
            && raw.recovery_dtbo_offset != offset
        {
            return Err(ParseError::SlotMismatch);
        }
        slots.push(Slot {
            role,
            offset,
            size,
            load_address,
        });
        let end = offset.checked_add(size as u64).ok_or(ParseError::SizeOverflow)?;
        offset = align_up(end, page).ok_or(ParseError::SizeOverflow)?;
    }

    if raw.kernel_size == 0 {
        return Err(ParseError::NoPayload);
    }

    let total_size = slots
        .iter()
        .filter(|s| s.size != 0)
        .map(|s| s.offset + s.size as u64)
        .max()
        .unwrap_or(page);
    if total_size > reader.len() {
        return Err(ParseError::BeyondMedia {
            end: total_size,
            available: reader.len(),
        });
    }

    let payloads = slots
        .iter()
        .filter(|s| s.size != 0)
        .map(|s| {
            let mut payload = PayloadEntry::new(s.role, s.offset, s.size as u64);
            payload.load_address = s.load_address;
            if s.role == PayloadRole::Kernel {
                payload.entry_point = s.load_address;
            }
            payload
        })
        .collect();

    let integrity = match id_record(&raw, &slots) {
        Some(record) => alloc::vec![record],
        None => Vec::new(),
    };

    Ok(ImageDescriptor {
        magic: u64::from_le_bytes(*b"ANDROID!"),
        version: raw.header_version,
        total_size,
        payloads,
        integrity,
        header: FormatHeader::StructuredOs(OsImageHeader {
            page_size: raw.page_size,
            os_version: raw.os_version,
            name: String::from(fixed_str(&raw.name)?),
            cmdline: raw.cmdline()?,
            tags_address: raw.tags_addr as u64,
        }),
    })
}

/// SHA-1 over every slot followed by its little-endian size; `None` when the
/// image carries no id.
fn id_record(raw: &RawHeader, slots: &[Slot]) -> Option<IntegrityRecord> {
    if raw.id.iter().all(|&b| b == 0) {
        return None;
    }
    let digest_len = HashAlgorithm::Sha1.digest_len();
    let mut segments = Vec::with_capacity(slots.len() * 2);
    for slot in slots {
        if slot.size != 0 {
            segments.push(Segment::Media {
                offset: slot.offset,
                length: slot.size as u64,
            });
        }
        segments.push(Segment::Literal(slot.size.to_le_bytes().to_vec()));
    }
    Some(IntegrityRecord {
        name: String::from("id"),
        kind: IntegrityKind::Hash,
        algorithm: HashAlgorithm::Sha1,
        signature_algorithm: None,
        expected: raw.id[..digest_len].to_vec(),
        segments,
        key_id: None,
    })
}
