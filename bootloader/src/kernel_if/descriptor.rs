//! Format-agnostic image descriptor
//!
//! Every header parser converges on [`ImageDescriptor`]: a list of payloads
//! with their placement hints, the integrity records that cover them, and a
//! per-format header for the few fields only one format has. Everything
//! downstream of parsing (verifier, planner, loader) works on this shape
//! alone.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use stageboot_api::CompressionKind;

use crate::error::ParseError;
use crate::protocol::ImageFormatKind;
use crate::security::digest::HashAlgorithm;
use crate::security::signature::SignatureAlgorithm;

/// What a payload is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadRole {
    Kernel,
    /// Next-stage firmware image
    Firmware,
    /// Standalone program
    Standalone,
    Ramdisk,
    DeviceTree,
    /// Second-stage bootloader slot
    Second,
    /// Recovery device tree overlay
    RecoveryDtbo,
    Loadable,
}

impl PayloadRole {
    /// Roles that can supply the handoff entry point
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            PayloadRole::Kernel | PayloadRole::Firmware | PayloadRole::Standalone
        )
    }
}

impl fmt::Display for PayloadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadRole::Kernel => write!(f, "kernel"),
            PayloadRole::Firmware => write!(f, "firmware"),
            PayloadRole::Standalone => write!(f, "standalone"),
            PayloadRole::Ramdisk => write!(f, "ramdisk"),
            PayloadRole::DeviceTree => write!(f, "fdt"),
            PayloadRole::Second => write!(f, "second"),
            PayloadRole::RecoveryDtbo => write!(f, "recovery-dtbo"),
            PayloadRole::Loadable => write!(f, "loadable"),
        }
    }
}

/// One loadable blob inside the image.
///
/// `offset`/`length` are relative to the candidate's image offset on the
/// medium and have already been checked against the medium's size.
/// `entry_point` is an absolute address when `load_address` is set, and an
/// offset from the start of the placed payload when it is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    pub role: PayloadRole,
    /// Component name, where the format has one
    pub name: Option<String>,
    pub offset: u64,
    pub length: u64,
    pub load_address: Option<u64>,
    pub entry_point: Option<u64>,
    pub compression: CompressionKind,
}

impl PayloadEntry {
    pub fn new(role: PayloadRole, offset: u64, length: u64) -> Self {
        Self {
            role,
            name: None,
            offset,
            length,
            load_address: None,
            entry_point: None,
            compression: CompressionKind::None,
        }
    }

    /// End offset on the medium
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn label(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => match self.role {
                PayloadRole::Kernel => "kernel",
                PayloadRole::Firmware => "firmware",
                PayloadRole::Standalone => "standalone",
                PayloadRole::Ramdisk => "ramdisk",
                PayloadRole::DeviceTree => "fdt",
                PayloadRole::Second => "second",
                PayloadRole::RecoveryDtbo => "recovery-dtbo",
                PayloadRole::Loadable => "loadable",
            },
        }
    }
}

/// Integrity record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrityKind {
    Crc32,
    Hash,
    Signature,
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityKind::Crc32 => write!(f, "crc32"),
            IntegrityKind::Hash => write!(f, "hash"),
            IntegrityKind::Signature => write!(f, "signature"),
        }
    }
}

/// One piece of the byte stream a record covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Bytes on the medium
    Media { offset: u64, length: u64 },
    /// Bytes the format mixes into the digest (e.g. a size field)
    Literal(Vec<u8>),
}

/// Checksum, hash or signature over an ordered list of segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityRecord {
    /// Stable name used in failure reports and policy (`optional=`)
    pub name: String,
    pub kind: IntegrityKind,
    pub algorithm: HashAlgorithm,
    /// Set only for `Signature` records
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// Expected digest, or the signature bytes
    pub expected: Vec<u8>,
    pub segments: Vec<Segment>,
    /// Trust-anchor key id for signature records
    pub key_id: Option<String>,
}

impl IntegrityRecord {
    /// Record over one range of the medium
    pub fn over_range(
        name: String,
        kind: IntegrityKind,
        algorithm: HashAlgorithm,
        expected: Vec<u8>,
        offset: u64,
        length: u64,
    ) -> Self {
        Self {
            name,
            kind,
            algorithm,
            signature_algorithm: None,
            expected,
            segments: alloc::vec![Segment::Media { offset, length }],
            key_id: None,
        }
    }

    /// Media ranges covered, in order
    pub fn media_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Media { offset, length } => Some((*offset, *length)),
            Segment::Literal(_) => None,
        })
    }
}

/// Legacy header fields with no common counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    pub name: String,
    pub timestamp: u32,
    pub os: u8,
    pub arch: u8,
    pub image_type: u8,
    pub header_crc: u32,
}

/// Component tree fields with no common counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHeader {
    pub last_comp_version: u32,
    /// Selected configuration node
    pub configuration: String,
    pub description: Option<String>,
}

/// Structured OS image fields with no common counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsImageHeader {
    pub page_size: u32,
    pub os_version: u32,
    pub name: String,
    pub cmdline: String,
    pub tags_address: u64,
}

/// Per-format header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatHeader {
    Legacy(LegacyHeader),
    ComponentTree(TreeHeader),
    StructuredOs(OsImageHeader),
}

/// Parsed image, ready for verification and planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub magic: u64,
    pub version: u32,
    /// Bytes the image claims from its start, headers included
    pub total_size: u64,
    pub payloads: Vec<PayloadEntry>,
    pub integrity: Vec<IntegrityRecord>,
    pub header: FormatHeader,
}

impl ImageDescriptor {
    pub fn format(&self) -> ImageFormatKind {
        match self.header {
            FormatHeader::Legacy(_) => ImageFormatKind::Legacy,
            FormatHeader::ComponentTree(_) => ImageFormatKind::ComponentTree,
            FormatHeader::StructuredOs(_) => ImageFormatKind::StructuredOsImage,
        }
    }

    /// First payload with `role`
    pub fn payload(&self, role: PayloadRole) -> Option<&PayloadEntry> {
        self.payloads.iter().find(|p| p.role == role)
    }

    /// Index of the payload supplying the entry point
    pub fn entry_payload(&self) -> Option<usize> {
        self.payloads
            .iter()
            .position(|p| p.entry_point.is_some() && p.role.is_executable())
            .or_else(|| self.payloads.iter().position(|p| p.entry_point.is_some()))
    }

    pub fn cmdline(&self) -> Option<&str> {
        match &self.header {
            FormatHeader::StructuredOs(h) if !h.cmdline.is_empty() => Some(&h.cmdline),
            _ => None,
        }
    }

    /// Reject the descriptor unless the declared size, every payload and
    /// every covered media range lie within `available` bytes.
    pub fn check_bounds(&self, available: u64) -> Result<(), ParseError> {
        let within = |end: u64| -> Result<(), ParseError> {
            if end > available {
                Err(ParseError::BeyondMedia { end, available })
            } else {
                Ok(())
            }
        };

        within(self.total_size)?;
        for payload in &self.payloads {
            within(payload.end().ok_or(ParseError::SizeOverflow)?)?;
        }
        for record in &self.integrity {
            for (offset, length) in record.media_ranges() {
                within(offset.checked_add(length).ok_or(ParseError::SizeOverflow)?)?;
            }
        }
        if self.payloads.is_empty() {
            return Err(ParseError::NoPayload);
        }
        Ok(())
    }
}
