//! Bootloader error handling
//!
//! This module defines the error types used throughout the boot core for
//! consistent error reporting and handling. Every error below the boot
//! device sequencer is recoverable by abandoning the current candidate;
//! only [`BootError::NoBootableMedia`] and [`BootError::HandoffInvalid`]
//! end the boot.

use alloc::string::String;
use core::fmt;
use stageboot_api::{CodecError, IoError, MemoryError, MemoryRange};

/// Header or tree parsing failure. A parser never returns a partial
/// descriptor; any of these rejects the whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Medium failed while reading header bytes
    Media(IoError),
    /// Fewer bytes than the structure requires
    Truncated,
    BadMagic,
    /// Legacy header CRC does not match
    HeaderChecksum { expected: u32, actual: u32 },
    /// Offset/size arithmetic overflowed
    SizeOverflow,
    /// Declared data extends past the bytes the medium provides
    BeyondMedia { end: u64, available: u64 },
    UnsupportedVersion(u32),
    UnsupportedImageType(u8),
    ArchitectureMismatch,
    UnsupportedCompression,
    UnsupportedAlgorithm,
    TreeTooDeep,
    TreeTooLarge,
    MalformedTree(&'static str),
    MissingNode(&'static str),
    MissingProperty(&'static str),
    MalformedProperty(&'static str),
    /// Configuration names a component that does not exist
    MissingComponent,
    TooManyComponents,
    InvalidPageSize(u32),
    /// Declared slot offset disagrees with the recomputed one
    SlotMismatch,
    InvalidString,
    /// Image carries nothing to load
    NoPayload,
    /// Component sizes exceed the data area that contains them
    InconsistentSizes,
}

impl ParseError {
    pub fn description(&self) -> &'static str {
        match self {
            ParseError::Media(_) => "media read failed",
            ParseError::Truncated => "truncated header",
            ParseError::BadMagic => "bad magic",
            ParseError::HeaderChecksum { .. } => "header checksum mismatch",
            ParseError::SizeOverflow => "size fields overflow",
            ParseError::BeyondMedia { .. } => "declared size exceeds medium",
            ParseError::UnsupportedVersion(_) => "unsupported format version",
            ParseError::UnsupportedImageType(_) => "unsupported image type",
            ParseError::ArchitectureMismatch => "image built for another architecture",
            ParseError::UnsupportedCompression => "unknown compression",
            ParseError::UnsupportedAlgorithm => "unknown integrity algorithm",
            ParseError::TreeTooDeep => "tree nesting exceeds limit",
            ParseError::TreeTooLarge => "tree size exceeds limit",
            ParseError::MalformedTree(what) => what,
            ParseError::MissingNode(node) => node,
            ParseError::MissingProperty(prop) => prop,
            ParseError::MalformedProperty(prop) => prop,
            ParseError::MissingComponent => "configuration references missing image",
            ParseError::TooManyComponents => "too many components",
            ParseError::InvalidPageSize(_) => "invalid page size",
            ParseError::SlotMismatch => "slot offset disagrees with page layout",
            ParseError::InvalidString => "invalid string field",
            ParseError::NoPayload => "no loadable payload",
            ParseError::InconsistentSizes => "component sizes exceed data area",
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::HeaderChecksum { expected, actual } => write!(
                f,
                "header checksum mismatch (expected {:#010x}, got {:#010x})",
                expected, actual
            ),
            ParseError::BeyondMedia { end, available } => write!(
                f,
                "declared end {:#x} exceeds medium size {:#x}",
                end, available
            ),
            ParseError::Media(e) => write!(f, "media read failed: {}", e),
            ParseError::UnsupportedVersion(v) => write!(f, "unsupported format version {}", v),
            ParseError::UnsupportedImageType(t) => write!(f, "unsupported image type {}", t),
            ParseError::InvalidPageSize(p) => write!(f, "invalid page size {}", p),
            ParseError::MissingNode(node) => write!(f, "missing node {}", node),
            ParseError::MissingProperty(prop) => write!(f, "missing property {}", prop),
            ParseError::MalformedProperty(prop) => write!(f, "malformed property {}", prop),
            other => f.write_str(other.description()),
        }
    }
}

/// Why an integrity record failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyReason {
    /// Computed digest differs from the expected one
    DigestMismatch,
    /// Policy demands a signature and the image has none
    MissingSignature,
    /// Policy demands a checksum and the image has none
    MissingChecksum,
    /// Trust anchor does not know the key id
    UnknownKey,
    /// Key or signature bytes are malformed
    MalformedSignature,
    /// Signature does not verify under the trusted key
    BadSignature,
    /// Covered range could not be read
    Io(IoError),
}

impl fmt::Display for VerifyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyReason::DigestMismatch => write!(f, "digest mismatch"),
            VerifyReason::MissingSignature => write!(f, "no signature record"),
            VerifyReason::MissingChecksum => write!(f, "no checksum record"),
            VerifyReason::UnknownKey => write!(f, "key not in trust anchor"),
            VerifyReason::MalformedSignature => write!(f, "malformed signature"),
            VerifyReason::BadSignature => write!(f, "signature invalid"),
            VerifyReason::Io(e) => write!(f, "read error: {}", e),
        }
    }
}

/// A failed verification, naming the record responsible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationFailure {
    pub record: String,
    pub reason: VerifyReason,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.record, self.reason)
    }
}

/// Copy/decompress failure while applying a load plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    Io(IoError),
    /// Medium returned fewer bytes than the plan requires
    ShortRead { offset: u64 },
    Memory(MemoryError),
    Codec(CodecError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "media read: {}", e),
            LoadError::ShortRead { offset } => write!(f, "short read at {:#x}", offset),
            LoadError::Memory(e) => write!(f, "{}", e),
            LoadError::Codec(e) => write!(f, "decompression: {}", e),
        }
    }
}

impl From<IoError> for LoadError {
    fn from(e: IoError) -> Self {
        LoadError::Io(e)
    }
}

impl From<MemoryError> for LoadError {
    fn from(e: MemoryError) -> Self {
        LoadError::Memory(e)
    }
}

impl From<CodecError> for LoadError {
    fn from(e: CodecError) -> Self {
        LoadError::Codec(e)
    }
}

/// Load plan rejected before any copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanError {
    /// Two destinations share bytes
    Overlap(MemoryRange, MemoryRange),
    /// Destination would overwrite code or stack still in use
    SelfOverwrite(MemoryRange),
    /// Destination hits a board-reserved range
    Reserved(MemoryRange),
    /// Destination is not inside any DRAM bank
    OutsideDram(MemoryRange),
    /// Entry point not inside the payload supplying it
    EntryOutsidePayload(u64),
    NoEntryPoint,
    /// Scratch window too small for unplaced payloads
    ScratchExhausted,
    AddressOverflow,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Overlap(a, b) => write!(f, "destinations {} and {} overlap", a, b),
            PlanError::SelfOverwrite(r) => write!(f, "destination {} overwrites running stage", r),
            PlanError::Reserved(r) => write!(f, "destination {} hits reserved memory", r),
            PlanError::OutsideDram(r) => write!(f, "destination {} outside DRAM", r),
            PlanError::EntryOutsidePayload(e) => write!(f, "entry {:#x} outside payload", e),
            PlanError::NoEntryPoint => write!(f, "no entry point"),
            PlanError::ScratchExhausted => write!(f, "scratch window exhausted"),
            PlanError::AddressOverflow => write!(f, "address overflow"),
        }
    }
}

/// Jump target rejected before the jump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    NullEntry,
    Misaligned { entry: u64, align: u64 },
    /// Entry not inside any loaded destination
    EntryNotLoaded(u64),
    /// Address does not fit the native pointer width
    AddressWidth(u64),
    /// Stage record could not be written
    Record(MemoryError),
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::NullEntry => write!(f, "null entry point"),
            HandoffError::Misaligned { entry, align } => {
                write!(f, "entry {:#x} not {}-byte aligned", entry, align)
            }
            HandoffError::EntryNotLoaded(e) => write!(f, "entry {:#x} not in loaded image", e),
            HandoffError::AddressWidth(a) => write!(f, "address {:#x} exceeds pointer width", a),
            HandoffError::Record(e) => write!(f, "stage record: {}", e),
        }
    }
}

/// Self-relocation fixup failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationError {
    /// Table length is not a whole number of entries
    MalformedTable,
    UnsupportedType(u32),
    /// Fixup site outside the stage image
    SiteOutOfBounds(u64),
    AddressOverflow,
}

impl fmt::Display for RelocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocationError::MalformedTable => write!(f, "malformed relocation table"),
            RelocationError::UnsupportedType(t) => write!(f, "unsupported relocation type {}", t),
            RelocationError::SiteOutOfBounds(o) => write!(f, "fixup site {:#x} outside image", o),
            RelocationError::AddressOverflow => write!(f, "relocated address overflows"),
        }
    }
}

/// Boot core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    /// Boot device could not be opened
    MediaOpen(IoError),
    /// Read failure or timeout on an open device
    MediaIo(IoError),
    /// No supported magic in the probe window
    FormatUnrecognized,
    Parse(ParseError),
    VerificationFailed(VerificationFailure),
    Load(LoadError),
    PlanInvalid(PlanError),
    /// Every candidate was tried and abandoned
    NoBootableMedia,
    HandoffInvalid(HandoffError),
    Relocation(RelocationError),
}

/// Terminal result of the boot device sequencer
pub type BootFailure = BootError;

impl BootError {
    /// Convert to an error code suitable for a status register or console
    pub fn as_error_code(&self) -> u32 {
        match self {
            BootError::MediaOpen(_) => 0x1000,
            BootError::MediaIo(_) => 0x1001,
            BootError::FormatUnrecognized => 0x2000,
            BootError::Parse(_) => 0x2001,
            BootError::VerificationFailed(_) => 0x3000,
            BootError::Load(_) => 0x4000,
            BootError::PlanInvalid(_) => 0x4001,
            BootError::NoBootableMedia => 0xE000,
            BootError::HandoffInvalid(_) => 0xE001,
            BootError::Relocation(_) => 0xE002,
        }
    }

    /// Get a human-readable description of the error
    pub fn description(&self) -> &'static str {
        match self {
            BootError::MediaOpen(_) => "media open failed",
            BootError::MediaIo(_) => "media I/O failed",
            BootError::FormatUnrecognized => "format unrecognized",
            BootError::Parse(_) => "parse failed",
            BootError::VerificationFailed(_) => "verification failed",
            BootError::Load(_) => "load failed",
            BootError::PlanInvalid(_) => "load plan invalid",
            BootError::NoBootableMedia => "no bootable media",
            BootError::HandoffInvalid(_) => "handoff target invalid",
            BootError::Relocation(_) => "self-relocation failed",
        }
    }

    /// Errors that end the boot instead of abandoning one candidate
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BootError::NoBootableMedia | BootError::HandoffInvalid(_) | BootError::Relocation(_)
        )
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {:#x})", self.description(), self.as_error_code())?;
        match self {
            BootError::MediaOpen(e) | BootError::MediaIo(e) => write!(f, ": {}", e),
            BootError::Parse(e) => write!(f, ": {}", e),
            BootError::VerificationFailed(e) => write!(f, ": {}", e),
            BootError::Load(e) => write!(f, ": {}", e),
            BootError::PlanInvalid(e) => write!(f, ": {}", e),
            BootError::HandoffInvalid(e) => write!(f, ": {}", e),
            BootError::Relocation(e) => write!(f, ": {}", e),
            BootError::FormatUnrecognized | BootError::NoBootableMedia => Ok(()),
        }
    }
}

impl From<ParseError> for BootError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Media(io) => BootError::MediaIo(io),
            other => BootError::Parse(other),
        }
    }
}

impl From<VerificationFailure> for BootError {
    fn from(e: VerificationFailure) -> Self {
        BootError::VerificationFailed(e)
    }
}

impl From<LoadError> for BootError {
    fn from(e: LoadError) -> Self {
        BootError::Load(e)
    }
}

impl From<PlanError> for BootError {
    fn from(e: PlanError) -> Self {
        BootError::PlanInvalid(e)
    }
}

impl From<IoError> for ParseError {
    fn from(e: IoError) -> Self {
        ParseError::Media(e)
    }
}

impl From<HandoffError> for BootError {
    fn from(e: HandoffError) -> Self {
        BootError::HandoffInvalid(e)
    }
}

impl From<RelocationError> for BootError {
    fn from(e: RelocationError) -> Self {
        BootError::Relocation(e)
    }
}
