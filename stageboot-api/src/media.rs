//! Raw media access
//!
//! A boot device is anything that can answer "read N bytes at offset".
//! Drivers for MMC, NAND, SPI flash, USB mass storage or a network fetch
//! buffer sit behind [`MediaAccess`]; the boot core never sees them.

use core::fmt;

/// Physical or logical class of a boot source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MediaKind {
    Mmc = 1,
    RawNand = 2,
    SpiFlash = 3,
    Usb = 4,
    Network = 5,
    Ram = 6,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Mmc => write!(f, "MMC"),
            MediaKind::RawNand => write!(f, "NAND"),
            MediaKind::SpiFlash => write!(f, "SPI flash"),
            MediaKind::Usb => write!(f, "USB"),
            MediaKind::Network => write!(f, "network"),
            MediaKind::Ram => write!(f, "RAM"),
        }
    }
}

/// One boot source the sequencer may try.
///
/// Produced by platform probing, consumed in the order supplied. `instance`
/// selects the slot/chip-select/controller, `offset` the byte offset of the
/// image on that medium (e.g. a raw partition start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BootDeviceCandidate {
    pub kind: MediaKind,
    pub instance: u32,
    pub offset: u64,
}

impl BootDeviceCandidate {
    pub const fn new(kind: MediaKind, instance: u32) -> Self {
        Self {
            kind,
            instance,
            offset: 0,
        }
    }

    pub const fn at_offset(kind: MediaKind, instance: u32, offset: u64) -> Self {
        Self {
            kind,
            instance,
            offset,
        }
    }
}

impl fmt::Display for BootDeviceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            write!(f, "{} {}", self.kind, self.instance)
        } else {
            write!(f, "{} {} @{:#x}", self.kind, self.instance, self.offset)
        }
    }
}

/// Media I/O failure reported by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// No medium present / controller absent
    NotPresent,
    /// Driver-enforced timeout expired
    Timeout,
    /// Uncorrectable read error (ECC, CRC on the bus, ...)
    ReadFailed,
    /// Read past the end of the medium
    OutOfRange,
    /// Driver-specific code
    Device(u32),
}

impl IoError {
    pub fn description(&self) -> &'static str {
        match self {
            IoError::NotPresent => "medium not present",
            IoError::Timeout => "I/O timeout",
            IoError::ReadFailed => "read failed",
            IoError::OutOfRange => "read beyond end of medium",
            IoError::Device(_) => "device error",
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Device(code) => write!(f, "device error {:#x}", code),
            other => f.write_str(other.description()),
        }
    }
}

/// Access to the raw bytes of a boot device.
///
/// Every call is expected to enforce its own bounded timeout and return
/// [`IoError::Timeout`] rather than block forever.
pub trait MediaAccess {
    type Handle;

    fn open(&mut self, candidate: &BootDeviceCandidate) -> Result<Self::Handle, IoError>;

    /// Read up to `buf.len()` bytes at `offset`; returns the number read.
    fn read(&mut self, handle: &mut Self::Handle, offset: u64, buf: &mut [u8])
        -> Result<usize, IoError>;

    /// Size of the readable area in bytes.
    fn size(&self, handle: &Self::Handle) -> u64;

    fn close(&mut self, handle: Self::Handle);
}
