//! Shared fixtures for the integration tests
//!
//! In-memory media and target memory, a counting watchdog, a fixed trust
//! anchor and byte-exact builders for the three supported image formats.

#![allow(dead_code)]

use ed25519_dalek::{Signer, SigningKey};
use stageboot_api::{
    BootDeviceCandidate, IoError, KeyMaterial, Liveness, MediaAccess, MediaKind, MemoryError,
    MemoryRange, Platform, TargetMemory,
};
use stageboot_bootloader::boot_stage::boot_config::MemoryLayout;
use stageboot_bootloader::security::checksum::crc32;
use stageboot_bootloader::security::digest::{digest, HashAlgorithm, Hasher};
use stageboot_bootloader::{BootConfig, StageContext};
use stageboot_api::Architecture;

pub const DRAM_BASE: u64 = 0x4000_0000;
pub const DRAM_SIZE: u64 = 0x0100_0000;
pub const KERNEL_ADDR: u64 = 0x4008_0000;
pub const RAMDISK_ADDR: u64 = 0x4040_0000;
pub const SCRATCH: MemoryRange = MemoryRange::new(0x40C0_0000, 0x0020_0000);
/// Where the running stage itself lives
pub const STAGE_IMAGE: MemoryRange = MemoryRange::new(0x40F0_0000, 0x0008_0000);
pub const STAGE_STACK: MemoryRange = MemoryRange::new(0x40F8_0000, 0x0001_0000);

static DRAM: [MemoryRange; 1] = [MemoryRange::new(DRAM_BASE, DRAM_SIZE)];

pub fn layout() -> MemoryLayout {
    MemoryLayout {
        dram: &DRAM,
        scratch: SCRATCH,
        reserved: &[],
        device_tree: None,
    }
}

pub fn config() -> BootConfig {
    let mut config = BootConfig::new(Architecture::Aarch64, layout());
    config.liveness_chunk = 256;
    config
}

pub fn stage_context() -> StageContext {
    StageContext::new(STAGE_IMAGE, STAGE_STACK)
}

pub fn mmc(instance: u32) -> BootDeviceCandidate {
    BootDeviceCandidate::new(MediaKind::Mmc, instance)
}

pub fn spi(instance: u32) -> BootDeviceCandidate {
    BootDeviceCandidate::new(MediaKind::SpiFlash, instance)
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

struct Device {
    kind: MediaKind,
    instance: u32,
    contents: Result<Vec<u8>, IoError>,
}

/// Boot devices backed by byte vectors
#[derive(Default)]
pub struct FakeMedia {
    devices: Vec<Device>,
    pub opened: usize,
    pub closed: usize,
    pub bytes_read: u64,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, candidate: BootDeviceCandidate, bytes: Vec<u8>) -> Self {
        self.devices.push(Device {
            kind: candidate.kind,
            instance: candidate.instance,
            contents: Ok(bytes),
        });
        self
    }

    /// A device whose `open` fails with `error`
    pub fn failing(mut self, candidate: BootDeviceCandidate, error: IoError) -> Self {
        self.devices.push(Device {
            kind: candidate.kind,
            instance: candidate.instance,
            contents: Err(error),
        });
        self
    }

    pub fn open_handles(&self) -> usize {
        self.opened - self.closed
    }

    fn bytes(&self, handle: usize) -> &[u8] {
        match &self.devices[handle].contents {
            Ok(bytes) => bytes,
            Err(_) => &[],
        }
    }
}

impl MediaAccess for FakeMedia {
    type Handle = usize;

    fn open(&mut self, candidate: &BootDeviceCandidate) -> Result<usize, IoError> {
        let index = self
            .devices
            .iter()
            .position(|d| d.kind == candidate.kind && d.instance == candidate.instance)
            .ok_or(IoError::NotPresent)?;
        if let Err(e) = &self.devices[index].contents {
            return Err(*e);
        }
        self.opened += 1;
        Ok(index)
    }

    fn read(&mut self, handle: &mut usize, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        let bytes = self.bytes(*handle);
        let start = usize::try_from(offset).map_err(|_| IoError::OutOfRange)?;
        if start > bytes.len() {
            return Err(IoError::OutOfRange);
        }
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        self.bytes_read += n as u64;
        Ok(n)
    }

    fn size(&self, handle: &usize) -> u64 {
        self.bytes(*handle).len() as u64
    }

    fn close(&mut self, _handle: usize) {
        self.closed += 1;
    }
}

// ---------------------------------------------------------------------------
// Target memory
// ---------------------------------------------------------------------------

/// DRAM simulated by one zero-filled vector
pub struct RamTarget {
    base: u64,
    bytes: Vec<u8>,
    /// Range that reports as unmapped
    pub hole: Option<MemoryRange>,
    pub writes: usize,
}

impl RamTarget {
    pub fn new() -> Self {
        Self {
            base: DRAM_BASE,
            bytes: vec![0; DRAM_SIZE as usize],
            hole: None,
            writes: 0,
        }
    }

    pub fn read(&self, address: u64, len: usize) -> &[u8] {
        let start = (address - self.base) as usize;
        &self.bytes[start..start + len]
    }

    pub fn write(&mut self, address: u64, data: &[u8]) {
        let start = (address - self.base) as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn is_untouched(&self) -> bool {
        self.writes == 0 && self.bytes.iter().all(|b| *b == 0)
    }

    fn offset(&self, range: MemoryRange) -> Result<usize, MemoryError> {
        let bank = MemoryRange::new(self.base, self.bytes.len() as u64);
        if !bank.contains_range(&range) || self.hole.is_some_and(|h| h.overlaps(&range)) {
            return Err(MemoryError::Unmapped(range));
        }
        Ok((range.start - self.base) as usize)
    }
}

impl TargetMemory for RamTarget {
    fn slice(&self, range: MemoryRange) -> Result<&[u8], MemoryError> {
        let start = self.offset(range)?;
        Ok(&self.bytes[start..start + range.len as usize])
    }

    fn slice_mut(&mut self, range: MemoryRange) -> Result<&mut [u8], MemoryError> {
        let start = self.offset(range)?;
        self.writes += 1;
        Ok(&mut self.bytes[start..start + range.len as usize])
    }
}

// ---------------------------------------------------------------------------
// Liveness, platform, trust
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CountingWatchdog {
    pub kicks: usize,
}

impl Liveness for CountingWatchdog {
    fn kick(&mut self) {
        self.kicks += 1;
    }
}

/// Platform whose halt path panics with the terminal message
#[derive(Debug, Default)]
pub struct PanicPlatform {
    pub cleanups: usize,
}

impl Platform for PanicPlatform {
    fn cleanup_before_handoff(&mut self) {
        self.cleanups += 1;
    }

    fn halt(&mut self, message: &str) -> ! {
        panic!("{}", message)
    }
}

pub const KEY_NAME: &str = "dev";

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn anchor() -> [(&'static str, KeyMaterial); 1] {
    [(
        KEY_NAME,
        KeyMaterial::Ed25519(signing_key().verifying_key().to_bytes()),
    )]
}

/// Deterministic non-repeating payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// ---------------------------------------------------------------------------
// Legacy image
// ---------------------------------------------------------------------------

pub const LEGACY_HEADER: usize = 64;
pub const IH_ARCH_ARM64: u8 = 22;
pub const IH_TYPE_KERNEL: u8 = 2;

/// Legacy kernel image loading and entering at `load`
pub fn legacy_image(data: &[u8], load: u32) -> Vec<u8> {
    let mut h = [0u8; LEGACY_HEADER];
    h[0..4].copy_from_slice(&0x2705_1956u32.to_be_bytes());
    h[8..12].copy_from_slice(&0x6500_0000u32.to_be_bytes());
    h[12..16].copy_from_slice(&(data.len() as u32).to_be_bytes());
    h[16..20].copy_from_slice(&load.to_be_bytes());
    h[20..24].copy_from_slice(&load.to_be_bytes());
    h[24..28].copy_from_slice(&crc32(data).to_be_bytes());
    h[28] = 5;
    h[29] = IH_ARCH_ARM64;
    h[30] = IH_TYPE_KERNEL;
    h[32..38].copy_from_slice(b"kernel");
    let hcrc = crc32(&h);
    h[4..8].copy_from_slice(&hcrc.to_be_bytes());
    let mut out = h.to_vec();
    out.extend_from_slice(data);
    out
}

// ---------------------------------------------------------------------------
// Flattened device tree / component tree image
// ---------------------------------------------------------------------------

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;
const FDT_HEADER: u32 = 40;

#[derive(Default)]
pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    fn word(&mut self, w: u32) {
        self.structure.extend_from_slice(&w.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    pub fn begin(&mut self, name: &str) -> &mut Self {
        self.word(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.word(FDT_END_NODE);
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.word(FDT_PROP);
        self.word(value.len() as u32);
        self.word(off);
        self.structure.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
        let mut v = value.as_bytes().to_vec();
        v.push(0);
        self.prop(name, &v)
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.word(FDT_END);
        let off_struct = FDT_HEADER + 16;
        let off_strings = off_struct + self.structure.len() as u32;
        let total = off_strings + self.strings.len() as u32;
        let mut out = Vec::new();
        for w in [
            0xd00d_feed,
            total,
            off_struct,
            off_strings,
            FDT_HEADER,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&self.structure);
        out.extend_from_slice(&self.strings);
        out
    }
}

/// A minimal valid device tree blob
pub fn device_tree() -> Vec<u8> {
    let mut b = FdtBuilder::default();
    b.begin("")
        .prop_str("compatible", "vendor,board")
        .begin("chosen")
        .prop_str("bootargs", "console=ttyS0")
        .end()
        .end();
    b.finish()
}

/// How a component tree image's kernel is protected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitIntegrity {
    /// Kernel carries no record; only the device tree is hashed
    Unprotected,
    Crc32,
    Sha256,
    Signed,
}

/// Component tree image with an embedded kernel and device tree
pub fn fit_image(kernel: &[u8], dtb: &[u8], integrity: FitIntegrity) -> Vec<u8> {
    let mut b = FdtBuilder::default();
    b.begin("")
        .prop_str("description", "integration image")
        .begin("images")
        .begin("kernel-1")
        .prop("data", kernel)
        .prop_str("type", "kernel")
        .prop_str("arch", "arm64")
        .prop_str("compression", "none")
        .prop_u32("load", KERNEL_ADDR as u32)
        .prop_u32("entry", KERNEL_ADDR as u32);
    match integrity {
        FitIntegrity::Unprotected => {}
        FitIntegrity::Crc32 => {
            b.begin("hash-1")
                .prop_str("algo", "crc32")
                .prop("value", &digest(HashAlgorithm::Crc32, kernel))
                .end();
        }
        FitIntegrity::Sha256 => {
            b.begin("hash-1")
                .prop_str("algo", "sha256")
                .prop("value", &digest(HashAlgorithm::Sha256, kernel))
                .end();
        }
        FitIntegrity::Signed => {
            let signature = signing_key().sign(&digest(HashAlgorithm::Sha256, kernel));
            b.begin("signature-1")
                .prop_str("algo", "sha256,ed25519")
                .prop_str("key-name-hint", KEY_NAME)
                .prop("value", &signature.to_bytes())
                .end();
        }
    }
    b.end()
        .begin("fdt-1")
        .prop("data", dtb)
        .prop_str("type", "flat_dt");
    if integrity == FitIntegrity::Signed {
        let signature = signing_key().sign(&digest(HashAlgorithm::Sha256, dtb));
        b.begin("signature-1")
            .prop_str("algo", "sha256,ed25519")
            .prop_str("key-name-hint", KEY_NAME)
            .prop("value", &signature.to_bytes())
            .end();
    } else {
        b.begin("hash-1")
            .prop_str("algo", "crc32")
            .prop("value", &digest(HashAlgorithm::Crc32, dtb))
            .end();
    }
    b.end()
        .end()
        .begin("configurations")
        .prop_str("default", "conf-1")
        .begin("conf-1")
        .prop_str("kernel", "kernel-1")
        .prop_str("fdt", "fdt-1")
        .end()
        .end()
        .end();
    b.finish()
}

// ---------------------------------------------------------------------------
// Structured OS image (header version 0)
// ---------------------------------------------------------------------------

pub const ANDROID_PAGE: usize = 2048;

/// Version 0 boot image with a kernel and a ramdisk
pub fn android_image(kernel: &[u8], ramdisk: &[u8]) -> Vec<u8> {
    let mut h = vec![0u8; ANDROID_PAGE];
    let put = |h: &mut Vec<u8>, at: usize, v: u32| h[at..at + 4].copy_from_slice(&v.to_le_bytes());
    h[..8].copy_from_slice(b"ANDROID!");
    put(&mut h, 8, kernel.len() as u32);
    put(&mut h, 12, KERNEL_ADDR as u32);
    put(&mut h, 16, ramdisk.len() as u32);
    put(&mut h, 20, RAMDISK_ADDR as u32);
    put(&mut h, 32, (DRAM_BASE + 0x100) as u32);
    put(&mut h, 36, ANDROID_PAGE as u32);
    h[48..54].copy_from_slice(b"board0");
    h[64..77].copy_from_slice(b"console=ttyS0");

    let slots: [&[u8]; 3] = [kernel, ramdisk, &[]];
    let mut hasher = Hasher::new(HashAlgorithm::Sha1);
    let mut body = Vec::new();
    for slot in slots {
        hasher.update(slot);
        hasher.update(&(slot.len() as u32).to_le_bytes());
        body.extend_from_slice(slot);
        while body.len() % ANDROID_PAGE != 0 {
            body.push(0);
        }
    }
    let id = hasher.finalize();
    h[576..576 + id.len()].copy_from_slice(&id);
    h.extend_from_slice(&body);
    h
}
