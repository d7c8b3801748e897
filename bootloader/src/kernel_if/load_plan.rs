//! Load planning
//!
//! Turns a verified descriptor into concrete destinations and proves, before
//! a single byte is copied, that the copy is safe:
//! - every destination lies inside one DRAM bank
//! - no destination overlaps another, a reserved range, the running stage,
//!   the stage record or a board-placed device tree
//! - the entry point lies inside the payload that supplies it
//!
//! The loader relies on these checks and performs none of its own.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use stageboot_api::{BootDeviceCandidate, MemoryRange};

use super::descriptor::{ImageDescriptor, PayloadEntry, PayloadRole};
use crate::arch::page_size;
use crate::boot_stage::boot_config::{BootConfig, VerificationLevel};
use crate::boot_stage::stage_context::{StageContext, StageRecord};
use crate::error::PlanError;
use crate::protocol::ImageFormatKind;
use crate::utils::cursor::align_up;

/// Device tree blobs only need 8-byte alignment
const DEVICE_TREE_ALIGN: u64 = 8;

/// One payload and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub payload: PayloadEntry,
    /// Reserved destination window; larger than the payload when it is
    /// decompressed in place
    pub destination: MemoryRange,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:#x} bytes{}) -> {}",
            self.payload.label(),
            self.payload.length,
            if self.payload.compression.is_compressed() {
                ", compressed"
            } else {
                ""
            },
            self.destination
        )
    }
}

/// Validated plan for one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub candidate: BootDeviceCandidate,
    pub format: ImageFormatKind,
    pub placements: Vec<Placement>,
    /// Absolute entry address
    pub entry_point: u64,
    /// Index into `placements` of the payload supplying the entry point
    pub entry_index: usize,
    pub cmdline: Option<String>,
    /// Strongest integrity level the image passed
    pub verification: VerificationLevel,
    /// Accepted through the unverified fallback
    pub unverified: bool,
}

impl LoadPlan {
    /// Place every payload of `descriptor` and validate the result.
    pub fn build(
        candidate: BootDeviceCandidate,
        descriptor: &ImageDescriptor,
        config: &BootConfig,
        ctx: &StageContext,
        verification: VerificationLevel,
    ) -> Result<Self, PlanError> {
        let entry_payload = descriptor.entry_payload().ok_or(PlanError::NoEntryPoint)?;
        let layout = &config.layout;
        let page = page_size(config.arch);

        let mut scratch_next = layout.scratch.start;
        let scratch_end = layout.scratch.end().ok_or(PlanError::AddressOverflow)?;

        let mut placements: Vec<Placement> = Vec::with_capacity(descriptor.payloads.len());
        for payload in &descriptor.payloads {
            let window = if payload.compression.is_compressed() {
                config.compressed_window.max(payload.length)
            } else {
                payload.length
            };
            let start = match payload.load_address {
                Some(address) => address,
                None => {
                    let align = if payload.role == PayloadRole::DeviceTree {
                        DEVICE_TREE_ALIGN
                    } else {
                        page
                    };
                    let start = align_up(scratch_next, align).ok_or(PlanError::AddressOverflow)?;
                    let end = start.checked_add(window).ok_or(PlanError::AddressOverflow)?;
                    if end > scratch_end {
                        return Err(PlanError::ScratchExhausted);
                    }
                    scratch_next = end;
                    start
                }
            };
            let destination = MemoryRange::new(start, window);
            if destination.end().is_none() {
                return Err(PlanError::AddressOverflow);
            }
            placements.push(Placement {
                payload: payload.clone(),
                destination,
            });
        }

        check_placements(&placements, config, ctx)?;
        let entry_point = resolve_entry(&placements[entry_payload])?;

        let plan = Self {
            candidate,
            format: descriptor.format(),
            placements,
            entry_point,
            entry_index: entry_payload,
            cmdline: descriptor.cmdline().map(String::from),
            verification,
            unverified: false,
        };
        for placement in &plan.placements {
            log::debug!("plan: {}", placement);
        }
        log::debug!("plan: entry {:#x}", plan.entry_point);
        Ok(plan)
    }

    /// Destination of the first device tree payload
    pub fn device_tree(&self) -> Option<&Placement> {
        self.placements
            .iter()
            .find(|p| p.payload.role == PayloadRole::DeviceTree)
    }

    /// True when `address` falls inside some destination
    pub fn covers(&self, address: u64) -> bool {
        self.placements
            .iter()
            .any(|p| p.destination.contains(address))
    }
}

fn check_placements(
    placements: &[Placement],
    config: &BootConfig,
    ctx: &StageContext,
) -> Result<(), PlanError> {
    let layout = &config.layout;
    let record = config
        .stage_record_addr
        .map(|addr| MemoryRange::new(addr, StageRecord::SIZE as u64));

    for (index, placement) in placements.iter().enumerate() {
        let dest = placement.destination;
        if dest.is_empty() {
            continue;
        }
        if !layout.dram.iter().any(|bank| bank.contains_range(&dest)) {
            return Err(PlanError::OutsideDram(dest));
        }
        if ctx.protected().iter().any(|r| r.overlaps(&dest)) {
            return Err(PlanError::SelfOverwrite(dest));
        }
        if record.map_or(false, |r| r.overlaps(&dest)) {
            return Err(PlanError::SelfOverwrite(dest));
        }
        if let Some(reserved) = layout
            .reserved
            .iter()
            .chain(layout.device_tree.iter())
            .find(|r| r.overlaps(&dest))
        {
            log::debug!("{} collides with reserved {}", dest, reserved);
            return Err(PlanError::Reserved(dest));
        }
        if let Some(other) = placements[..index]
            .iter()
            .find(|p| p.destination.overlaps(&dest))
        {
            return Err(PlanError::Overlap(other.destination, dest));
        }
    }
    Ok(())
}

/// Absolute entry address of `placement`.
///
/// Payloads without a load address carry their entry as an offset from the
/// start of wherever they were placed.
fn resolve_entry(placement: &Placement) -> Result<u64, PlanError> {
    let payload = &placement.payload;
    let raw = payload.entry_point.ok_or(PlanError::NoEntryPoint)?;
    let entry = match payload.load_address {
        Some(_) => raw,
        None => placement
            .destination
            .start
            .checked_add(raw)
            .ok_or(PlanError::AddressOverflow)?,
    };
    if !placement.destination.contains(entry) {
        return Err(PlanError::EntryOutsidePayload(entry));
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_stage::boot_config::MemoryLayout;
    use crate::kernel_if::descriptor::{FormatHeader, TreeHeader};
    use alloc::vec;
    use stageboot_api::{Architecture, CompressionKind, MediaKind};

    static DRAM: [MemoryRange; 1] = [MemoryRange::new(0x4000_0000, 0x1000_0000)];
    static RESERVED: [MemoryRange; 1] = [MemoryRange::new(0x4f00_0000, 0x10_0000)];

    fn config() -> BootConfig {
        BootConfig::new(
            Architecture::Aarch64,
            MemoryLayout {
                dram: &DRAM,
                scratch: MemoryRange::new(0x4c00_0000, 0x100_0000),
                reserved: &RESERVED,
                device_tree: None,
            },
        )
    }

    fn ctx() -> StageContext {
        StageContext::new(
            MemoryRange::new(0x4000_0000, 0x8_0000),
            MemoryRange::new(0x4010_0000, 0x1_0000),
        )
    }

    fn kernel(load: Option<u64>, entry: u64, len: u64) -> PayloadEntry {
        let mut p = PayloadEntry::new(PayloadRole::Kernel, 0x100, len);
        p.load_address = load;
        p.entry_point = Some(entry);
        p
    }

    fn descriptor(payloads: Vec<PayloadEntry>) -> ImageDescriptor {
        ImageDescriptor {
            magic: 0,
            version: 17,
            total_size: 0x10_0000,
            payloads,
            integrity: Vec::new(),
            header: FormatHeader::ComponentTree(TreeHeader {
                last_comp_version: 16,
                configuration: "conf-1".into(),
                description: None,
            }),
        }
    }

    fn build(payloads: Vec<PayloadEntry>) -> Result<LoadPlan, PlanError> {
        LoadPlan::build(
            BootDeviceCandidate::new(MediaKind::Mmc, 0),
            &descriptor(payloads),
            &config(),
            &ctx(),
            VerificationLevel::Checksum,
        )
    }

    #[test]
    fn test_places_fixed_and_scratch_payloads() {
        let fdt = PayloadEntry::new(PayloadRole::DeviceTree, 0x2000, 0x300);
        let ramdisk = PayloadEntry::new(PayloadRole::Ramdisk, 0x3000, 0x1234);
        let plan = build(vec![kernel(Some(0x4200_0000), 0x4200_0000, 0x8000), fdt, ramdisk])
            .unwrap();
        assert_eq!(plan.entry_point, 0x4200_0000);
        assert_eq!(plan.placements[1].destination, MemoryRange::new(0x4c00_0000, 0x300));
        // ramdisk is page aligned after the device tree
        assert_eq!(plan.placements[2].destination.start, 0x4c00_1000);
        assert_eq!(plan.device_tree().unwrap().destination.start, 0x4c00_0000);
        assert!(plan.covers(0x4200_7fff));
        assert!(!plan.covers(0x4200_8000));
    }

    #[test]
    fn test_self_overwrite_rejected() {
        let err = build(vec![kernel(Some(0x4004_0000), 0x4004_0000, 0x1000)]).unwrap_err();
        assert_eq!(err, PlanError::SelfOverwrite(MemoryRange::new(0x4004_0000, 0x1000)));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut ramdisk = PayloadEntry::new(PayloadRole::Ramdisk, 0x9000, 0x1000);
        ramdisk.load_address = Some(0x4200_4000);
        let err = build(vec![kernel(Some(0x4200_0000), 0x4200_0000, 0x8000), ramdisk]);
        assert!(matches!(err, Err(PlanError::Overlap(_, _))));
    }

    #[test]
    fn test_reserved_and_dram_bounds() {
        assert!(matches!(
            build(vec![kernel(Some(0x4f00_0000), 0x4f00_0000, 0x10)]),
            Err(PlanError::Reserved(_))
        ));
        assert!(matches!(
            build(vec![kernel(Some(0x3000_0000), 0x3000_0000, 0x10)]),
            Err(PlanError::OutsideDram(_))
        ));
    }

    #[test]
    fn test_relative_entry_resolved_against_placement() {
        let plan = build(vec![kernel(None, 0x40, 0x1000)]).unwrap();
        assert_eq!(plan.entry_point, 0x4c00_0040);
        assert!(matches!(
            build(vec![kernel(None, 0x1000, 0x1000)]),
            Err(PlanError::EntryOutsidePayload(0x4c00_1000))
        ));
    }

    #[test]
    fn test_entry_outside_payload() {
        assert_eq!(
            build(vec![kernel(Some(0x4200_0000), 0x4300_0000, 0x8000)]),
            Err(PlanError::EntryOutsidePayload(0x4300_0000))
        );
    }

    #[test]
    fn test_compressed_payload_reserves_window() {
        let mut k = kernel(Some(0x4200_0000), 0x4200_0000, 0x1000);
        k.compression = CompressionKind::Gzip;
        let plan = build(vec![k]).unwrap();
        assert_eq!(
            plan.placements[0].destination.len,
            BootConfig::DEFAULT_COMPRESSED_WINDOW
        );
    }

    #[test]
    fn test_scratch_exhausted() {
        let ramdisk = PayloadEntry::new(PayloadRole::Ramdisk, 0, 0x200_0000);
        assert_eq!(
            build(vec![kernel(Some(0x4200_0000), 0x4200_0000, 0x10), ramdisk]),
            Err(PlanError::ScratchExhausted)
        );
    }

    #[test]
    fn test_no_entry_point() {
        let ramdisk = PayloadEntry::new(PayloadRole::Ramdisk, 0, 0x10);
        assert_eq!(build(vec![ramdisk]), Err(PlanError::NoEntryPoint));
    }
}
