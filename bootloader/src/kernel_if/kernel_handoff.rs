//! Handoff to the next stage
//!
//! Everything that can be checked is checked in [`prepare`], before the
//! platform is torn down: entry non-null, aligned for the architecture,
//! inside a loaded destination, and every value representable in a native
//! register. [`handoff`] then writes the stage record, lets the platform
//! quiesce caches and devices, and makes the one indirect call this crate
//! contains.

use core::convert::Infallible;
use core::fmt;
use stageboot_api::{MemoryRange, Platform, TargetMemory};

use super::load_plan::LoadPlan;
use crate::arch::HandoffConvention;
use crate::boot_stage::stage_context::{StageContext, StageRecord};
use crate::error::HandoffError;

/// Validated jump target and argument registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffRequest {
    pub entry: usize,
    pub args: [usize; 4],
}

impl fmt::Display for HandoffRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry {:#x} args ({:#x}, {:#x}, {:#x}, {:#x})",
            self.entry, self.args[0], self.args[1], self.args[2], self.args[3]
        )
    }
}

fn native(value: u64) -> Result<usize, HandoffError> {
    usize::try_from(value).map_err(|_| HandoffError::AddressWidth(value))
}

/// Build the calling contract for `plan` without touching the machine.
pub fn prepare(
    plan: &LoadPlan,
    ctx: &StageContext,
    convention: &HandoffConvention,
    stage_record: Option<u64>,
) -> Result<HandoffRequest, HandoffError> {
    let entry = plan.entry_point;
    if entry == 0 {
        return Err(HandoffError::NullEntry);
    }
    let align = convention.entry_align.max(1);
    if entry % align != 0 {
        return Err(HandoffError::Misaligned { entry, align });
    }
    if !plan.covers(entry) {
        return Err(HandoffError::EntryNotLoaded(entry));
    }

    let values = ctx.arg_values(stage_record);
    let raw = convention.resolve(&values);
    let mut args = [0usize; 4];
    for (slot, value) in args.iter_mut().zip(raw) {
        *slot = native(value)?;
    }
    Ok(HandoffRequest {
        entry: native(entry)?,
        args,
    })
}

/// Write `ctx` as a stage record at `address`.
pub fn write_stage_record(
    memory: &mut dyn TargetMemory,
    address: u64,
    ctx: &StageContext,
) -> Result<(), HandoffError> {
    let range = MemoryRange::new(address, StageRecord::SIZE as u64);
    let dst = memory.slice_mut(range).map_err(HandoffError::Record)?;
    dst.copy_from_slice(&ctx.to_record().to_bytes());
    Ok(())
}

/// Transfer control to the loaded image. Returns only when validation
/// fails; on success control never comes back.
pub fn handoff(
    plan: &LoadPlan,
    ctx: &StageContext,
    convention: &HandoffConvention,
    memory: &mut dyn TargetMemory,
    stage_record: Option<u64>,
    platform: &mut dyn Platform,
) -> Result<Infallible, HandoffError> {
    let record = if convention.uses(crate::arch::ArgSource::StageRecord) {
        stage_record
    } else {
        None
    };
    let request = prepare(plan, ctx, convention, record)?;
    if let Some(address) = stage_record {
        write_stage_record(memory, address, ctx)?;
    }

    log::info!("{}: handing off, {}", plan.candidate, request);
    platform.cleanup_before_handoff();

    // SAFETY: `prepare` checked that the entry is non-null, aligned and
    // inside a destination the loader just filled from a verified image.
    unsafe { jump(request) }
}

unsafe fn jump(request: HandoffRequest) -> ! {
    let entry: extern "C" fn(usize, usize, usize, usize) -> ! =
        core::mem::transmute(request.entry);
    entry(
        request.args[0],
        request.args[1],
        request.args[2],
        request.args[3],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArgSource;
    use crate::boot_stage::boot_config::VerificationLevel;
    use crate::boot_stage::stage_context::StageFlags;
    use crate::kernel_if::descriptor::{PayloadEntry, PayloadRole};
    use crate::kernel_if::load_plan::Placement;
    use crate::protocol::ImageFormatKind;
    use alloc::vec;
    use stageboot_api::{Architecture, BootDeviceCandidate, MediaKind};

    fn plan(entry: u64) -> LoadPlan {
        LoadPlan {
            candidate: BootDeviceCandidate::new(MediaKind::Mmc, 1),
            format: ImageFormatKind::ComponentTree,
            placements: vec![Placement {
                payload: PayloadEntry::new(PayloadRole::Kernel, 0, 0x1000),
                destination: MemoryRange::new(0x4008_0000, 0x1000),
            }],
            entry_point: entry,
            entry_index: 0,
            cmdline: None,
            verification: VerificationLevel::Checksum,
            unverified: false,
        }
    }

    fn ctx() -> StageContext {
        let mut ctx = StageContext::new(
            MemoryRange::new(0x4000_0000, 0x1_0000),
            MemoryRange::new(0x4001_0000, 0x1000),
        );
        ctx.set_device_tree(0x4800_0000);
        ctx.boot_cpu = 3;
        ctx
    }

    #[test]
    fn test_aarch64_contract() {
        let conv = HandoffConvention::for_arch(Architecture::Aarch64);
        let req = prepare(&plan(0x4008_0000), &ctx(), &conv, None).unwrap();
        assert_eq!(req.entry, 0x4008_0000);
        assert_eq!(req.args, [0x4800_0000, 0, 0, 0]);
    }

    #[test]
    fn test_riscv_contract_passes_hart() {
        let conv = HandoffConvention::for_arch(Architecture::Riscv64);
        let req = prepare(&plan(0x4008_0002), &ctx(), &conv, None).unwrap();
        assert_eq!(req.args[..2], [3, 0x4800_0000]);
    }

    #[test]
    fn test_stage_record_convention() {
        let conv = HandoffConvention::stage_record(4);
        let req = prepare(&plan(0x4008_0000), &ctx(), &conv, Some(0x4f00_0000)).unwrap();
        assert_eq!(req.args[0], 0x4f00_0000);
        assert!(conv.uses(ArgSource::StageRecord));
    }

    #[test]
    fn test_invalid_targets_rejected() {
        let conv = HandoffConvention::for_arch(Architecture::Aarch64);
        assert_eq!(prepare(&plan(0), &ctx(), &conv, None), Err(HandoffError::NullEntry));
        assert_eq!(
            prepare(&plan(0x4008_0002), &ctx(), &conv, None),
            Err(HandoffError::Misaligned {
                entry: 0x4008_0002,
                align: 4
            })
        );
        assert_eq!(
            prepare(&plan(0x4009_0000), &ctx(), &conv, None),
            Err(HandoffError::EntryNotLoaded(0x4009_0000))
        );
    }

    #[test]
    fn test_unvalidated_device_tree_passes_zero() {
        let mut c = ctx();
        c.flags.remove(StageFlags::DEVICE_TREE_VALID);
        let conv = HandoffConvention::for_arch(Architecture::Aarch64);
        let req = prepare(&plan(0x4008_0000), &c, &conv, None).unwrap();
        assert_eq!(req.args[0], 0);
    }
}
