//! Boot flow - from reset context to the next stage
//!
//! 1. Self-relocate when the stage runs away from its link address
//! 2. Sequence candidates until one parses, verifies and plans
//! 3. Load it; a load failure resumes sequencing with the next candidate
//! 4. Validate the device tree the next stage will receive
//! 5. Write the stage record and hand off
//!
//! Every fatal error ends in one `BOOT HALTED:` line and
//! [`Platform::halt`]; the flow never returns and never resets silently.

use alloc::format;
use stageboot_api::{
    BootDeviceCandidate, Decompressor, Liveness, MediaAccess, MemoryRange, Platform, TargetMemory,
    TrustAnchor,
};

use super::boot_config::{BootConfig, VerificationLevel};
use super::fallback_boot::BootSequencer;
use super::stage_context::{StageContext, StageFlags};
use crate::diagnostics::boot_trace::BootTrace;
use crate::error::BootError;
use crate::kernel_if::kernel_handoff::handoff;
use crate::kernel_if::load_plan::LoadPlan;
use crate::kernel_if::relocation::relocate_self;
use crate::protocol::fdt::check_blob;

/// The running stage's own image and relocation table
pub struct SelfImage<'a> {
    pub image: &'a mut [u8],
    pub table: &'a [u8],
}

/// Everything the boot core borrows from the board
pub struct Collaborators<'a, M: MediaAccess, T: TrustAnchor + ?Sized> {
    pub media: &'a mut M,
    pub memory: &'a mut dyn TargetMemory,
    pub codec: &'a mut dyn Decompressor,
    pub liveness: &'a mut dyn Liveness,
    pub trust: &'a T,
    pub platform: &'a mut dyn Platform,
    pub relocation: Option<SelfImage<'a>>,
}

/// Loaded next stage, ready for handoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedStage {
    pub plan: LoadPlan,
    pub trace: BootTrace,
}

/// Run the boot pipeline and hand off. Never returns.
pub fn boot<M, T>(
    config: &BootConfig,
    candidates: &[BootDeviceCandidate],
    collaborators: Collaborators<'_, M, T>,
    ctx: &mut StageContext,
) -> !
where
    M: MediaAccess,
    T: TrustAnchor + ?Sized,
{
    let Collaborators {
        media,
        memory,
        codec,
        liveness,
        trust,
        platform,
        relocation,
    } = collaborators;

    let error = match load_next_stage(
        config, candidates, media, memory, codec, liveness, trust, relocation, ctx,
    ) {
        Ok(loaded) => {
            match handoff(
                &loaded.plan,
                ctx,
                &config.handoff,
                memory,
                config.stage_record_addr,
                platform,
            ) {
                Ok(never) => match never {},
                Err(e) => BootError::HandoffInvalid(e),
            }
        }
        Err(e) => e,
    };
    halt(platform, &error)
}

/// Report `error` as the terminal failure and stop.
pub fn halt(platform: &mut dyn Platform, error: &BootError) -> ! {
    let message = format!("BOOT HALTED: {}", error);
    log::error!("{}", message);
    platform.halt(&message)
}

/// Everything up to, but not including, the handoff.
#[allow(clippy::too_many_arguments)]
pub fn load_next_stage<M, T>(
    config: &BootConfig,
    candidates: &[BootDeviceCandidate],
    media: &mut M,
    memory: &mut dyn TargetMemory,
    codec: &mut dyn Decompressor,
    liveness: &mut dyn Liveness,
    trust: &T,
    relocation: Option<SelfImage<'_>>,
    ctx: &mut StageContext,
) -> Result<LoadedStage, BootError>
where
    M: MediaAccess,
    T: TrustAnchor + ?Sized,
{
    if let Some(image) = relocation {
        relocate_self(ctx, image.image, image.table, config.arch)?;
    }

    let mut sequencer = BootSequencer::new(media, trust, liveness, config, *ctx);
    let plan = loop {
        let plan = sequencer.run(candidates, &config.policy)?;
        if sequencer.load(&plan, memory, codec).is_ok() {
            break plan;
        }
    };
    let trace = sequencer.trace().clone();
    drop(sequencer);

    record_device_tree(config, &plan, memory, ctx);
    if plan.unverified {
        ctx.flags.insert(StageFlags::UNVERIFIED_FALLBACK);
        ctx.flags.remove(StageFlags::VERIFIED);
    } else if plan.verification > VerificationLevel::None {
        ctx.flags.insert(StageFlags::VERIFIED);
    }
    log::info!(
        "{}: {} ready, verification {}{}",
        plan.candidate,
        plan.format,
        plan.verification,
        if plan.unverified { " (unverified fallback)" } else { "" }
    );
    Ok(LoadedStage { plan, trace })
}

/// Point the context at the device tree the next stage should get: the one
/// the image carried, else the one the board placed. Only a blob whose
/// header checks out is passed on.
fn record_device_tree(
    config: &BootConfig,
    plan: &LoadPlan,
    memory: &dyn TargetMemory,
    ctx: &mut StageContext,
) {
    let range = match plan.device_tree() {
        Some(p) if p.payload.compression.is_compressed() => Some(p.destination),
        Some(p) => Some(MemoryRange::new(p.destination.start, p.payload.length)),
        None => config.layout.device_tree,
    };
    let Some(range) = range else {
        ctx.clear_device_tree();
        return;
    };
    match memory.slice(range).map(check_blob) {
        Ok(Ok(header)) => {
            log::debug!("device tree at {:#x}, {} bytes", range.start, header.totalsize);
            ctx.set_device_tree(range.start);
        }
        Ok(Err(e)) => {
            log::warn!("device tree at {:#x} rejected: {}", range.start, e);
            ctx.clear_device_tree();
        }
        Err(e) => {
            log::warn!("device tree at {:#x} unreadable: {}", range.start, e);
            ctx.clear_device_tree();
        }
    }
}
