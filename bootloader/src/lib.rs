//! Stageboot Boot Core
//!
//! Boot-stage dispatch, image loading and verification for SoC firmware.
//! The crate is organized leaf-first:
//!
//! - **protocol**: format detection and the per-format header parsers
//! - **security**: checksums, digests, signatures and the integrity verifier
//! - **kernel_if**: image descriptors, load planning, the stage loader,
//!   self-relocation and the final handoff
//! - **boot_stage**: configuration, stage context, the boot device
//!   sequencer and the top-level boot flow
//! - **firmware**: media reader and target memory adapters
//! - **diagnostics**: the structured boot trace
//! - **arch**: per-architecture handoff conventions
//!
//! Hardware access (media drivers, watchdog, caches, keys, codecs) comes in
//! through the traits of `stageboot-api`; nothing here touches a register.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

/// Per-architecture handoff conventions
pub mod arch;

/// Boot orchestration - configuration, context, sequencer, flow
pub mod boot_stage;

/// Diagnostics - boot trace
pub mod diagnostics;

/// Error types
pub mod error;

/// Media reader and target memory adapters
pub mod firmware;

/// Kernel interface - descriptors, planning, loading, relocation, handoff
pub mod kernel_if;

/// Image formats - detection and header parsing
pub mod protocol;

/// Integrity - checksums, digests, signatures, verification
pub mod security;

/// Bounds-checked parsing helpers
pub mod utils;

pub use boot_stage::boot_config::{BootConfig, BootPolicy, ParseLimits, VerificationLevel};
pub use boot_stage::boot_flow::{boot, load_next_stage, Collaborators, LoadedStage};
pub use boot_stage::fallback_boot::BootSequencer;
pub use boot_stage::stage_context::{StageContext, StageFlags, StageRecord};
pub use error::{BootError, BootFailure, LoadError, ParseError, PlanError};
pub use kernel_if::descriptor::{ImageDescriptor, IntegrityRecord, PayloadEntry};
pub use kernel_if::load_plan::LoadPlan;
pub use protocol::{classify, ImageFormatKind, ProbeBuffer};
pub use security::verifier::{verify, VerificationResult};
