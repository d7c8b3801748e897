//! Boot stage - configuration, sequencing, context and the top-level flow

pub mod boot_config;
pub mod boot_flow;
pub mod fallback_boot;
pub mod stage_context;

pub use boot_config::{BootConfig, BootPolicy, MemoryLayout, ParseLimits, VerificationLevel};
pub use boot_flow::{boot, halt, load_next_stage, Collaborators, LoadedStage, SelfImage};
pub use fallback_boot::BootSequencer;
pub use stage_context::{StageContext, StageFlags, StageRecord};
