//! Next-stage interface - descriptor, planning, loading, relocation, handoff

pub mod descriptor;
pub mod kernel_handoff;
pub mod load_plan;
pub mod loader;
pub mod relocation;

pub use descriptor::{ImageDescriptor, IntegrityRecord, PayloadEntry, PayloadRole};
pub use kernel_handoff::{handoff, prepare, HandoffRequest};
pub use load_plan::{LoadPlan, Placement};
pub use loader::StageLoader;
