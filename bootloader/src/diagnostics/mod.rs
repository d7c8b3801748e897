//! Diagnostics - record of what each boot candidate went through

pub mod boot_trace;

pub use boot_trace::{BootTrace, PipelineStage, TraceEntry};
