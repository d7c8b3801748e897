//! Boot trace - ordered record of abandoned candidates
//!
//! Each abandoned candidate produces exactly one entry and one `warn!` line
//! of the form `<candidate>: <stage> failed: <error>`, so a field log and a
//! test can both tell which device failed where and why.

use alloc::vec::Vec;
use core::fmt;
use stageboot_api::BootDeviceCandidate;

use crate::error::BootError;

/// Pipeline step a candidate was abandoned in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Open,
    Probe,
    Detect,
    Parse,
    Verify,
    Plan,
    Load,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Open => write!(f, "open"),
            PipelineStage::Probe => write!(f, "probe"),
            PipelineStage::Detect => write!(f, "detect"),
            PipelineStage::Parse => write!(f, "parse"),
            PipelineStage::Verify => write!(f, "verify"),
            PipelineStage::Plan => write!(f, "plan"),
            PipelineStage::Load => write!(f, "load"),
        }
    }
}

/// One abandoned candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub candidate: BootDeviceCandidate,
    pub stage: PipelineStage,
    pub error: BootError,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} failed: {}", self.candidate, self.stage, self.error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootTrace {
    entries: Vec<TraceEntry>,
}

impl BootTrace {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Record and log one abandoned candidate.
    pub fn record(&mut self, candidate: BootDeviceCandidate, stage: PipelineStage, error: BootError) {
        let entry = TraceEntry {
            candidate,
            stage,
            error,
        };
        log::warn!("{}", entry);
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }
}

impl fmt::Display for BootTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(f, "{:2}. {}", i + 1, entry)?;
        }
        Ok(())
    }
}
