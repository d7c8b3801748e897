//! Physical address ranges and access to load destinations

use core::fmt;

/// Half-open physical address range `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct MemoryRange {
    pub start: u64,
    pub len: u64,
}

impl MemoryRange {
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// End address; `None` if the range wraps the address space.
    pub const fn end(&self) -> Option<u64> {
        self.start.checked_add(self.len)
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        match self.end() {
            Some(end) => addr >= self.start && addr < end,
            None => false,
        }
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains_range(&self, other: &MemoryRange) -> bool {
        match (self.end(), other.end()) {
            (Some(end), Some(other_end)) => other.start >= self.start && other_end <= end,
            _ => false,
        }
    }

    /// True when the two ranges share at least one byte.
    ///
    /// A wrapping range is treated as overlapping everything.
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        match (self.end(), other.end()) {
            (Some(end), Some(other_end)) => self.start < other_end && other.start < end,
            _ => true,
        }
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "[{:#x}..{:#x})", self.start, end),
            None => write!(f, "[{:#x}+{:#x} wraps)", self.start, self.len),
        }
    }
}

/// Target memory access failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Range not backed by accessible memory
    Unmapped(MemoryRange),
    /// Range does not fit the host address width
    AddressWidth,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Unmapped(range) => write!(f, "memory {} not accessible", range),
            MemoryError::AddressWidth => write!(f, "address exceeds host pointer width"),
        }
    }
}

/// Byte-level access to destination memory.
///
/// On hardware this is identity-mapped physical RAM; in tests it is a
/// buffer. The boot core only asks for ranges it has already validated.
pub trait TargetMemory {
    fn slice(&self, range: MemoryRange) -> Result<&[u8], MemoryError>;

    fn slice_mut(&mut self, range: MemoryRange) -> Result<&mut [u8], MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_edges() {
        let a = MemoryRange::new(0x1000, 0x1000);
        assert!(!a.overlaps(&MemoryRange::new(0x2000, 0x10)));
        assert!(!a.overlaps(&MemoryRange::new(0x0, 0x1000)));
        assert!(a.overlaps(&MemoryRange::new(0x1fff, 1)));
        assert!(a.overlaps(&MemoryRange::new(0x0, 0x1001)));
    }

    #[test]
    fn test_empty_never_overlaps() {
        let a = MemoryRange::new(0x1000, 0x1000);
        assert!(!a.overlaps(&MemoryRange::new(0x1800, 0)));
    }

    #[test]
    fn test_wrapping_range() {
        let wrap = MemoryRange::new(u64::MAX - 1, 4);
        assert!(wrap.end().is_none());
        assert!(wrap.overlaps(&MemoryRange::new(0, 1)));
        assert!(!MemoryRange::new(0, u64::MAX).contains_range(&wrap));
    }

    #[test]
    fn test_contains_range() {
        let dram = MemoryRange::new(0x4000_0000, 0x1000_0000);
        assert!(dram.contains_range(&MemoryRange::new(0x4000_0000, 0x1000_0000)));
        assert!(!dram.contains_range(&MemoryRange::new(0x4fff_ffff, 2)));
    }
}
