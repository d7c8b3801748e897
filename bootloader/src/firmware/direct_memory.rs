//! Identity-mapped physical memory
//!
//! On the target, load destinations are plain physical RAM reachable at
//! their own address. [`DirectMemory`] hands out slices over those
//! addresses, restricted to the DRAM banks it was built with.

use arrayvec::ArrayVec;
use stageboot_api::{MemoryError, MemoryRange, TargetMemory};

/// Maximum number of accessible banks
pub const MAX_BANKS: usize = 8;

pub struct DirectMemory {
    banks: ArrayVec<MemoryRange, MAX_BANKS>,
}

impl DirectMemory {
    /// # Safety
    ///
    /// Every range in `banks` must be RAM that is identity-mapped, writable
    /// and not used by anything else for as long as this value lives (other
    /// than ranges the load plan has already excluded). Banks beyond
    /// [`MAX_BANKS`] are ignored.
    pub unsafe fn new(banks: &[MemoryRange]) -> Self {
        let mut list = ArrayVec::new();
        for bank in banks.iter().take(MAX_BANKS) {
            list.push(*bank);
        }
        Self { banks: list }
    }

    fn check(&self, range: MemoryRange) -> Result<(usize, usize), MemoryError> {
        if !self.banks.iter().any(|bank| bank.contains_range(&range)) {
            return Err(MemoryError::Unmapped(range));
        }
        let start = usize::try_from(range.start).map_err(|_| MemoryError::AddressWidth)?;
        let len = usize::try_from(range.len).map_err(|_| MemoryError::AddressWidth)?;
        start.checked_add(len).ok_or(MemoryError::AddressWidth)?;
        if start == 0 {
            // never form a slice at the null address
            return Err(MemoryError::Unmapped(range));
        }
        Ok((start, len))
    }
}

impl TargetMemory for DirectMemory {
    fn slice(&self, range: MemoryRange) -> Result<&[u8], MemoryError> {
        let (start, len) = self.check(range)?;
        // SAFETY: the range lies inside a bank the constructor's caller
        // vouched for, and is non-null.
        Ok(unsafe { core::slice::from_raw_parts(start as *const u8, len) })
    }

    fn slice_mut(&mut self, range: MemoryRange) -> Result<&mut [u8], MemoryError> {
        let (start, len) = self.check(range)?;
        // SAFETY: as above; `&mut self` keeps the slice exclusive.
        Ok(unsafe { core::slice::from_raw_parts_mut(start as *mut u8, len) })
    }
}
