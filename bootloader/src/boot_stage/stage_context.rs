//! Per-stage execution context
//!
//! Describes the running stage (where its code and stack live, whether it
//! has relocated itself) and what it learned along the way (validated device
//! tree, verification outcome). Stages share no heap, so the context crosses
//! a stage boundary only as a fixed-layout [`StageRecord`] written to a
//! configured address and validated by the receiver before use.

use bitflags::bitflags;
use core::mem::size_of;
use stageboot_api::{BoardInfo, MemoryRange};
use static_assertions::const_assert_eq;

use crate::arch::ArgValues;
use crate::error::ParseError;
use crate::utils::cursor::ByteCursor;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StageFlags: u32 {
        /// Self-relocation fixups have been applied
        const RELOCATED = 1 << 0;
        /// `device_tree` points at a header-checked blob
        const DEVICE_TREE_VALID = 1 << 1;
        /// The loaded image passed policy verification
        const VERIFIED = 1 << 2;
        /// The loaded image was accepted through the unverified fallback
        const UNVERIFIED_FALLBACK = 1 << 3;
    }
}

/// Fixed-layout context handed from one stage to the next.
///
/// Little-endian on the wire regardless of host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StageRecord {
    pub magic: u32,
    pub version: u32,
    pub stage: u32,
    pub flags: u32,
    pub image_start: u64,
    pub image_len: u64,
    pub device_tree: u64,
    pub board_info: u64,
    pub boot_cpu: u64,
    pub machine_id: u32,
    pub reserved: u32,
}

const_assert_eq!(size_of::<StageRecord>(), StageRecord::SIZE);

impl StageRecord {
    /// "SBSR"
    pub const MAGIC: u32 = 0x5342_5352;
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let words32 = [self.magic, self.version, self.stage, self.flags];
        for (i, w) in words32.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        let words64 = [
            self.image_start,
            self.image_len,
            self.device_tree,
            self.board_info,
            self.boot_cpu,
        ];
        for (i, w) in words64.iter().enumerate() {
            let at = 16 + i * 8;
            out[at..at + 8].copy_from_slice(&w.to_le_bytes());
        }
        out[56..60].copy_from_slice(&self.machine_id.to_le_bytes());
        out[60..64].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    /// Decode and validate magic and version; nothing else is trusted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut c = ByteCursor::new(bytes);
        let magic = c.le_u32()?;
        if magic != Self::MAGIC {
            return Err(ParseError::BadMagic);
        }
        let version = c.le_u32()?;
        if version != Self::VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        Ok(Self {
            magic,
            version,
            stage: c.le_u32()?,
            flags: c.le_u32()?,
            image_start: c.le_u64()?,
            image_len: c.le_u64()?,
            device_tree: c.le_u64()?,
            board_info: c.le_u64()?,
            boot_cpu: c.le_u64()?,
            machine_id: c.le_u32()?,
            reserved: c.le_u32()?,
        })
    }
}

/// Context of the running stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageContext {
    /// 0 for the first stage after reset
    pub stage: u32,
    pub flags: StageFlags,
    /// Code, data and bss of the running stage
    pub image: MemoryRange,
    pub stack: MemoryRange,
    /// Run address minus link address
    pub load_offset: u64,
    pub device_tree: Option<u64>,
    pub board_info: Option<u64>,
    pub machine_id: u32,
    pub boot_cpu: u64,
}

impl StageContext {
    pub const fn new(image: MemoryRange, stack: MemoryRange) -> Self {
        Self {
            stage: 0,
            flags: StageFlags::empty(),
            image,
            stack,
            load_offset: 0,
            device_tree: None,
            board_info: None,
            machine_id: 0,
            boot_cpu: 0,
        }
    }

    /// Memory that no load destination may touch while this stage runs
    pub fn protected(&self) -> [MemoryRange; 2] {
        [self.image, self.stack]
    }

    pub fn set_device_tree(&mut self, address: u64) {
        self.device_tree = Some(address);
        self.flags.insert(StageFlags::DEVICE_TREE_VALID);
    }

    pub fn clear_device_tree(&mut self) {
        self.device_tree = None;
        self.flags.remove(StageFlags::DEVICE_TREE_VALID);
    }

    pub fn set_board(&mut self, address: u64, board: &BoardInfo) {
        self.board_info = Some(address);
        self.machine_id = board.machine_id;
        self.boot_cpu = board.boot_cpu as u64;
    }

    /// Values for the handoff argument registers
    pub fn arg_values(&self, stage_record: Option<u64>) -> ArgValues {
        ArgValues {
            device_tree: match self.device_tree {
                Some(addr) if self.flags.contains(StageFlags::DEVICE_TREE_VALID) => addr,
                _ => 0,
            },
            board_info: self.board_info.unwrap_or(0),
            machine_id: self.machine_id as u64,
            hart_id: self.boot_cpu,
            stage_record: stage_record.unwrap_or(0),
        }
    }

    pub fn to_record(&self) -> StageRecord {
        StageRecord {
            magic: StageRecord::MAGIC,
            version: StageRecord::VERSION,
            stage: self.stage,
            flags: self.flags.bits(),
            image_start: self.image.start,
            image_len: self.image.len,
            device_tree: self.device_tree.unwrap_or(0),
            board_info: self.board_info.unwrap_or(0),
            boot_cpu: self.boot_cpu,
            machine_id: self.machine_id,
            reserved: 0,
        }
    }

    /// Context of the stage that receives `record`.
    ///
    /// Only facts about the hardware and the device tree carry over; the
    /// receiving stage describes its own image and stack.
    pub fn from_record(
        bytes: &[u8],
        image: MemoryRange,
        stack: MemoryRange,
    ) -> Result<Self, ParseError> {
        let record = StageRecord::from_bytes(bytes)?;
        let previous = StageFlags::from_bits_truncate(record.flags);
        let mut ctx = Self::new(image, stack);
        ctx.stage = record.stage.saturating_add(1);
        ctx.machine_id = record.machine_id;
        ctx.boot_cpu = record.boot_cpu;
        ctx.board_info = (record.board_info != 0).then_some(record.board_info);
        if previous.contains(StageFlags::DEVICE_TREE_VALID) && record.device_tree != 0 {
            ctx.set_device_tree(record.device_tree);
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> StageContext {
        let mut ctx = StageContext::new(
            MemoryRange::new(0x4000_0000, 0x2_0000),
            MemoryRange::new(0x4010_0000, 0x4000),
        );
        ctx.set_board(0x4020_0000, &BoardInfo::new(0x183, 1, 0x4000_0000, 0x4000_0000));
        ctx
    }

    #[test]
    fn test_record_round_trip_into_next_stage() {
        let mut ctx = context();
        ctx.set_device_tree(0x4800_0000);
        ctx.flags.insert(StageFlags::VERIFIED | StageFlags::RELOCATED);
        let bytes = ctx.to_record().to_bytes();

        let next = StageContext::from_record(
            &bytes,
            MemoryRange::new(0x4008_0000, 0x1000),
            MemoryRange::new(0x4030_0000, 0x1000),
        )
        .unwrap();
        assert_eq!(next.stage, 1);
        assert_eq!(next.device_tree, Some(0x4800_0000));
        assert_eq!(next.machine_id, 0x183);
        assert_eq!(next.board_info, Some(0x4020_0000));
        assert!(!next.flags.contains(StageFlags::RELOCATED));
        assert!(next.flags.contains(StageFlags::DEVICE_TREE_VALID));
    }

    #[test]
    fn test_record_rejects_bad_magic_and_version() {
        let mut bytes = context().to_record().to_bytes();
        bytes[0] ^= 0xFF;
        let range = MemoryRange::new(0, 1);
        assert_eq!(
            StageContext::from_record(&bytes, range, range),
            Err(ParseError::BadMagic)
        );

        let mut bytes = context().to_record().to_bytes();
        bytes[4] = 9;
        assert_eq!(
            StageContext::from_record(&bytes, range, range),
            Err(ParseError::UnsupportedVersion(9))
        );

        let bytes = context().to_record().to_bytes();
        assert_eq!(
            StageContext::from_record(&bytes[..20], range, range),
            Err(ParseError::Truncated)
        );
    }

    #[test]
    fn test_device_tree_not_passed_unless_valid() {
        let mut ctx = context();
        ctx.device_tree = Some(0x4800_0000);
        assert_eq!(ctx.arg_values(None).device_tree, 0);
        ctx.set_device_tree(0x4800_0000);
        assert_eq!(ctx.arg_values(Some(0x4f00_0000)).device_tree, 0x4800_0000);
        assert_eq!(ctx.arg_values(Some(0x4f00_0000)).stage_record, 0x4f00_0000);
        ctx.clear_device_tree();
        assert_eq!(ctx.arg_values(None).device_tree, 0);
    }
}
