//! Board information passed between stages
//!
//! This module defines the target architecture identifiers and the small
//! board-info record a stage leaves in memory for its successor.

use core::fmt;
use static_assertions::const_assert_eq;

/// Target CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Architecture {
    Arm = 0,
    Aarch64 = 1,
    Riscv64 = 2,
    X86_64 = 3,
}

impl Architecture {
    /// Architecture this crate is being compiled for, if supported.
    pub const fn native() -> Option<Self> {
        if cfg!(target_arch = "aarch64") {
            Some(Architecture::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Some(Architecture::Arm)
        } else if cfg!(target_arch = "riscv64") {
            Some(Architecture::Riscv64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else {
            None
        }
    }

    /// Legacy image header `arch` byte
    pub const fn legacy_code(&self) -> u8 {
        match self {
            Architecture::Arm => 2,
            Architecture::Aarch64 => 22,
            Architecture::X86_64 => 24,
            Architecture::Riscv64 => 26,
        }
    }

    /// Component tree `arch` property value
    pub fn from_tree_name(name: &str) -> Option<Self> {
        match name {
            "arm" => Some(Architecture::Arm),
            "arm64" => Some(Architecture::Aarch64),
            "riscv" => Some(Architecture::Riscv64),
            "x86_64" => Some(Architecture::X86_64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Arm => write!(f, "arm"),
            Architecture::Aarch64 => write!(f, "arm64"),
            Architecture::Riscv64 => write!(f, "riscv64"),
            Architecture::X86_64 => write!(f, "x86_64"),
        }
    }
}

/// Lightweight board-info record.
///
/// Lives at a fixed, board-chosen address; the next stage receives a
/// pointer to it when the handoff convention asks for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BoardInfo {
    /// Must be [`BoardInfo::MAGIC`]
    pub magic: u32,
    /// Layout version, [`BoardInfo::VERSION`]
    pub version: u32,
    /// Machine type number (32-bit ARM kernels)
    pub machine_id: u32,
    /// Boot hart / CPU that performs the handoff
    pub boot_cpu: u32,
    /// First DRAM bank
    pub dram_base: u64,
    pub dram_size: u64,
}

const_assert_eq!(core::mem::size_of::<BoardInfo>(), 32);

impl BoardInfo {
    /// "SBBI"
    pub const MAGIC: u32 = 0x5342_4249;
    pub const VERSION: u32 = 1;

    pub const fn new(machine_id: u32, boot_cpu: u32, dram_base: u64, dram_size: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            machine_id,
            boot_cpu,
            dram_base,
            dram_size,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }
}
