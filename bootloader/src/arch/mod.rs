//! Architecture handoff conventions
//!
//! What the next stage finds in its first four argument registers, and how
//! its entry point must be aligned, differs per architecture and sometimes
//! per board. The boot core never guesses: it reads a [`HandoffConvention`]
//! table and fills each slot from an [`ArgSource`].
//!
//! Defaults follow the established kernel boot protocols:
//!
//! | arch    | arg0       | arg1        | arg2        | align |
//! |---------|------------|-------------|-------------|-------|
//! | aarch64 | dtb        | 0           | 0           | 4     |
//! | arm     | 0          | machine id  | dtb         | 2     |
//! | riscv64 | hart id    | dtb         | 0           | 2     |
//! | x86_64  | board info | dtb         | 0           | 1     |

use core::fmt;
use stageboot_api::Architecture;

/// Where one argument register's value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgSource {
    Zero,
    /// Address of the validated device tree, or 0 when there is none
    DeviceTree,
    /// Address of the board-info record
    BoardInfo,
    MachineId,
    /// Hart / CPU performing the handoff
    HartId,
    /// Address of the stage record written for the next stage
    StageRecord,
    Constant(u64),
}

impl fmt::Display for ArgSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgSource::Zero => write!(f, "0"),
            ArgSource::DeviceTree => write!(f, "dtb"),
            ArgSource::BoardInfo => write!(f, "board-info"),
            ArgSource::MachineId => write!(f, "machine-id"),
            ArgSource::HartId => write!(f, "hart-id"),
            ArgSource::StageRecord => write!(f, "stage-record"),
            ArgSource::Constant(v) => write!(f, "{:#x}", v),
        }
    }
}

/// Values available to fill argument slots at handoff time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgValues {
    pub device_tree: u64,
    pub board_info: u64,
    pub machine_id: u64,
    pub hart_id: u64,
    pub stage_record: u64,
}

/// Calling contract of the next stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffConvention {
    pub args: [ArgSource; 4],
    /// Required entry point alignment in bytes
    pub entry_align: u64,
}

impl HandoffConvention {
    pub const fn for_arch(arch: Architecture) -> Self {
        use ArgSource::*;
        match arch {
            Architecture::Aarch64 => Self {
                args: [DeviceTree, Zero, Zero, Zero],
                entry_align: 4,
            },
            // Thumb entry points are odd; only A32 entries are accepted
            Architecture::Arm => Self {
                args: [Zero, MachineId, DeviceTree, Zero],
                entry_align: 2,
            },
            // compressed instructions allow 2-byte alignment
            Architecture::Riscv64 => Self {
                args: [HartId, DeviceTree, Zero, Zero],
                entry_align: 2,
            },
            Architecture::X86_64 => Self {
                args: [BoardInfo, DeviceTree, Zero, Zero],
                entry_align: 1,
            },
        }
    }

    /// Stage-to-stage convention: the record address in arg0
    pub const fn stage_record(entry_align: u64) -> Self {
        Self {
            args: [
                ArgSource::StageRecord,
                ArgSource::DeviceTree,
                ArgSource::Zero,
                ArgSource::Zero,
            ],
            entry_align,
        }
    }

    pub fn uses(&self, source: ArgSource) -> bool {
        self.args.contains(&source)
    }

    pub fn resolve(&self, values: &ArgValues) -> [u64; 4] {
        self.args.map(|source| match source {
            ArgSource::Zero => 0,
            ArgSource::DeviceTree => values.device_tree,
            ArgSource::BoardInfo => values.board_info,
            ArgSource::MachineId => values.machine_id,
            ArgSource::HartId => values.hart_id,
            ArgSource::StageRecord => values.stage_record,
            ArgSource::Constant(v) => v,
        })
    }
}

impl fmt::Display for HandoffConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}) align {}",
            self.args[0], self.args[1], self.args[2], self.args[3], self.entry_align
        )
    }
}

/// Page granule used for payload placement
pub const fn page_size(_arch: Architecture) -> u64 {
    4096
}
