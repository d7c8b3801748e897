//! Self-relocation
//!
//! A stage copied from slow storage into RAM at an address other than its
//! link address must patch its own absolute pointers before it calls
//! through any of them. Only `RELATIVE` relocations exist in a
//! position-independent stage, so that is all this module applies:
//!
//! - `Elf64_Rela` (aarch64 1027, riscv64 3, x86_64 8): `*site = base + addend`
//! - `Elf32_Rel` (arm 23): `*site += base`
//!
//! Sites are offsets from the link address of the image.

use stageboot_api::Architecture;

use crate::boot_stage::stage_context::{StageContext, StageFlags};
use crate::error::RelocationError;
use crate::utils::cursor::ByteCursor;

pub const R_AARCH64_RELATIVE: u32 = 1027;
pub const R_RISCV_RELATIVE: u32 = 3;
pub const R_X86_64_RELATIVE: u32 = 8;
pub const R_ARM_RELATIVE: u32 = 23;

const RELA64_SIZE: usize = 24;
const REL32_SIZE: usize = 8;

/// Relocation table layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Rela64,
    Rel32,
}

/// Table layout and `RELATIVE` type number for `arch`
pub const fn relative_type(arch: Architecture) -> (TableFormat, u32) {
    match arch {
        Architecture::Aarch64 => (TableFormat::Rela64, R_AARCH64_RELATIVE),
        Architecture::Riscv64 => (TableFormat::Rela64, R_RISCV_RELATIVE),
        Architecture::X86_64 => (TableFormat::Rela64, R_X86_64_RELATIVE),
        Architecture::Arm => (TableFormat::Rel32, R_ARM_RELATIVE),
    }
}

/// Apply every entry of `table` to `image`, which now runs at a link
/// address plus `offset`. Returns the number of sites patched.
pub fn apply_relative(
    image: &mut [u8],
    table: &[u8],
    arch: Architecture,
    offset: u64,
) -> Result<usize, RelocationError> {
    let (format, relative) = relative_type(arch);
    let entry_size = match format {
        TableFormat::Rela64 => RELA64_SIZE,
        TableFormat::Rel32 => REL32_SIZE,
    };
    if table.len() % entry_size != 0 {
        return Err(RelocationError::MalformedTable);
    }

    let mut patched = 0;
    for entry in table.chunks_exact(entry_size) {
        let mut c = ByteCursor::new(entry);
        match format {
            TableFormat::Rela64 => {
                let site = c.le_u64().map_err(|_| RelocationError::MalformedTable)?;
                let info = c.le_u64().map_err(|_| RelocationError::MalformedTable)?;
                let addend = c.le_u64().map_err(|_| RelocationError::MalformedTable)? as i64;
                let kind = (info & 0xffff_ffff) as u32;
                if kind != relative {
                    return Err(RelocationError::UnsupportedType(kind));
                }
                let value = offset
                    .checked_add_signed(addend)
                    .ok_or(RelocationError::AddressOverflow)?;
                site_mut::<8>(image, site)?.copy_from_slice(&value.to_le_bytes());
            }
            TableFormat::Rel32 => {
                let site = c.le_u32().map_err(|_| RelocationError::MalformedTable)? as u64;
                let info = c.le_u32().map_err(|_| RelocationError::MalformedTable)?;
                let kind = info & 0xff;
                if kind != relative {
                    return Err(RelocationError::UnsupportedType(kind));
                }
                let delta = u32::try_from(offset).map_err(|_| RelocationError::AddressOverflow)?;
                let slot = site_mut::<4>(image, site)?;
                let current = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
                let value = current
                    .checked_add(delta)
                    .ok_or(RelocationError::AddressOverflow)?;
                slot.copy_from_slice(&value.to_le_bytes());
            }
        }
        patched += 1;
    }
    Ok(patched)
}

fn site_mut<const N: usize>(image: &mut [u8], site: u64) -> Result<&mut [u8], RelocationError> {
    let start = usize::try_from(site).map_err(|_| RelocationError::SiteOutOfBounds(site))?;
    start
        .checked_add(N)
        .and_then(|end| image.get_mut(start..end))
        .ok_or(RelocationError::SiteOutOfBounds(site))
}

/// Relocate the running stage once.
///
/// A no-op when the stage runs at its link address or has already been
/// relocated, so calling it again is harmless.
pub fn relocate_self(
    ctx: &mut StageContext,
    image: &mut [u8],
    table: &[u8],
    arch: Architecture,
) -> Result<usize, RelocationError> {
    if ctx.flags.contains(StageFlags::RELOCATED) || ctx.load_offset == 0 {
        return Ok(0);
    }
    let patched = apply_relative(image, table, arch, ctx.load_offset)?;
    ctx.flags.insert(StageFlags::RELOCATED);
    log::info!(
        "stage {}: relocated by {:#x}, {} site(s)",
        ctx.stage,
        ctx.load_offset,
        patched
    );
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use stageboot_api::MemoryRange;

    fn rela(site: u64, kind: u32, addend: i64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&site.to_le_bytes());
        out.extend_from_slice(&(kind as u64).to_le_bytes());
        out.extend_from_slice(&addend.to_le_bytes());
        out
    }

    fn ctx(offset: u64) -> StageContext {
        let mut ctx = StageContext::new(MemoryRange::new(0, 64), MemoryRange::new(64, 64));
        ctx.load_offset = offset;
        ctx
    }

    #[test]
    fn test_rela64_relative() {
        let mut image = vec![0u8; 32];
        let mut table = rela(8, R_AARCH64_RELATIVE, 0x100);
        table.extend(rela(16, R_AARCH64_RELATIVE, 0x200));
        let n = apply_relative(&mut image, &table, Architecture::Aarch64, 0x4000_0000).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&image[8..16], &0x4000_0100u64.to_le_bytes());
        assert_eq!(&image[16..24], &0x4000_0200u64.to_le_bytes());
    }

    #[test]
    fn test_rel32_adds_to_site() {
        let mut image = vec![0u8; 16];
        image[4..8].copy_from_slice(&0x1234u32.to_le_bytes());
        let mut table = Vec::new();
        table.extend_from_slice(&4u32.to_le_bytes());
        table.extend_from_slice(&R_ARM_RELATIVE.to_le_bytes());
        apply_relative(&mut image, &table, Architecture::Arm, 0x8000).unwrap();
        assert_eq!(&image[4..8], &0x9234u32.to_le_bytes());
    }

    #[test]
    fn test_rejects_foreign_type_and_bad_site() {
        let mut image = vec![0u8; 16];
        assert_eq!(
            apply_relative(&mut image, &rela(0, 257, 0), Architecture::Aarch64, 1),
            Err(RelocationError::UnsupportedType(257))
        );
        assert_eq!(
            apply_relative(&mut image, &rela(12, R_AARCH64_RELATIVE, 0), Architecture::Aarch64, 1),
            Err(RelocationError::SiteOutOfBounds(12))
        );
        assert_eq!(
            apply_relative(&mut image, &[0u8; 23], Architecture::Aarch64, 1),
            Err(RelocationError::MalformedTable)
        );
    }

    #[test]
    fn test_relocate_self_is_idempotent() {
        let mut image = vec![0u8; 16];
        let table = rela(0, R_RISCV_RELATIVE, 0x10);
        let mut c = ctx(0x8000_0000);
        assert_eq!(relocate_self(&mut c, &mut image, &table, Architecture::Riscv64), Ok(1));
        let once = image.clone();
        assert_eq!(relocate_self(&mut c, &mut image, &table, Architecture::Riscv64), Ok(0));
        assert_eq!(image, once);
        assert!(c.flags.contains(StageFlags::RELOCATED));
    }

    #[test]
    fn test_zero_offset_is_noop() {
        let mut image = vec![0xAAu8; 16];
        let mut c = ctx(0);
        let table = rela(0, R_X86_64_RELATIVE, 0x10);
        assert_eq!(relocate_self(&mut c, &mut image, &table, Architecture::X86_64), Ok(0));
        assert_eq!(image, vec![0xAAu8; 16]);
        assert!(!c.flags.contains(StageFlags::RELOCATED));
    }
}
