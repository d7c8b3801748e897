//! Bounds-checked byte cursor for header parsing
//!
//! Header fields are read through [`ByteCursor`] instead of casting raw
//! pointers to packed structs. Every read checks the remaining length first
//! and fails with [`ParseError::Truncated`] instead of reading past the
//! buffer.

use crate::error::ParseError;

pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Cursor positioned at `pos`; fails if `pos` is past the end.
    pub fn at(data: &'a [u8], pos: usize) -> Result<Self, ParseError> {
        if pos > data.len() {
            return Err(ParseError::Truncated);
        }
        Ok(Self { data, pos })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        self.take(n).map(|_| ())
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(n).ok_or(ParseError::SizeOverflow)?;
        let bytes = self.data.get(self.pos..end).ok_or(ParseError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    pub fn be_u32(&mut self) -> Result<u32, ParseError> {
        self.array::<4>().map(u32::from_be_bytes)
    }

    pub fn be_u64(&mut self) -> Result<u64, ParseError> {
        self.array::<8>().map(u64::from_be_bytes)
    }

    pub fn le_u32(&mut self) -> Result<u32, ParseError> {
        self.array::<4>().map(u32::from_le_bytes)
    }

    pub fn le_u64(&mut self) -> Result<u64, ParseError> {
        self.array::<8>().map(u64::from_le_bytes)
    }
}

/// Big-endian u32 at a fixed offset
pub fn be_u32_at(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    ByteCursor::at(data, offset)?.be_u32()
}

/// Little-endian u32 at a fixed offset
pub fn le_u32_at(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    ByteCursor::at(data, offset)?.le_u32()
}

/// Text of a NUL-padded fixed-width field.
///
/// Bytes after the first NUL are ignored; the text itself must be UTF-8.
pub fn fixed_str(field: &[u8]) -> Result<&str, ParseError> {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..len]).map_err(|_| ParseError::InvalidString)
}

/// Round `value` up to a multiple of the power-of-two `align`.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
