//! Utility Library - bounds-checked parsing helpers

pub mod cursor;

pub use cursor::{align_up, ByteCursor};
