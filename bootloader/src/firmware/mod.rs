//! Firmware Interface - media and memory adapters

pub mod direct_memory;
pub mod media_reader;

pub use direct_memory::DirectMemory;
pub use media_reader::MediaReader;
