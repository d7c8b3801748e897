//! Stageboot API - collaborator interfaces for the boot core
//!
//! The boot core never talks to hardware directly. Everything it needs from
//! the platform is expressed here as a narrow trait or a plain-data type:
//!
//! - **media**: open/read/size/close over the selected boot device
//! - **liveness**: watchdog servicing during long loops
//! - **trust**: signature keys resolved outside the image under test
//! - **codec**: decompression of payloads marked compressed
//! - **memory**: physical address ranges and access to load destinations
//! - **board**: the board-info record and target architecture
//! - **platform**: cache/interrupt cleanup before handoff and the halt path
//!
//! Board crates implement these traits; the boot core only consumes them.

#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod codec;
pub mod liveness;
pub mod media;
pub mod memory;
pub mod platform;
pub mod trust;

pub use board::{Architecture, BoardInfo};
pub use codec::{CodecError, CompressionKind, Decompressor, NoCodec};
pub use liveness::{Liveness, NoWatchdog};
pub use media::{BootDeviceCandidate, IoError, MediaAccess, MediaKind};
pub use memory::{MemoryError, MemoryRange, TargetMemory};
pub use platform::Platform;
pub use trust::{KeyMaterial, NoKeys, TrustAnchor};
