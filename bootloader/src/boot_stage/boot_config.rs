//! Boot configuration
//!
//! Everything here is fixed at build time by the board crate. The only
//! textual input is an optional flag string embedded in the board image
//! (`verify=signature max-candidates=3 ...`), parsed once at stage entry.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use stageboot_api::{Architecture, MemoryRange};

use crate::arch::HandoffConvention;

/// Verification strength, ordered weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VerificationLevel {
    None,
    Checksum,
    Signature,
}

impl VerificationLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(VerificationLevel::None),
            "checksum" => Some(VerificationLevel::Checksum),
            "signature" => Some(VerificationLevel::Signature),
            _ => None,
        }
    }
}

impl fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationLevel::None => write!(f, "none"),
            VerificationLevel::Checksum => write!(f, "checksum"),
            VerificationLevel::Signature => write!(f, "signature"),
        }
    }
}

/// Candidate acceptance policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPolicy {
    pub required_verification: VerificationLevel,
    /// Accept the first candidate that failed only verification when
    /// nothing else boots. Audited opt-in; off by default.
    pub allow_fallback_unverified: bool,
    /// Candidates tried at most; 0 means no limit
    pub max_candidates: usize,
    /// Integrity records whose failure only warns
    pub optional_records: Vec<String>,
}

impl BootPolicy {
    pub const fn new() -> Self {
        Self {
            required_verification: VerificationLevel::Checksum,
            allow_fallback_unverified: false,
            max_candidates: 0,
            optional_records: Vec::new(),
        }
    }

    pub fn is_optional(&self, record: &str) -> bool {
        self.optional_records.iter().any(|r| r == record)
    }

    /// Apply a whitespace-separated flag string.
    ///
    /// Supported flags:
    /// - `verify=none|checksum|signature`
    /// - `max-candidates=N`
    /// - `fallback-unverified` / `no-fallback-unverified`
    /// - `optional=<record name>` (repeatable)
    ///
    /// Unknown flags and malformed values are skipped.
    pub fn apply_flags(&mut self, flags: &str) {
        for_each_flag(flags, |key, value| {
            if !self.apply_single_flag(key, value) {
                log::debug!("ignoring boot flag {}", key);
            }
        });
    }

    /// Returns false when the flag is not a policy flag
    fn apply_single_flag(&mut self, key: &str, value: Option<&str>) -> bool {
        match (key, value) {
            ("verify", Some(level)) => match VerificationLevel::from_name(level) {
                Some(level) => self.required_verification = level,
                None => log::warn!("unknown verification level {}", level),
            },
            ("max-candidates", Some(n)) => {
                if let Some(n) = parse_number(n) {
                    self.max_candidates = n as usize;
                }
            }
            ("fallback-unverified", None) => self.allow_fallback_unverified = true,
            ("no-fallback-unverified", None) => self.allow_fallback_unverified = false,
            ("optional", Some(record)) => {
                if !self.is_optional(record) {
                    self.optional_records.push(String::from(record));
                }
            }
            _ => return false,
        }
        true
    }
}

impl Default for BootPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Resource bounds for header and tree parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_tree_depth: usize,
    pub max_tree_nodes: usize,
    pub max_properties: usize,
    /// Largest property value buffered; bigger ones are kept as a range
    pub max_inline_property: usize,
    pub max_strings_size: usize,
    pub max_components: usize,
    pub max_name_len: usize,
}

impl ParseLimits {
    pub const DEFAULT: Self = Self {
        max_tree_depth: 16,
        max_tree_nodes: 512,
        max_properties: 4096,
        max_inline_property: 4 * 1024,
        max_strings_size: 64 * 1024,
        max_components: 16,
        max_name_len: 256,
    };
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Board memory map as seen by the load planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub dram: &'static [MemoryRange],
    /// Window for payloads that carry no load address
    pub scratch: MemoryRange,
    /// Firmware tables, secure carve-outs, MMIO holes inside DRAM
    pub reserved: &'static [MemoryRange],
    /// Device tree the board already placed, if any
    pub device_tree: Option<MemoryRange>,
}

impl MemoryLayout {
    pub const fn empty() -> Self {
        Self {
            dram: &[],
            scratch: MemoryRange::new(0, 0),
            reserved: &[],
            device_tree: None,
        }
    }
}

/// Complete build-time configuration of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub policy: BootPolicy,
    /// Bytes read from offset 0 for format detection
    pub probe_size: usize,
    /// Bytes hashed or copied between watchdog kicks
    pub liveness_chunk: usize,
    pub limits: ParseLimits,
    pub layout: MemoryLayout,
    pub arch: Architecture,
    pub handoff: HandoffConvention,
    /// Component tree configuration to boot instead of the default
    pub fit_configuration: Option<String>,
    /// Fixed address for the stage record handed to the next stage
    pub stage_record_addr: Option<u64>,
    /// Destination window reserved for a compressed payload
    pub compressed_window: u64,
}

impl BootConfig {
    pub const DEFAULT_PROBE_SIZE: usize = 512;
    pub const DEFAULT_LIVENESS_CHUNK: usize = 64 * 1024;
    pub const DEFAULT_COMPRESSED_WINDOW: u64 = 64 * 1024 * 1024;

    pub const fn new(arch: Architecture, layout: MemoryLayout) -> Self {
        Self {
            policy: BootPolicy::new(),
            probe_size: Self::DEFAULT_PROBE_SIZE,
            liveness_chunk: Self::DEFAULT_LIVENESS_CHUNK,
            limits: ParseLimits::DEFAULT,
            layout,
            arch,
            handoff: HandoffConvention::for_arch(arch),
            fit_configuration: None,
            stage_record_addr: None,
            compressed_window: Self::DEFAULT_COMPRESSED_WINDOW,
        }
    }

    /// Apply a flag string; policy flags are forwarded to [`BootPolicy`].
    ///
    /// Stage flags: `config=<name>`, `probe-size=N`, `chunk=N`,
    /// `stage-record=ADDR`, `compressed-window=N`.
    pub fn apply_flags(&mut self, flags: &str) {
        for_each_flag(flags, |key, value| {
            if self.apply_stage_flag(key, value) || self.policy.apply_single_flag(key, value) {
                return;
            }
            log::debug!("ignoring boot flag {}", key);
        });
    }

    fn apply_stage_flag(&mut self, key: &str, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match key {
            "config" => self.fit_configuration = Some(String::from(value)),
            "probe-size" => {
                // the detector needs at least the largest fixed header prefix
                if let Some(n) = parse_number(value).filter(|n| *n >= 64) {
                    self.probe_size = n as usize;
                }
            }
            "chunk" => {
                if let Some(n) = parse_number(value).filter(|n| *n > 0) {
                    self.liveness_chunk = n as usize;
                }
            }
            "stage-record" => self.stage_record_addr = parse_number(value),
            "compressed-window" => {
                if let Some(n) = parse_number(value) {
                    self.compressed_window = n;
                }
            }
            _ => return false,
        }
        true
    }
}

/// Split `flags` into `key` / `key=value` words in a single pass.
fn for_each_flag<F>(flags: &str, mut apply: F)
where
    F: FnMut(&str, Option<&str>),
{
    let mut chars = flags.chars();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;

    loop {
        match chars.next() {
            Some('=') if !in_value => in_value = true,
            Some(' ') | Some('\t') | Some('\n') | None => {
                if !key.is_empty() {
                    apply(&key, in_value.then_some(value.as_str()));
                }
                key.clear();
                value.clear();
                in_value = false;

                if chars.as_str().is_empty() {
                    break;
                }
            }
            Some(c) if in_value => value.push(c),
            Some(c) => key.push(c),
        }
    }
}

/// Decimal or `0x` hexadecimal
fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
