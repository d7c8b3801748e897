//! Integrity - checksums, digests, signatures and the verifier built on them
//!
//! - `checksum`: table-driven CRC32
//! - `digest`: one streaming interface over CRC32 and the SHA family
//! - `signature`: Ed25519 checks against trust-anchor keys
//! - `verifier`: policy-driven verification of a parsed descriptor

pub mod checksum;
pub mod digest;
pub mod signature;
pub mod verifier;

pub use digest::{digest, HashAlgorithm, Hasher};
pub use verifier::{verify, TrustPolicy, VerificationResult};
