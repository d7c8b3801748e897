//! Integrity verification
//!
//! Every record of a descriptor is recomputed from the medium, never from a
//! buffered copy: each covered range is streamed through the record's hash
//! in bounded chunks with a liveness kick after every chunk. Signature
//! records additionally check the digest against a key the trust anchor
//! holds for the record's key id.
//!
//! Outcome rules:
//! - any failing record fails the descriptor, unless policy lists it optional
//! - the achieved level is the strongest record kind that passed
//! - an achieved level below the required one fails closed
//! - every payload must be covered by passing, non-optional records of at
//!   least the required level; an uncovered payload fails closed

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use stageboot_api::{Liveness, MediaAccess, TrustAnchor};

use super::digest::Hasher;
use super::signature::verify_signature;
use crate::boot_stage::boot_config::{BootPolicy, VerificationLevel};
use crate::error::{VerificationFailure, VerifyReason};
use crate::firmware::MediaReader;
use crate::kernel_if::descriptor::{ImageDescriptor, IntegrityKind, IntegrityRecord, Segment};

/// Name reported when the image lacks a record the policy needs
pub const IMAGE_RECORD: &str = "image";

/// Everything the verifier trusts that does not come from the image
pub struct TrustPolicy<'a, T: TrustAnchor + ?Sized> {
    pub policy: &'a BootPolicy,
    pub anchor: &'a T,
    /// Bytes hashed between liveness kicks
    pub chunk: usize,
}

impl<'a, T: TrustAnchor + ?Sized> TrustPolicy<'a, T> {
    pub fn new(policy: &'a BootPolicy, anchor: &'a T, chunk: usize) -> Self {
        Self {
            policy,
            anchor,
            chunk,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// All required records matched; carries the strongest level achieved
    Pass(VerificationLevel),
    Fail(VerificationFailure),
}

impl VerificationResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, VerificationResult::Pass(_))
    }

    pub fn into_result(self) -> Result<VerificationLevel, VerificationFailure> {
        match self {
            VerificationResult::Pass(level) => Ok(level),
            VerificationResult::Fail(failure) => Err(failure),
        }
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationResult::Pass(level) => write!(f, "pass ({})", level),
            VerificationResult::Fail(failure) => write!(f, "fail ({})", failure),
        }
    }
}

/// Level a passing record of `kind` provides
fn level_of(kind: IntegrityKind) -> VerificationLevel {
    match kind {
        IntegrityKind::Crc32 | IntegrityKind::Hash => VerificationLevel::Checksum,
        IntegrityKind::Signature => VerificationLevel::Signature,
    }
}

/// Check every integrity record of `descriptor` against the medium.
pub fn verify<M, T>(
    descriptor: &ImageDescriptor,
    reader: &mut MediaReader<'_, M>,
    trust: &TrustPolicy<'_, T>,
    liveness: &mut dyn Liveness,
) -> VerificationResult
where
    M: MediaAccess,
    T: TrustAnchor + ?Sized,
{
    let required = trust.policy.required_verification;
    let mut achieved = VerificationLevel::None;
    // (start, end) of media ranges checked at the required level
    let mut covered: Vec<(u64, u64)> = Vec::new();

    for record in &descriptor.integrity {
        match check_record(record, reader, trust, liveness) {
            Ok(()) => {
                log::debug!("{}: {} {} ok", record.name, record.kind, record.algorithm);
                let level = level_of(record.kind);
                achieved = achieved.max(level);
                if level >= required && !trust.policy.is_optional(&record.name) {
                    covered.extend(
                        record
                            .media_ranges()
                            .filter_map(|(offset, len)| Some((offset, offset.checked_add(len)?))),
                    );
                }
            }
            Err(reason) if trust.policy.is_optional(&record.name) => {
                log::warn!("{}: optional record failed: {}", record.name, reason);
            }
            Err(reason) => {
                return VerificationResult::Fail(VerificationFailure {
                    record: record.name.clone(),
                    reason,
                });
            }
        }
    }

    let missing = match required {
        VerificationLevel::None => return VerificationResult::Pass(achieved),
        VerificationLevel::Checksum => VerifyReason::MissingChecksum,
        VerificationLevel::Signature => VerifyReason::MissingSignature,
    };
    if achieved < required {
        return VerificationResult::Fail(VerificationFailure {
            record: String::from(IMAGE_RECORD),
            reason: missing,
        });
    }
    for payload in &descriptor.payloads {
        let start = payload.offset;
        let end = payload.end().unwrap_or(u64::MAX);
        if !is_covered(&covered, start, end) {
            log::warn!(
                "{}: [{:#x}, {:#x}) not covered at {} level",
                payload.label(),
                start,
                end,
                required
            );
            return VerificationResult::Fail(VerificationFailure {
                record: String::from(payload.label()),
                reason: missing,
            });
        }
    }
    VerificationResult::Pass(achieved)
}

/// True when the union of `ranges` spans `[start, end)`.
fn is_covered(ranges: &[(u64, u64)], start: u64, end: u64) -> bool {
    let mut at = start;
    while at < end {
        match ranges
            .iter()
            .filter(|(s, e)| *s <= at && at < *e)
            .map(|(_, e)| *e)
            .max()
        {
            Some(next) => at = next,
            None => return false,
        }
    }
    true
}

fn check_record<M, T>(
    record: &IntegrityRecord,
    reader: &mut MediaReader<'_, M>,
    trust: &TrustPolicy<'_, T>,
    liveness: &mut dyn Liveness,
) -> Result<(), VerifyReason>
where
    M: MediaAccess,
    T: TrustAnchor + ?Sized,
{
    let mut hasher = Hasher::new(record.algorithm);
    for segment in &record.segments {
        match segment {
            Segment::Media { offset, length } => reader
                .stream(*offset, *length, trust.chunk, liveness, |bytes| {
                    hasher.update(bytes)
                })
                .map_err(VerifyReason::Io)?,
            Segment::Literal(bytes) => hasher.update(bytes),
        }
    }
    let digest = hasher.finalize();

    match record.kind {
        IntegrityKind::Crc32 | IntegrityKind::Hash => {
            if digest.as_slice() == record.expected.as_slice() {
                Ok(())
            } else {
                Err(VerifyReason::DigestMismatch)
            }
        }
        IntegrityKind::Signature => {
            let key_id = record.key_id.as_deref().ok_or(VerifyReason::UnknownKey)?;
            let algorithm = record
                .signature_algorithm
                .ok_or(VerifyReason::MalformedSignature)?;
            verify_signature(trust.anchor, key_id, algorithm, &digest, &record.expected)
        }
    }
}
