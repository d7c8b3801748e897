//! Signature checks against trust-anchor keys

use core::fmt;
use ed25519_dalek::{Signature, VerifyingKey};
use stageboot_api::{KeyMaterial, TrustAnchor};

use super::digest::HashAlgorithm;
use crate::error::VerifyReason;

/// Public-key algorithm of a signature record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Ed25519,
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureAlgorithm::Ed25519 => write!(f, "ed25519"),
        }
    }
}

/// Split an `algo` value such as `"sha256,ed25519"`.
pub fn parse_signature_algo(value: &str) -> Option<(HashAlgorithm, SignatureAlgorithm)> {
    let (hash, sig) = value.split_once(',')?;
    let hash = HashAlgorithm::from_name(hash)?;
    if !hash.is_cryptographic() {
        return None;
    }
    let sig = match sig {
        "ed25519" => SignatureAlgorithm::Ed25519,
        _ => return None,
    };
    Some((hash, sig))
}

/// Verify `signature` over `digest` with the key the anchor holds for
/// `key_id`. The image never supplies key material.
pub fn verify_signature<T: TrustAnchor + ?Sized>(
    trust: &T,
    key_id: &str,
    algorithm: SignatureAlgorithm,
    digest: &[u8],
    signature: &[u8],
) -> Result<(), VerifyReason> {
    let key = trust.public_key(key_id).ok_or(VerifyReason::UnknownKey)?;
    match (algorithm, key) {
        (SignatureAlgorithm::Ed25519, KeyMaterial::Ed25519(public)) => {
            let public =
                VerifyingKey::from_bytes(&public).map_err(|_| VerifyReason::MalformedSignature)?;
            let bytes: [u8; 64] = signature
                .try_into()
                .map_err(|_| VerifyReason::MalformedSignature)?;
            let signature = Signature::from_bytes(&bytes);
            public
                .verify_strict(digest, &signature)
                .map_err(|_| VerifyReason::BadSignature)
        }
    }
}
