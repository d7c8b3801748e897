//! Trust anchors
//!
//! Signature keys are never taken from the image being verified. They come
//! from fused/ROM storage or a separately trusted partition, resolved by the
//! key id the image names.

/// Public key usable for signature verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMaterial {
    /// 32-byte compressed Edwards point
    Ed25519([u8; 32]),
}

/// Key store consulted by the integrity verifier.
pub trait TrustAnchor {
    /// Resolve `key_id`; `None` when the anchor does not know the key.
    fn public_key(&self, key_id: &str) -> Option<KeyMaterial>;
}

/// Trust anchor holding no keys; every signature check fails closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeys;

impl TrustAnchor for NoKeys {
    fn public_key(&self, _key_id: &str) -> Option<KeyMaterial> {
        None
    }
}

/// Build-time key table, e.g. `&[("dev", KeyMaterial::Ed25519([..]))]`.
impl TrustAnchor for [(&str, KeyMaterial)] {
    fn public_key(&self, key_id: &str) -> Option<KeyMaterial> {
        self.iter()
            .find(|(id, _)| *id == key_id)
            .map(|(_, key)| *key)
    }
}
