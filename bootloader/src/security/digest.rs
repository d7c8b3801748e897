//! Incremental digests
//!
//! One [`Hasher`] per integrity record, fed chunk by chunk from media so a
//! covered range never has to fit in RAM.

use arrayvec::ArrayVec;
use core::fmt;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use super::checksum::Crc32;

/// Largest digest produced (SHA-512)
pub const MAX_DIGEST_LEN: usize = 64;

pub type DigestBytes = ArrayVec<u8, MAX_DIGEST_LEN>;

/// Digest algorithm named by an integrity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Crc32,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Component tree `algo` property value
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "crc32" => Some(HashAlgorithm::Crc32),
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub const fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Crc32 => 4,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Whether the algorithm resists deliberate collisions
    pub const fn is_cryptographic(&self) -> bool {
        !matches!(self, HashAlgorithm::Crc32)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Crc32 => write!(f, "crc32"),
            HashAlgorithm::Sha1 => write!(f, "sha1"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Running digest state
#[derive(Clone)]
pub enum Hasher {
    Crc32(Crc32),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Crc32 => Hasher::Crc32(Crc32::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Crc32(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Final digest bytes. CRC32 is emitted big-endian, as stored in
    /// component tree `value` properties.
    pub fn finalize(self) -> DigestBytes {
        let mut out = DigestBytes::new();
        match self {
            Hasher::Crc32(h) => out.extend(h.finalize().to_be_bytes()),
            Hasher::Sha1(h) => out.extend(h.finalize()),
            Hasher::Sha256(h) => out.extend(h.finalize()),
            Hasher::Sha512(h) => out.extend(h.finalize()),
        }
        out
    }
}

/// One-shot digest of `data`
pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> DigestBytes {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hex::encode(digest(HashAlgorithm::Sha256, b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex::encode(digest(HashAlgorithm::Sha1, b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(hex::encode(digest(HashAlgorithm::Crc32, b"123456789")), "cbf43926");
    }

    #[test]
    fn test_digest_lengths() {
        for algo in [
            HashAlgorithm::Crc32,
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(digest(algo, b"x").len(), algo.digest_len());
            assert_eq!(HashAlgorithm::from_name(&algo.to_string()), Some(algo));
        }
    }

    #[test]
    fn test_incremental() {
        let mut h = Hasher::new(HashAlgorithm::Sha512);
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finalize(), digest(HashAlgorithm::Sha512, b"hello world"));
    }
}
