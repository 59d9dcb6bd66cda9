//! 32-byte SHA3-256 digest used for type identity, realm identity and
//! object content hashes.

use crate::types::encoding::{Encode, EncodeSink};
use gnovm_derive::BinaryCodec;
use sha3::{Digest, Sha3_256};
use std::fmt;

pub const HASH_LEN: usize = 32;

/// Domain tags keep leaf and inner node preimages from colliding.
const LEAF_TAG: u8 = 0x00;
const INNER_TAG: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec, Default, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// Hashes raw bytes in one shot.
    pub fn digest(data: &[u8]) -> Hash {
        let mut h = HashBuilder::new();
        h.update(data);
        h.finalize()
    }

    /// Hashes the canonical encoding of `value` without buffering it.
    pub fn of<T: Encode + ?Sized>(value: &T) -> Hash {
        let mut h = HashBuilder::new();
        value.encode(&mut h);
        h.finalize()
    }

    /// Merkle leaf over an object or value image.
    pub fn leaf(data: &[u8]) -> Hash {
        let mut h = HashBuilder::new();
        h.update(&[LEAF_TAG]);
        h.update(data);
        h.finalize()
    }

    /// Merkle inner node over two children.
    pub fn inner(left: &Hash, right: &Hash) -> Hash {
        let mut h = HashBuilder::new();
        h.update(&[INNER_TAG]);
        h.update(&left.0);
        h.update(&right.0);
        h.finalize()
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Incremental SHA3-256 builder. Doubles as an [`EncodeSink`].
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HashBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Decode;

    #[test]
    fn digest_matches_builder() {
        let mut h = Hash::sha3();
        h.update(b"gno.land/r/demo");
        assert_eq!(h.finalize(), Hash::digest(b"gno.land/r/demo"));
    }

    #[test]
    fn of_hashes_encoding() {
        let value = "main".to_string();
        assert_eq!(Hash::of(&value), Hash::digest(&value.to_bytes()));
    }

    #[test]
    fn leaf_and_inner_are_domain_separated() {
        let a = Hash::leaf(b"x");
        assert_ne!(a, Hash::digest(b"x"));
        let mut concat = a.0.to_vec();
        concat.extend_from_slice(&a.0);
        assert_ne!(Hash::inner(&a, &a), Hash::leaf(&concat));
    }

    #[test]
    fn zero_and_short() {
        assert!(Hash::zero().is_zero());
        let h = Hash([0xab; HASH_LEN]);
        assert!(!h.is_zero());
        assert_eq!(h.short(), "abababab");
        assert_eq!(h.to_string().len(), HASH_LEN * 2);
    }

    #[test]
    fn codec_is_raw_bytes() {
        let h = Hash::digest(b"abc");
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HASH_LEN);
        assert_eq!(Hash::from_bytes(&bytes).unwrap(), h);
    }
}
