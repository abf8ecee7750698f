//! # Plexus Cryptography
//!
//! Cryptographic primitives for the Plexus consensus core.
//!
//! ## Features
//! - Recoverable secp256k1 ECDSA signatures (65-byte r||s||v)
//! - Ethereum-style address derivation
//! - Keccak-256 hashing
//! - Hash-based VRF for sortition credentials

pub mod error;
pub mod signature;
pub mod vrf;

pub use error::{CryptoError, Result};
pub use signature::{recover_address, KeyPair};
pub use vrf::{vrf_verify, VrfKeypair, VrfOutput, VrfProof};

use sha3::{Digest, Keccak256};

/// 32-byte hash (256-bit)
pub type Hash = [u8; 32];

/// 20-byte account address (160-bit)
pub type Address = [u8; 20];

/// 65-byte recoverable ECDSA signature (r || s || v)
pub type Signature = [u8; 65];

/// Hash data using Keccak-256
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Keccak-256 over the concatenation of multiple byte slices.
///
/// Avoids an intermediate allocation when hashing composed inputs such as
/// `vrf_output || address || index`.
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256() {
        let hash = keccak256(b"test data");
        assert_eq!(hash.len(), 32);
        // Deterministic
        assert_eq!(hash, keccak256(b"test data"));
        assert_ne!(hash, keccak256(b"test datb"));
    }

    #[test]
    fn test_keccak256_empty_input() {
        // Well-known Keccak-256 of the empty string
        let hash = keccak256(&[]);
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak256_concat_matches_flat() {
        let flat = keccak256(b"abcdef");
        let concat = keccak256_concat(&[b"ab", b"cd", b"ef"]);
        assert_eq!(flat, concat);
    }
}
