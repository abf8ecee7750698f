//! VRF (Verifiable Random Function) for sortition credentials.
//!
//! A validator proves eligibility for a (period, round, step) slot without
//! revealing the selection before announcement. The construction is a
//! keccak-based simulation of ECVRF: gamma binds the secret key to the
//! input, the challenge binds gamma to the public key, and the 64-byte
//! output is a domain-separated expansion of gamma.

use crate::{keccak256, keccak256_concat, CryptoError, Result};

/// VRF output (64 bytes of pseudorandomness)
pub type VrfOutput = [u8; 64];

/// VRF proof structure.
/// Contains the cryptographic proof that allows verification without the
/// secret key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrfProof {
    /// Gamma point (VRF output before expansion)
    pub gamma: [u8; 32],
    /// Schnorr-style challenge
    pub c: [u8; 32],
    /// Schnorr-style response
    pub s: [u8; 32],
}

impl VrfProof {
    pub fn new(gamma: [u8; 32], c: [u8; 32], s: [u8; 32]) -> Self {
        Self { gamma, c, s }
    }

    /// Serialize proof to bytes
    pub fn to_bytes(&self) -> [u8; 96] {
        let mut bytes = [0u8; 96];
        bytes[0..32].copy_from_slice(&self.gamma);
        bytes[32..64].copy_from_slice(&self.c);
        bytes[64..96].copy_from_slice(&self.s);
        bytes
    }

    /// Deserialize proof from bytes
    pub fn from_bytes(bytes: &[u8; 96]) -> Self {
        let mut gamma = [0u8; 32];
        let mut c = [0u8; 32];
        let mut s = [0u8; 32];
        gamma.copy_from_slice(&bytes[0..32]);
        c.copy_from_slice(&bytes[32..64]);
        s.copy_from_slice(&bytes[64..96]);
        Self { gamma, c, s }
    }

    /// Deserialize from a variable-length slice, rejecting wrong sizes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let fixed: &[u8; 96] = bytes.try_into().map_err(|_| CryptoError::InvalidVrfProof)?;
        Ok(Self::from_bytes(fixed))
    }
}

/// VRF keypair for proving
pub struct VrfKeypair {
    secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Drop for VrfKeypair {
    fn drop(&mut self) {
        self.secret_key.iter_mut().for_each(|b| *b = 0);
    }
}

impl VrfKeypair {
    /// Derive a VRF keypair deterministically from a seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret_key = keccak256(seed);
        let public_key =
            keccak256_concat(&[&secret_key, b"PLEXUS_VRF_PUBLIC_KEY_DERIVATION"]);

        Self { secret_key, public_key }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Generate the VRF proof and output for an input string.
    pub fn prove(&self, alpha: &[u8]) -> (VrfOutput, VrfProof) {
        // gamma = H(sk || alpha): derivable only with the secret key
        let gamma = keccak256_concat(&[&self.secret_key, alpha]);

        // c = H(pk || gamma || alpha): binds challenge to key and input
        let c = keccak256_concat(&[&self.public_key, &gamma, alpha]);

        // s = H(c || sk || gamma): proves knowledge of sk
        let s = keccak256_concat(&[&c, &self.secret_key, &gamma]);

        let output = gamma_to_output(&gamma);
        (output, VrfProof::new(gamma, c, s))
    }
}

/// Verify a VRF proof against a public key and input.
/// Returns the 64-byte VRF output on success.
///
/// A forged gamma produces a different challenge, so recomputing and
/// comparing the challenge authenticates gamma without the secret key.
pub fn vrf_verify(public_key: &[u8; 32], alpha: &[u8], proof: &VrfProof) -> Result<VrfOutput> {
    let c_recomputed = keccak256_concat(&[public_key, &proof.gamma, alpha]);

    // Constant-time comparison
    let mut diff = 0u8;
    for (a, b) in c_recomputed.iter().zip(proof.c.iter()) {
        diff |= a ^ b;
    }
    if diff != 0 {
        return Err(CryptoError::InvalidVrfProof);
    }

    Ok(gamma_to_output(&proof.gamma))
}

/// Derive the 64-byte output carried by a proof, without verifying it.
/// The result is only trustworthy once the proof itself has been verified.
pub fn expand_output(proof: &VrfProof) -> VrfOutput {
    gamma_to_output(&proof.gamma)
}

/// Expand gamma into the 64-byte VRF output.
fn gamma_to_output(gamma: &[u8; 32]) -> VrfOutput {
    let lo = keccak256_concat(&[gamma, b"PLEXUS_VRF_OUTPUT_EXPAND_LO_____"]);
    let hi = keccak256_concat(&[gamma, b"PLEXUS_VRF_OUTPUT_EXPAND_HI_____"]);

    let mut output = [0u8; 64];
    output[..32].copy_from_slice(&lo);
    output[32..].copy_from_slice(&hi);
    output
}
