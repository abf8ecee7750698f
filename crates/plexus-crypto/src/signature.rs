use crate::{keccak256, Address, CryptoError, Hash, Result, Signature};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use zeroize::Zeroize;

/// Key pair for signing consensus messages.
///
/// # Security
/// The secret key is overwritten in memory when the KeyPair is dropped so
/// that key material does not linger after use.
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        // secp256k1::SecretKey stores the scalar internally and
        // `secret_bytes()` returns a copy, so the key is obliterated by
        // overwriting it in-place with a well-known dummy scalar.
        let dummy = [0x01u8; 32];
        if let Ok(dummy_key) = SecretKey::from_slice(&dummy) {
            self.secret_key = dummy_key;
        }
        let mut secret_bytes = self.secret_key.secret_bytes();
        secret_bytes.zeroize();
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        // The bytes were already validated as a valid scalar; failure here
        // means memory corruption and panic is appropriate.
        let sk = SecretKey::from_slice(&self.secret_key.secret_bytes())
            .unwrap_or_else(|_| panic!("FATAL: KeyPair clone failed"));
        let pk = self.public_key;
        Self { secret_key: sk, public_key: pk }
    }
}

impl KeyPair {
    /// Generate a new random key pair using the OS CSPRNG.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut rand::rngs::OsRng);

        Self { secret_key, public_key }
    }

    /// Create key pair from secret key bytes
    pub fn from_secret(bytes: &[u8; 32]) -> Result<Self> {
        let secret_key =
            SecretKey::from_slice(bytes).map_err(|e| CryptoError::Secp256k1Error(e.to_string()))?;
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);

        Ok(Self { secret_key, public_key })
    }

    /// Sign a 32-byte message hash, producing a 65-byte recoverable
    /// signature (r || s || v). The recovery id byte allows the voter
    /// address to be recovered from the signature alone.
    pub fn sign(&self, message_hash: &Hash) -> Result<Signature> {
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(message_hash)
            .map_err(|e| CryptoError::Secp256k1Error(e.to_string()))?;
        let rec_sig = secp.sign_ecdsa_recoverable(&message, &self.secret_key);
        let (rec_id, sig_bytes) = rec_sig.serialize_compact();

        let mut result = [0u8; 65];
        result[..64].copy_from_slice(&sig_bytes);
        result[64] = rec_id.to_i32() as u8;
        Ok(result)
    }

    /// Get the uncompressed public key bytes (65 bytes, 0x04-prefixed)
    pub fn public_key_bytes(&self) -> [u8; 65] {
        self.public_key.serialize_uncompressed()
    }

    /// Derive address from public key (Ethereum-style)
    pub fn address(&self) -> Address {
        let pubkey_bytes = self.public_key.serialize_uncompressed();
        // Skip the 0x04 prefix, take the last 20 bytes of the hash
        let hash = keccak256(&pubkey_bytes[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..]);
        address
    }
}

/// Recover the signer address from a message hash and a 65-byte
/// recoverable signature.
pub fn recover_address(message_hash: &Hash, signature: &Signature) -> Result<Address> {
    let pubkey = recover_public_key(message_hash, signature)?;
    address_from_public_key(&pubkey)
}

/// Recover the uncompressed public key from a message hash and a 65-byte
/// recoverable signature.
pub fn recover_public_key(message_hash: &Hash, signature: &Signature) -> Result<[u8; 65]> {
    let secp = Secp256k1::new();

    let message = Message::from_digest_slice(message_hash)
        .map_err(|e| CryptoError::Secp256k1Error(e.to_string()))?;

    let rec_id = RecoveryId::from_i32(signature[64] as i32)
        .map_err(|_| CryptoError::InvalidSignature)?;

    let rec_sig = RecoverableSignature::from_compact(&signature[..64], rec_id)
        .map_err(|_| CryptoError::InvalidSignature)?;

    let pubkey = secp
        .recover_ecdsa(&message, &rec_sig)
        .map_err(|_| CryptoError::InvalidSignature)?;

    Ok(pubkey.serialize_uncompressed())
}

/// Derive address from uncompressed public key bytes
pub fn address_from_public_key(public_key: &[u8]) -> Result<Address> {
    if public_key.len() != 65 || public_key[0] != 0x04 {
        return Err(CryptoError::InvalidPublicKey);
    }

    let hash = keccak256(&public_key[1..]);

    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);

    Ok(address)
}
