use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("RLP decoding error: {0}")]
    Rlp(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("VRF proof verification failed")]
    InvalidVrfProof,

    #[error("Invalid block payload: {0}")]
    InvalidBlock(String),

    #[error("Invalid votes bundle: {0}")]
    InvalidBundle(String),

    #[error("Unsupported packet version: {0}")]
    UnsupportedPacketVersion(u8),

    #[error("Crypto error: {0}")]
    Crypto(#[from] plexus_crypto::CryptoError),
}

impl From<alloy_rlp::Error> for CoreError {
    fn from(e: alloy_rlp::Error) -> Self {
        CoreError::Rlp(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
