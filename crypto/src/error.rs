use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Integrity check failed: expected digest {expected}, computed {computed}")]
    IntegrityMismatch { expected: String, computed: String },

    #[error("Invalid digest encoding: {0}")]
    InvalidDigest(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },

    #[error("No session key imported for session {0}")]
    KeyNotFound(Uuid),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
