//! Error types for the exam delivery engine

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity error: {0}")]
    Integrity(examseal_crypto::CryptoError),

    #[error("Decryption error: {0}")]
    Decryption(examseal_crypto::CryptoError),

    #[error("Key not found: {0}")]
    KeyNotFound(examseal_crypto::CryptoError),

    #[error("Malformed package: {0}")]
    MalformedPackage(String),

    #[error("Unsupported schema version {version}, this build supports up to {supported}")]
    SchemaVersion { version: u32, supported: u32 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Idempotency conflict for item {idempotency_key}: {reason}")]
    IdempotencyConflict {
        idempotency_key: Uuid,
        reason: String,
    },

    #[error("Attempt lifecycle violation: {0}")]
    AttemptLifecycle(String),

    #[error("Invalid timer transition: {0}")]
    TimerTransition(String),

    #[error("Answer value does not match the question kind: {0}")]
    AnswerKind(String),

    #[error("Media upload failed: {0}")]
    MediaUpload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<examseal_crypto::CryptoError> for EngineError {
    fn from(err: examseal_crypto::CryptoError) -> Self {
        use examseal_crypto::CryptoError;
        match err {
            CryptoError::IntegrityMismatch { .. } | CryptoError::InvalidDigest(_) => {
                EngineError::Integrity(err)
            }
            CryptoError::KeyNotFound(_) => EngineError::KeyNotFound(err),
            _ => EngineError::Decryption(err),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Network(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use examseal_crypto::CryptoError;

    #[test]
    fn test_integrity_errors_map_to_integrity() {
        let err: EngineError = CryptoError::IntegrityMismatch {
            expected: "aa".to_string(),
            computed: "bb".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::Integrity(_)));

        let err: EngineError = CryptoError::InvalidDigest("bad hex".to_string()).into();
        assert!(matches!(err, EngineError::Integrity(_)));
    }

    #[test]
    fn test_key_not_found_maps_to_key_not_found() {
        let err: EngineError = CryptoError::KeyNotFound(Uuid::new_v4()).into();
        assert!(matches!(err, EngineError::KeyNotFound(_)));
    }

    #[test]
    fn test_cipher_errors_map_to_decryption() {
        let err: EngineError =
            CryptoError::DecryptionFailed("authentication tag mismatch".to_string()).into();
        assert!(matches!(err, EngineError::Decryption(_)));

        let err: EngineError = CryptoError::InvalidKeyLength {
            expected: 32,
            got: 16,
        }
        .into();
        assert!(matches!(err, EngineError::Decryption(_)));
    }
}
