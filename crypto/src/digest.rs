use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, CryptoResult};

/// SHA-256 digest length in bytes
pub const DIGEST_LEN: usize = 32;

/// Compute the lowercase hex SHA-256 digest of a buffer
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Constant-time equality for byte slices.
///
/// Length is compared up front; the digest lengths handled here are public.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Verify that the SHA-256 digest of `data` matches `expected_hex`.
///
/// The comparison runs in constant time. A digest that is not valid hex or
/// has the wrong length is rejected as [`CryptoError::InvalidDigest`].
pub fn verify_sha256_hex(data: &[u8], expected_hex: &str) -> CryptoResult<()> {
    let expected = hex::decode(expected_hex)
        .map_err(|e| CryptoError::InvalidDigest(e.to_string()))?;

    if expected.len() != DIGEST_LEN {
        return Err(CryptoError::InvalidDigest(format!(
            "expected {} bytes, got {}",
            DIGEST_LEN,
            expected.len()
        )));
    }

    let mut hasher = Sha256::new();
    hasher.update(data);
    let computed = hasher.finalize();

    if ct_eq(&computed, &expected) {
        Ok(())
    } else {
        Err(CryptoError::IntegrityMismatch {
            expected: expected_hex.to_string(),
            computed: format!("{:x}", computed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST test vector: SHA-256("abc")
    const ABC_DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(sha256_hex(b"abc"), ABC_DIGEST);
    }

    #[test]
    fn test_verify_matching_digest() {
        assert!(verify_sha256_hex(b"abc", ABC_DIGEST).is_ok());
    }

    #[test]
    fn test_verify_uppercase_digest() {
        let upper = ABC_DIGEST.to_uppercase();
        assert!(verify_sha256_hex(b"abc", &upper).is_ok());
    }

    #[test]
    fn test_verify_corrupted_data() {
        let result = verify_sha256_hex(b"abd", ABC_DIGEST);
        assert!(matches!(
            result,
            Err(CryptoError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_malformed_digest() {
        let result = verify_sha256_hex(b"abc", "not-hex-at-all");
        assert!(matches!(result, Err(CryptoError::InvalidDigest(_))));
    }

    #[test]
    fn test_verify_truncated_digest() {
        let result = verify_sha256_hex(b"abc", &ABC_DIGEST[..32]);
        assert!(matches!(result, Err(CryptoError::InvalidDigest(_))));
    }

    #[test]
    fn test_ct_eq_length_mismatch() {
        assert!(!ct_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_ct_eq_equal_buffers() {
        assert!(ct_eq(b"same bytes", b"same bytes"));
    }
}
