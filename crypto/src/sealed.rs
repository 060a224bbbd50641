use crate::digest;
use crate::error::CryptoResult;
use crate::keys::SessionKeyHandle;

/// Output of sealing a plaintext package.
///
/// The digest is the hex SHA-256 of the ciphertext, so transport corruption
/// is detectable without invoking the cipher.
#[derive(Debug, Clone)]
pub struct SealedParts {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub digest_hex: String,
}

/// Seal a plaintext package under a session key.
pub fn seal(plaintext: &[u8], key: &SessionKeyHandle) -> CryptoResult<SealedParts> {
    let (nonce, ciphertext) = key.seal(plaintext)?;
    let digest_hex = digest::sha256_hex(&ciphertext);

    Ok(SealedParts {
        ciphertext,
        nonce,
        digest_hex,
    })
}
