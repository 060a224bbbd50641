use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;
/// GCM nonce length in bytes (96-bit, recommended for GCM)
pub const NONCE_LEN: usize = 12;

/// Handle to an imported session key.
///
/// The raw key bytes are consumed at import time to build the cipher and
/// cannot be read back through this handle. Sealing and unsealing are the
/// only operations the key supports.
pub struct SessionKeyHandle {
    session_id: Uuid,
    cipher: Aes256Gcm,
}

impl SessionKeyHandle {
    fn new(session_id: Uuid, material: &[u8]) -> CryptoResult<Self> {
        if material.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: material.len(),
            });
        }

        let cipher = Aes256Gcm::new_from_slice(material).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: material.len(),
            }
        })?;

        Ok(Self { session_id, cipher })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Decrypt and authenticate a sealed buffer.
    ///
    /// A wrong key, wrong nonce, or tampered ciphertext all surface as
    /// [`CryptoError::DecryptionFailed`] (authentication tag mismatch).
    pub fn unseal(&self, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_LEN,
                got: nonce.len(),
            });
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                CryptoError::DecryptionFailed("authentication tag mismatch".to_string())
            })?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Encrypt a buffer under this session key with a fresh random nonce.
    ///
    /// Returns `(nonce, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
        // Random 96-bit nonce per sealing operation
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("cipher failure".to_string()))?;

        Ok((nonce_bytes.to_vec(), ciphertext))
    }
}

/// In-memory keyring holding the session keys imported on this device.
///
/// Keys live only for the lifetime of the process. Ending a session removes
/// its key; there is no export path.
pub struct SessionKeyring {
    keys: RwLock<HashMap<Uuid, Arc<SessionKeyHandle>>>,
}

impl SessionKeyring {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Import key material for a session. Re-importing replaces the handle.
    pub fn import(&self, session_id: Uuid, material: &[u8]) -> CryptoResult<Arc<SessionKeyHandle>> {
        let handle = Arc::new(SessionKeyHandle::new(session_id, material)?);
        self.keys.write().insert(session_id, Arc::clone(&handle));
        tracing::debug!(session_id = %session_id, "session key imported");
        Ok(handle)
    }

    pub fn handle(&self, session_id: Uuid) -> CryptoResult<Arc<SessionKeyHandle>> {
        self.keys
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(CryptoError::KeyNotFound(session_id))
    }

    /// Drop the key for a session, if present.
    pub fn remove(&self, session_id: Uuid) {
        if self.keys.write().remove(&session_id).is_some() {
            tracing::debug!(session_id = %session_id, "session key dropped");
        }
    }

    pub fn clear(&self) {
        self.keys.write().clear();
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl Default for SessionKeyring {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate fresh random key material (provisioning tools and tests).
pub fn generate_key_material() -> Zeroizing<Vec<u8>> {
    let mut key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    Zeroizing::new(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal_roundtrip() {
        let keyring = SessionKeyring::new();
        let session_id = Uuid::new_v4();
        let material = generate_key_material();

        let handle = keyring.import(session_id, &material).unwrap();

        let plaintext = b"question package payload";
        let (nonce, ciphertext) = handle.seal(plaintext).unwrap();
        let decrypted = handle.unseal(&nonce, &ciphertext).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_different_nonces_per_seal() {
        let keyring = SessionKeyring::new();
        let session_id = Uuid::new_v4();
        let handle = keyring.import(session_id, &generate_key_material()).unwrap();

        let (nonce_a, ct_a) = handle.seal(b"same plaintext").unwrap();
        let (nonce_b, ct_b) = handle.seal(b"same plaintext").unwrap();

        assert_ne!(nonce_a, nonce_b);
        assert_ne!(ct_a, ct_b);
    }

    #[test]
    fn test_unseal_with_wrong_key_fails() {
        let keyring = SessionKeyring::new();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let handle_a = keyring.import(session_a, &generate_key_material()).unwrap();
        let handle_b = keyring.import(session_b, &generate_key_material()).unwrap();

        let (nonce, ciphertext) = handle_a.seal(b"for session a only").unwrap();
        let result = handle_b.unseal(&nonce, &ciphertext);

        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn test_unseal_tampered_ciphertext_fails() {
        let keyring = SessionKeyring::new();
        let handle = keyring
            .import(Uuid::new_v4(), &generate_key_material())
            .unwrap();

        let (nonce, mut ciphertext) = handle.seal(b"authenticated data").unwrap();
        ciphertext[0] ^= 0x01;

        let result = handle.unseal(&nonce, &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        let keyring = SessionKeyring::new();
        let result = keyring.import(Uuid::new_v4(), b"too short");

        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { expected: 32, got: 9 })
        ));
    }

    #[test]
    fn test_invalid_nonce_length_rejected() {
        let keyring = SessionKeyring::new();
        let handle = keyring
            .import(Uuid::new_v4(), &generate_key_material())
            .unwrap();

        let result = handle.unseal(b"short", b"ciphertext");
        assert!(matches!(
            result,
            Err(CryptoError::InvalidNonceLength { expected: 12, got: 5 })
        ));
    }

    #[test]
    fn test_handle_for_unknown_session() {
        let keyring = SessionKeyring::new();
        let missing = Uuid::new_v4();

        let result = keyring.handle(missing);
        assert!(matches!(result, Err(CryptoError::KeyNotFound(id)) if id == missing));
    }

    #[test]
    fn test_remove_drops_key() {
        let keyring = SessionKeyring::new();
        let session_id = Uuid::new_v4();
        keyring.import(session_id, &generate_key_material()).unwrap();
        assert_eq!(keyring.len(), 1);

        keyring.remove(session_id);

        assert!(keyring.is_empty());
        assert!(keyring.handle(session_id).is_err());
    }

    #[test]
    fn test_reimport_replaces_handle() {
        let keyring = SessionKeyring::new();
        let session_id = Uuid::new_v4();

        let first = keyring.import(session_id, &generate_key_material()).unwrap();
        let (nonce, ciphertext) = first.seal(b"sealed under first key").unwrap();

        keyring.import(session_id, &generate_key_material()).unwrap();
        let current = keyring.handle(session_id).unwrap();

        // Old ciphertext no longer opens under the replaced key
        assert!(current.unseal(&nonce, &ciphertext).is_err());
        assert_eq!(keyring.len(), 1);
    }

    #[test]
    fn test_generated_material_is_unique() {
        let a = generate_key_material();
        let b = generate_key_material();

        assert_eq!(a.len(), KEY_LEN);
        assert_ne!(a.as_slice(), b.as_slice());
    }
}
