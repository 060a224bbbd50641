//! Sealed-package cryptography for the ExamSeal engine.
//!
//! Provides the primitives the delivery client needs to open encrypted
//! question packages:
//! - SHA-256 integrity digests with constant-time comparison
//! - AES-256-GCM session keys behind non-exportable handles
//! - Seal helpers for producing packages in tests and provisioning tools
//!
//! Consumers are expected to gate on [`digest::verify_sha256_hex`] before
//! any key touches a buffer.

pub mod digest;
pub mod error;
pub mod keys;
pub mod sealed;

pub use error::{CryptoError, CryptoResult};
pub use keys::{generate_key_material, SessionKeyHandle, SessionKeyring, KEY_LEN, NONCE_LEN};
pub use sealed::{seal, SealedParts};
