//! Opening and fabricating sealed question packages.
//!
//! The open pipeline runs in a fixed order: ciphertext digest gate, session
//! key import, decrypt, parse. A corrupted download is rejected by the
//! digest gate before any key material is imported or the cipher touched.

use examseal_crypto::{digest, SessionKeyring};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult};
use crate::model::{DecryptedExamPackage, EncryptedExamPackage, Question, QuestionKind};

/// Highest package schema version this build understands
pub const PACKAGE_SCHEMA_VERSION: u32 = 1;

/// Plaintext layout inside the sealed envelope
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackagePayload {
    schema_version: u32,
    session_id: Uuid,
    questions: Vec<Question>,
}

/// Open a sealed package and return the in-memory question set.
///
/// Order of operations:
/// 1. verify the ciphertext digest (constant time)
/// 2. import the session key into the keyring
/// 3. decrypt
/// 4. parse and validate the plaintext
///
/// On any failure after import the session key is removed again, so the
/// keyring only ever holds keys for successfully opened packages.
pub fn open_package(
    package: &EncryptedExamPackage,
    key_material: &[u8],
    keyring: &SessionKeyring,
) -> EngineResult<DecryptedExamPackage> {
    digest::verify_sha256_hex(&package.encrypted_data, &package.package_hash)?;

    let handle = keyring.import(package.session_id, key_material)?;

    let opened = handle
        .unseal(&package.iv, &package.encrypted_data)
        .map_err(EngineError::from)
        .and_then(|plaintext| parse_payload(&plaintext, package));

    match opened {
        Ok(decrypted) => {
            tracing::info!(
                session_id = %package.session_id,
                package_id = %package.package_id,
                question_count = decrypted.questions.len(),
                "Opened sealed package"
            );
            Ok(decrypted)
        }
        Err(e) => {
            keyring.remove(package.session_id);
            Err(e)
        }
    }
}

fn parse_payload(
    plaintext: &[u8],
    package: &EncryptedExamPackage,
) -> EngineResult<DecryptedExamPackage> {
    let payload: PackagePayload = serde_json::from_slice(plaintext)
        .map_err(|e| EngineError::MalformedPackage(format!("invalid payload: {}", e)))?;

    if payload.schema_version > PACKAGE_SCHEMA_VERSION {
        return Err(EngineError::SchemaVersion {
            version: payload.schema_version,
            supported: PACKAGE_SCHEMA_VERSION,
        });
    }

    if payload.session_id != package.session_id {
        return Err(EngineError::MalformedPackage(format!(
            "payload session {} does not match envelope session {}",
            payload.session_id, package.session_id
        )));
    }

    validate_questions(&payload.questions)?;

    Ok(DecryptedExamPackage {
        session_id: package.session_id,
        package_hash: package.package_hash.clone(),
        questions: payload.questions,
    })
}

/// Structural validation of a decrypted question set
fn validate_questions(questions: &[Question]) -> EngineResult<()> {
    if questions.is_empty() {
        return Err(EngineError::MalformedPackage(
            "package contains no questions".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for question in questions {
        if question.id.is_empty() {
            return Err(EngineError::MalformedPackage(
                "question with empty id".to_string(),
            ));
        }
        if !seen.insert(question.id.as_str()) {
            return Err(EngineError::MalformedPackage(format!(
                "duplicate question id: {}",
                question.id
            )));
        }
        match question.kind {
            QuestionKind::SingleChoice | QuestionKind::MultiChoice => {
                if question.options.len() < 2 {
                    return Err(EngineError::MalformedPackage(format!(
                        "choice question {} has fewer than two options",
                        question.id
                    )));
                }
            }
            QuestionKind::Matching | QuestionKind::FreeText => {}
        }
    }

    Ok(())
}

/// Seal a question set into an encrypted package.
///
/// Used by provisioning tooling and tests; the delivery client itself only
/// opens packages.
pub fn seal_package(
    session_id: Uuid,
    questions: Vec<Question>,
    key_material: &[u8],
) -> EngineResult<EncryptedExamPackage> {
    let payload = PackagePayload {
        schema_version: PACKAGE_SCHEMA_VERSION,
        session_id,
        questions,
    };
    let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);

    let keyring = SessionKeyring::new();
    let handle = keyring.import(session_id, key_material)?;
    let parts = examseal_crypto::seal(&plaintext, &handle)?;
    keyring.remove(session_id);

    Ok(EncryptedExamPackage {
        package_id: Uuid::new_v4(),
        session_id,
        encrypted_data: parts.ciphertext,
        iv: parts.nonce,
        package_hash: parts.digest_hex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use examseal_crypto::generate_key_material;

    fn sample_questions() -> Vec<Question> {
        vec![
            Question {
                id: "q1".to_string(),
                kind: QuestionKind::SingleChoice,
                prompt: "Pick one".to_string(),
                options: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            },
            Question {
                id: "q2".to_string(),
                kind: QuestionKind::FreeText,
                prompt: "Explain".to_string(),
                options: vec![],
            },
        ]
    }

    #[test]
    fn test_open_sealed_package_roundtrip() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();
        let package = seal_package(session_id, sample_questions(), &material).unwrap();

        let keyring = SessionKeyring::new();
        let decrypted = open_package(&package, &material, &keyring).unwrap();

        assert_eq!(decrypted.session_id, session_id);
        assert_eq!(decrypted.package_hash, package.package_hash);
        assert_eq!(decrypted.questions, sample_questions());
        // Key stays imported for the opened session
        assert!(keyring.handle(session_id).is_ok());
    }

    #[test]
    fn test_corrupted_ciphertext_stops_before_key_import() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();
        let mut package = seal_package(session_id, sample_questions(), &material).unwrap();
        package.encrypted_data[7] ^= 0x01;

        let keyring = SessionKeyring::new();
        let result = open_package(&package, &material, &keyring);

        assert!(matches!(result, Err(EngineError::Integrity(_))));
        // The digest gate fired before import: no key ever entered the keyring
        assert!(keyring.is_empty());
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();
        let package = seal_package(session_id, sample_questions(), &material).unwrap();

        let keyring = SessionKeyring::new();
        let wrong = generate_key_material();
        let result = open_package(&package, &wrong, &keyring);

        assert!(matches!(result, Err(EngineError::Decryption(_))));
        // Failed open does not leave a key behind
        assert!(keyring.is_empty());
    }

    #[test]
    fn test_mismatched_digest_is_integrity_error() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();
        let mut package = seal_package(session_id, sample_questions(), &material).unwrap();
        // Valid hex, wrong digest
        package.package_hash = examseal_crypto::digest::sha256_hex(b"other bytes");

        let keyring = SessionKeyring::new();
        let result = open_package(&package, &material, &keyring);
        assert!(matches!(result, Err(EngineError::Integrity(_))));
    }

    #[test]
    fn test_garbage_plaintext_is_malformed() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();

        let keyring = SessionKeyring::new();
        let handle = keyring.import(session_id, &material).unwrap();
        let parts = examseal_crypto::seal(b"not json at all", &handle).unwrap();
        keyring.remove(session_id);

        let package = EncryptedExamPackage {
            package_id: Uuid::new_v4(),
            session_id,
            encrypted_data: parts.ciphertext,
            iv: parts.nonce,
            package_hash: parts.digest_hex,
        };

        let result = open_package(&package, &material, &keyring);
        assert!(matches!(result, Err(EngineError::MalformedPackage(_))));
        assert!(keyring.is_empty());
    }

    #[test]
    fn test_newer_schema_version_refused() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();

        let payload = serde_json::json!({
            "schemaVersion": PACKAGE_SCHEMA_VERSION + 1,
            "sessionId": session_id,
            "questions": sample_questions(),
        });
        let keyring = SessionKeyring::new();
        let handle = keyring.import(session_id, &material).unwrap();
        let parts = examseal_crypto::seal(payload.to_string().as_bytes(), &handle).unwrap();
        keyring.remove(session_id);

        let package = EncryptedExamPackage {
            package_id: Uuid::new_v4(),
            session_id,
            encrypted_data: parts.ciphertext,
            iv: parts.nonce,
            package_hash: parts.digest_hex,
        };

        let result = open_package(&package, &material, &keyring);
        assert!(matches!(
            result,
            Err(EngineError::SchemaVersion { version, supported })
                if version == PACKAGE_SCHEMA_VERSION + 1 && supported == PACKAGE_SCHEMA_VERSION
        ));
    }

    #[test]
    fn test_session_mismatch_is_malformed() {
        let inner_session = Uuid::new_v4();
        let envelope_session = Uuid::new_v4();
        let material = generate_key_material();

        let mut package = seal_package(inner_session, sample_questions(), &material).unwrap();
        package.session_id = envelope_session;

        let keyring = SessionKeyring::new();
        // Same key under the envelope session id so decryption succeeds
        let result = open_package(&package, &material, &keyring);
        assert!(matches!(result, Err(EngineError::MalformedPackage(_))));
    }

    #[test]
    fn test_empty_question_set_rejected() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();
        let result = seal_package(session_id, vec![], &material)
            .and_then(|package| open_package(&package, &material, &SessionKeyring::new()));
        assert!(matches!(result, Err(EngineError::MalformedPackage(_))));
    }

    #[test]
    fn test_duplicate_question_ids_rejected() {
        let session_id = Uuid::new_v4();
        let material = generate_key_material();
        let mut questions = sample_questions();
        questions[1].id = "q1".to_string();

        let package = seal_package(session_id, questions, &material).unwrap();
        let result = open_package(&package, &material, &SessionKeyring::new());
        assert!(matches!(result, Err(EngineError::MalformedPackage(_))));
    }

    #[test]
    fn test_choice_question_needs_options() {
        let questions = vec![Question {
            id: "q1".to_string(),
            kind: QuestionKind::MultiChoice,
            prompt: "Pick several".to_string(),
            options: vec!["only one".to_string()],
        }];

        let session_id = Uuid::new_v4();
        let material = generate_key_material();
        let package = seal_package(session_id, questions, &material).unwrap();
        let result = open_package(&package, &material, &SessionKeyring::new());
        assert!(matches!(result, Err(EngineError::MalformedPackage(_))));
    }
}
