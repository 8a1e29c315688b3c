//! Consistency checks between a stored public key and its encrypted
//! private half.
//!
//! A record is only usable when the private key decrypts under the active
//! secret, re-derives the stored public key, and the fingerprints agree.

use std::fmt;

use subtle::ConstantTimeEq;

use crate::cipher::KeyCipher;
use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};
use crate::fingerprint;
use crate::secure_memory::SecretString;
use crate::store::SystemSshKeyRecord;

/// Result of checking one stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The pair is consistent
    Match { fingerprint: String },
    /// The decrypted private key does not belong to the stored public key.
    ///
    /// `stored_fingerprint` is computed from the stored public key line,
    /// `recorded_fingerprint` is the fingerprint column as persisted.
    Mismatch {
        stored_fingerprint: String,
        recorded_fingerprint: String,
        derived_fingerprint: String,
    },
    /// The private key could not be decrypted (or did not decrypt to a key)
    DecryptionFailed { reason: String },
}

impl VerificationOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, VerificationOutcome::Match { .. })
    }

    /// Turn a non-matching outcome into the corresponding error
    pub fn into_result(self, name: &str) -> KeyCustodyResult<String> {
        match self {
            VerificationOutcome::Match { fingerprint } => Ok(fingerprint),
            VerificationOutcome::Mismatch {
                stored_fingerprint,
                recorded_fingerprint,
                derived_fingerprint,
            } => Err(
                KeyCustodyError::consistency_mismatch(name, &stored_fingerprint, &derived_fingerprint)
                    .with_recorded_fingerprint(&recorded_fingerprint),
            ),
            VerificationOutcome::DecryptionFailed { reason } => Err(
                KeyCustodyError::decryption_error(&reason, error_codes::CBC_DECRYPTION_FAILED),
            ),
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationOutcome::Match { fingerprint } => write!(f, "match ({})", fingerprint),
            VerificationOutcome::Mismatch {
                stored_fingerprint,
                recorded_fingerprint,
                derived_fingerprint,
            } => write!(
                f,
                "mismatch (stored {}, recorded {}, derived {})",
                stored_fingerprint, recorded_fingerprint, derived_fingerprint
            ),
            VerificationOutcome::DecryptionFailed { reason } => {
                write!(f, "decryption failed ({})", reason)
            }
        }
    }
}

/// Confirms that a record's encrypted private key and public key are a pair
#[derive(Debug, Clone)]
pub struct KeyConsistencyVerifier {
    comment: String,
}

impl KeyConsistencyVerifier {
    /// `comment` is the convention used at generation time. It is applied
    /// when re-encoding but excluded from every comparison.
    pub fn new(comment: &str) -> Self {
        Self {
            comment: comment.to_string(),
        }
    }

    pub fn verify(&self, record: &SystemSshKeyRecord, secret: &SecretString) -> VerificationOutcome {
        self.verify_with(record, &KeyCipher::new(secret))
    }

    pub fn verify_with(&self, record: &SystemSshKeyRecord, cipher: &KeyCipher) -> VerificationOutcome {
        let pair = match cipher.decrypt_key_pair(&record.private_key_encrypted) {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Key '{}' failed to decrypt: {}", record.name, e);
                return VerificationOutcome::DecryptionFailed {
                    reason: e.to_string(),
                };
            }
        };

        let derived = pair.public_key(Some(&self.comment));
        let derived_material = derived.key_material();
        let derived_fingerprint = fingerprint::fingerprint_blob(&derived.wire_blob());

        let stored_line = record.public_key.trim();
        let stored_material = key_material_of(stored_line);
        let stored_fingerprint = fingerprint::fingerprint(stored_line)
            .unwrap_or_else(|_| record.fingerprint.trim().to_string());
        let recorded_fingerprint = record.fingerprint.trim().to_ascii_lowercase();

        let material_matches: bool = stored_material
            .as_bytes()
            .ct_eq(derived_material.as_bytes())
            .into();
        let fingerprints_match =
            stored_fingerprint == derived_fingerprint && recorded_fingerprint == derived_fingerprint;

        if material_matches && fingerprints_match {
            log::debug!("Key '{}' is consistent ({})", record.name, derived_fingerprint);
            VerificationOutcome::Match {
                fingerprint: derived_fingerprint,
            }
        } else {
            log::warn!(
                "Key '{}' is inconsistent: stored {} / recorded {} vs derived {}",
                record.name,
                stored_fingerprint,
                recorded_fingerprint,
                derived_fingerprint
            );
            VerificationOutcome::Mismatch {
                stored_fingerprint,
                recorded_fingerprint,
                derived_fingerprint,
            }
        }
    }
}

/// `<algorithm> <base64>` of a public key line, dropping the comment
fn key_material_of(line: &str) -> String {
    line.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}
