/*!
 * Keywarden Admin Key Custody
 *
 * Generates and holds the RSA key a control plane uses to administer SSH
 * hosts. The private half is kept encrypted at rest and only leaves through
 * an explicit credential request after a consistency check.
 *
 * The building blocks are:
 *
 * - RSA key generation with a single canonical private key encoding (PKCS#8)
 * - OpenSSH `ssh-rsa` public key encoding and MD5 fingerprints
 * - AES-256-CBC encryption of private keys under an operator secret
 * - Verification that a stored public key and encrypted private key belong together
 * - A coordinator for regeneration and secret rotation with compare-and-swap writes
 */

/// Error taxonomy shared by every module
pub mod error;

/// Zeroizing containers for secrets and decrypted key material
pub mod secure_memory;

/// OpenSSH public key wire format
pub mod openssh;

/// MD5 fingerprints of public keys
pub mod fingerprint;

/// At-rest encryption of private keys
pub mod cipher;

/// RSA keypair generation
pub mod keygen;

/// Stored pair consistency checks
pub mod verify;

/// Key record persistence
pub mod store;

/// Out-of-band private key sources used during recovery
pub mod key_source;

/// External validation of generated public keys
pub mod validator;

/// Configuration loading
pub mod config;

/// Key lifecycle orchestration
pub mod rotation;

pub use cipher::{EncryptedPrivateKeyRecord, KeyCipher};
pub use config::AdminKeyConfig;
pub use error::{KeyCustodyError, KeyCustodyResult};
pub use keygen::{KeyPair, ModulusBits};
pub use openssh::OpenSshPublicKey;
pub use rotation::{
    AdminCredential, GenerationJob, JobStatus, KeyRotationCoordinator, KeyState, RecoverySource,
    RotationResult,
};
pub use secure_memory::{SecretString, SecureBytes};
pub use store::{JsonFileKeyStore, KeyMaterialUpdate, KeyStore, MemoryKeyStore, SystemSshKeyRecord};
pub use verify::{KeyConsistencyVerifier, VerificationOutcome};

/// The types most callers need.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use keywarden::prelude::*;
///
/// fn main() -> Result<(), KeyCustodyError> {
///     let config = AdminKeyConfig::load()?;
///     config.validate()?;
///
///     let store = Arc::new(JsonFileKeyStore::new(&config.store_path));
///     let coordinator = KeyRotationCoordinator::new(config, store);
///
///     let credential = coordinator.request_admin_credential("default-admin-key")?;
///     println!("{}", credential.public_key_line());
///     Ok(())
/// }
/// ```
pub mod prelude {
    pub use crate::cipher::{decrypt, encrypt, EncryptedPrivateKeyRecord, KeyCipher};
    pub use crate::config::AdminKeyConfig;
    pub use crate::error::{KeyCustodyError, KeyCustodyResult};
    pub use crate::fingerprint::fingerprint;
    pub use crate::key_source::{FsKeySource, OutOfBandKeySource};
    pub use crate::keygen::{KeyPair, ModulusBits};
    pub use crate::openssh::{decode, encode, OpenSshPublicKey};
    pub use crate::rotation::{
        AdminCredential, GenerationJob, JobStatus, KeyRotationCoordinator, KeyState,
        RecoverySource, RotationResult,
    };
    pub use crate::secure_memory::{SecretString, SecureBytes};
    pub use crate::store::{
        JsonFileKeyStore, KeyMaterialUpdate, KeyStore, MemoryKeyStore, SystemSshKeyRecord,
    };
    pub use crate::validator::{KeyValidator, SshKeygenValidator};
    pub use crate::verify::{KeyConsistencyVerifier, VerificationOutcome};
}
