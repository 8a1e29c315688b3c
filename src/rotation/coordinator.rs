use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::cipher::KeyCipher;
use crate::config::AdminKeyConfig;
use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};
use crate::fingerprint;
use crate::key_source::{FsKeySource, OutOfBandKeySource};
use crate::keygen::{KeyPair, ModulusBits};
use crate::openssh;
use crate::rotation::credential::AdminCredential;
use crate::rotation::job::GenerationJob;
use crate::secure_memory::SecretString;
use crate::store::{KeyMaterialUpdate, KeyStore, SystemSshKeyRecord, KEY_TYPE_SSH_RSA};
use crate::validator::{KeyValidator, SshKeygenValidator};
use crate::verify::{KeyConsistencyVerifier, VerificationOutcome};

/// Lifecycle state of a named key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Absent,
    Active,
    Generating,
    RotatingSecret,
    /// The stored pair failed verification. Only `regenerate` leaves this state.
    Inconsistent,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeyState::Absent => "absent",
            KeyState::Active => "active",
            KeyState::Generating => "generating",
            KeyState::RotatingSecret => "rotating-secret",
            KeyState::Inconsistent => "inconsistent",
        };
        f.write_str(label)
    }
}

/// Where the private key came from during a secret rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    /// The stored key was already encrypted under the new secret
    AlreadyCurrent,
    /// Decrypted with `previous_secrets[index]`
    PreviousSecret { index: usize },
    OutOfBandFile { path: PathBuf },
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoverySource::AlreadyCurrent => write!(f, "already encrypted under the new secret"),
            RecoverySource::PreviousSecret { index } => write!(f, "previous secret #{}", index + 1),
            RecoverySource::OutOfBandFile { path } => write!(f, "key file {}", path.display()),
        }
    }
}

/// Outcome of a successful `rotate_secret`
#[derive(Debug, Clone)]
pub struct RotationResult {
    pub name: String,
    pub source: RecoverySource,
    /// The record as persisted after rotation
    pub record: SystemSshKeyRecord,
    pub verification: VerificationOutcome,
}

/// Marks a name as busy for the lifetime of one operation
struct InFlightGuard {
    in_flight: Arc<Mutex<HashMap<String, KeyState>>>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// Owns the lifecycle of one admin key.
///
/// Every mutation prepares all key material first and then performs a
/// single store write guarded by `updated_at`. A failure before that write
/// leaves the store untouched.
pub struct KeyRotationCoordinator {
    config: AdminKeyConfig,
    secret: RwLock<SecretString>,
    store: Arc<dyn KeyStore>,
    validator: Option<Arc<dyn KeyValidator>>,
    key_source: Arc<dyn OutOfBandKeySource>,
    verifier: KeyConsistencyVerifier,
    in_flight: Arc<Mutex<HashMap<String, KeyState>>>,
    inconsistent: Mutex<HashSet<String>>,
}

impl fmt::Debug for KeyRotationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotationCoordinator")
            .field("name", &self.config.name)
            .field("validator", &self.validator.as_ref().map(|v| v.name().to_string()))
            .finish()
    }
}

impl KeyRotationCoordinator {
    /// Coordinator for `config.name` with the validator described by the
    /// config and the local filesystem as out-of-band source
    pub fn new(config: AdminKeyConfig, store: Arc<dyn KeyStore>) -> Self {
        let validator: Option<Arc<dyn KeyValidator>> = if config.validator.enabled {
            Some(Arc::new(SshKeygenValidator::new(&config.validator.program)))
        } else {
            None
        };

        Self {
            secret: RwLock::new(config.encryption_secret.clone()),
            verifier: KeyConsistencyVerifier::new(&config.comment),
            config,
            store,
            validator,
            key_source: Arc::new(FsKeySource),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            inconsistent: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_validator(mut self, validator: Option<Arc<dyn KeyValidator>>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_key_source(mut self, key_source: Arc<dyn OutOfBandKeySource>) -> Self {
        self.key_source = key_source;
        self
    }

    pub fn config(&self) -> &AdminKeyConfig {
        &self.config
    }

    /// Name of the managed key
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Replace the managed key with a freshly generated one.
    ///
    /// Creates the record if none is active. Also the only way out of
    /// `Inconsistent`; machines provisioned with the old key lose access.
    pub fn regenerate(&self, bits: ModulusBits, comment: &str) -> KeyCustodyResult<SystemSshKeyRecord> {
        let guard = self.begin(KeyState::Generating)?;
        self.regenerate_guarded(bits, comment, guard)
    }

    /// `regenerate` on a dedicated worker thread
    pub fn spawn_regenerate(
        self: &Arc<Self>,
        bits: ModulusBits,
        comment: &str,
    ) -> KeyCustodyResult<GenerationJob> {
        let guard = self.begin(KeyState::Generating)?;
        let coordinator = Arc::clone(self);
        let comment = comment.to_string();

        GenerationJob::spawn(self.name(), move || {
            coordinator.regenerate_guarded(bits, &comment, guard)
        })
    }

    fn regenerate_guarded(
        &self,
        bits: ModulusBits,
        comment: &str,
        _guard: InFlightGuard,
    ) -> KeyCustodyResult<SystemSshKeyRecord> {
        let name = self.name();
        // Read before generating so a concurrent writer is detected on save
        let existing = self.store.get_active_by_name(name)?;

        let pair = KeyPair::generate(bits)?;
        let public_key = pair.public_key_line(Some(comment));
        self.run_validator(&public_key)?;
        let fingerprint = fingerprint::fingerprint(&public_key)?;

        let cipher = KeyCipher::new(&self.current_secret());
        let encrypted = cipher.encrypt(pair.private_key_pem().as_bytes())?;
        drop(pair);

        let update = KeyMaterialUpdate {
            public_key,
            private_key_encrypted: encrypted.to_string(),
            fingerprint,
        };

        match existing {
            Some(current) => {
                self.store.update_active(name, current.updated_at, update)?;
            }
            None => {
                self.store.create_active(SystemSshKeyRecord::new(name, update))?;
            }
        }

        let (record, outcome) = self.confirm_persisted(&cipher)?;
        outcome.into_result(name)?;
        self.clear_inconsistent();

        log::info!("Regenerated key '{}' ({}, {})", name, bits, record.fingerprint);
        Ok(record)
    }

    /// Re-encrypt the managed key under `new_secret`.
    ///
    /// The plaintext is recovered from, in order: the new secret itself,
    /// each of `old_candidates`, and the configured out-of-band key file.
    /// Recovered material must match the stored public key. When nothing
    /// recovers the key the store is left as it was and the key is marked
    /// `Inconsistent`.
    pub fn rotate_secret(
        &self,
        old_candidates: &[SecretString],
        new_secret: &SecretString,
    ) -> KeyCustodyResult<RotationResult> {
        let _guard = self.begin(KeyState::RotatingSecret)?;
        let name = self.name();

        let record = self
            .store
            .get_active_by_name(name)?
            .ok_or_else(|| KeyCustodyError::KeyNotFound(name.to_string()))?;
        let stored_material = openssh::decode(record.public_key.trim())
            .map(|key| key.key_material())
            .map_err(|e| {
                self.mark_inconsistent();
                e
            })?;

        let new_cipher = KeyCipher::new(new_secret);

        if let Some(pair) = self.try_decrypt(&record, &new_cipher) {
            if pair.public_key(None).key_material() != stored_material {
                self.mark_inconsistent();
                let stored_fingerprint = fingerprint::fingerprint(record.public_key.trim())?;
                return Err(KeyCustodyError::consistency_mismatch(
                    name,
                    &stored_fingerprint,
                    &pair.fingerprint(),
                )
                .with_recorded_fingerprint(&record.fingerprint));
            }

            log::info!("Key '{}' is already encrypted under the new secret", name);
            let verification = self.verifier.verify_with(&record, &new_cipher);
            self.adopt_secret(new_secret);
            return self.finish_rotation(record, RecoverySource::AlreadyCurrent, verification);
        }

        let mut attempted = vec!["new secret".to_string()];
        let mut recovered = None;

        for (index, candidate) in old_candidates.iter().enumerate() {
            let source = RecoverySource::PreviousSecret { index };
            attempted.push(source.to_string());

            match self.try_decrypt(&record, &KeyCipher::new(candidate)) {
                Some(pair) if pair.public_key(None).key_material() == stored_material => {
                    recovered = Some((pair, source));
                    break;
                }
                Some(_) => log::warn!(
                    "{} decrypts '{}' but to a key that does not match the stored public key",
                    source,
                    name
                ),
                None => log::debug!("{} does not decrypt '{}'", source, name),
            }
        }

        if recovered.is_none() {
            if let Some(path) = &self.config.fallback_private_key_path {
                let source = RecoverySource::OutOfBandFile { path: path.clone() };
                attempted.push(source.to_string());
                recovered = self
                    .recover_out_of_band(path, &stored_material)
                    .map(|pair| (pair, source));
            }
        }

        let (pair, source) = match recovered {
            Some(found) => found,
            None => {
                self.mark_inconsistent();
                log::error!(
                    "No recoverable key material for '{}'; regenerate or recover manually",
                    name
                );
                return Err(KeyCustodyError::NoRecoverableKeyMaterial {
                    name: name.to_string(),
                    attempted_sources: attempted,
                    error_code: error_codes::NO_RECOVERABLE_KEY_MATERIAL,
                });
            }
        };

        log::info!("Recovered '{}' via {}", name, source);

        let encrypted = new_cipher.encrypt(pair.private_key_pem().as_bytes())?;
        let update = KeyMaterialUpdate {
            public_key: record.public_key.clone(),
            private_key_encrypted: encrypted.to_string(),
            fingerprint: pair.fingerprint(),
        };
        drop(pair);

        self.store.update_active(name, record.updated_at, update)?;
        // The stored key is now only readable with the new secret
        self.adopt_secret(new_secret);

        let (persisted, verification) = self.confirm_persisted(&new_cipher)?;
        self.finish_rotation(persisted, source, verification)
    }

    fn finish_rotation(
        &self,
        record: SystemSshKeyRecord,
        source: RecoverySource,
        verification: VerificationOutcome,
    ) -> KeyCustodyResult<RotationResult> {
        if !verification.is_match() {
            self.mark_inconsistent();
            verification.clone().into_result(self.name())?;
        }

        self.clear_inconsistent();
        log::info!("Rotated secret for '{}' ({})", self.name(), source);
        Ok(RotationResult {
            name: self.name().to_string(),
            source,
            record,
            verification,
        })
    }

    /// Verify `record` against `secret`
    pub fn verify(&self, record: &SystemSshKeyRecord, secret: &SecretString) -> VerificationOutcome {
        self.verifier.verify(record, secret)
    }

    /// Verify the active record called `name` under the current secret.
    ///
    /// Run before every use of the key. A failure marks the key
    /// `Inconsistent` and blocks use until it is regenerated.
    pub fn check_before_use(&self, name: &str) -> KeyCustodyResult<SystemSshKeyRecord> {
        let record = self
            .store
            .get_active_by_name(name)?
            .ok_or_else(|| KeyCustodyError::KeyNotFound(name.to_string()))?;

        let outcome = self.verifier.verify(&record, &self.current_secret());
        if !outcome.is_match() {
            self.mark_inconsistent_named(name);
            outcome.into_result(name)?;
        }

        self.clear_inconsistent_named(name);
        Ok(record)
    }

    /// Decrypt `record` and return it in the form SSH clients load
    pub fn export(
        &self,
        record: &SystemSshKeyRecord,
        secret: &SecretString,
    ) -> KeyCustodyResult<AdminCredential> {
        let pair = KeyCipher::new(secret).decrypt_key_pair(&record.private_key_encrypted)?;

        Ok(AdminCredential::new(
            &record.name,
            pair.to_pkcs1_pem()?,
            &record.public_key,
            &record.fingerprint,
        ))
    }

    /// The sanctioned way for plaintext key material to leave this crate
    pub fn request_admin_credential(&self, name: &str) -> KeyCustodyResult<AdminCredential> {
        let record = self.check_before_use(name)?;
        self.export(&record, &self.current_secret())
    }

    pub fn state(&self, name: &str) -> KeyCustodyResult<KeyState> {
        if let Some(state) = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(*state);
        }
        if self
            .inconsistent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
        {
            return Ok(KeyState::Inconsistent);
        }

        Ok(match self.store.get_active_by_name(name)? {
            Some(_) => KeyState::Active,
            None => KeyState::Absent,
        })
    }

    /// Active `ssh-rsa` records
    pub fn list_keys(&self) -> KeyCustodyResult<Vec<SystemSshKeyRecord>> {
        self.store.list_by_type(KEY_TYPE_SSH_RSA)
    }

    pub fn deactivate(&self, name: &str) -> KeyCustodyResult<bool> {
        let deactivated = self.store.deactivate(name)?;
        if deactivated {
            self.clear_inconsistent_named(name);
            log::info!("Deactivated key '{}'", name);
        }
        Ok(deactivated)
    }

    fn begin(&self, state: KeyState) -> KeyCustodyResult<InFlightGuard> {
        let name = self.name().to_string();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(busy) = in_flight.get(&name) {
            log::warn!("Key '{}' is busy ({}), refusing to start {}", name, busy, state);
            return Err(KeyCustodyError::concurrent_modification(&name));
        }
        in_flight.insert(name.clone(), state);

        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            name,
        })
    }

    fn run_validator(&self, public_key: &str) -> KeyCustodyResult<()> {
        let validator = match &self.validator {
            Some(validator) => validator,
            None => return Ok(()),
        };

        match validator.validate(public_key) {
            Ok(()) => Ok(()),
            Err(e @ KeyCustodyError::ValidationUnavailable { .. }) => {
                log::warn!("{}; continuing without external validation", e);
                Ok(())
            }
            Err(e) => {
                log::error!("Generated key rejected by {}: {}", validator.name(), e);
                Err(e)
            }
        }
    }

    fn try_decrypt(&self, record: &SystemSshKeyRecord, cipher: &KeyCipher) -> Option<KeyPair> {
        cipher.decrypt_key_pair(&record.private_key_encrypted).ok()
    }

    fn recover_out_of_band(&self, path: &Path, stored_material: &str) -> Option<KeyPair> {
        let bytes = match self.key_source.read_private_key_file(path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                log::warn!("Out-of-band key file {} is not available", path.display());
                return None;
            }
            Err(e) => {
                log::warn!("Cannot read out-of-band key file {}: {}", path.display(), e);
                return None;
            }
        };

        let pair = match KeyPair::from_private_key_bytes(&bytes) {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Out-of-band key file {} is not a private key: {}", path.display(), e);
                return None;
            }
        };

        if pair.public_key(None).key_material() != stored_material {
            log::warn!(
                "Out-of-band key {} ({}) does not match the stored public key",
                path.display(),
                pair.fingerprint()
            );
            return None;
        }
        Some(pair)
    }

    /// Re-read the active record and verify it
    fn confirm_persisted(
        &self,
        cipher: &KeyCipher,
    ) -> KeyCustodyResult<(SystemSshKeyRecord, VerificationOutcome)> {
        let name = self.name();
        let record = self
            .store
            .get_active_by_name(name)?
            .ok_or_else(|| KeyCustodyError::KeyNotFound(name.to_string()))?;
        let outcome = self.verifier.verify_with(&record, cipher);
        if !outcome.is_match() {
            self.mark_inconsistent();
        }
        Ok((record, outcome))
    }

    fn current_secret(&self) -> SecretString {
        self.secret
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn adopt_secret(&self, secret: &SecretString) {
        *self.secret.write().unwrap_or_else(PoisonError::into_inner) = secret.clone();
    }

    fn mark_inconsistent(&self) {
        self.mark_inconsistent_named(self.name());
    }

    fn mark_inconsistent_named(&self, name: &str) {
        self.inconsistent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    fn clear_inconsistent(&self) {
        self.clear_inconsistent_named(self.name());
    }

    fn clear_inconsistent_named(&self, name: &str) {
        self.inconsistent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}
