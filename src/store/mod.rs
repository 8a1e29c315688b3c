//! Persistence of system SSH key records.
//!
//! At most one active record exists per name. Replacing key material is a
//! compare-and-swap on `updated_at`: a writer that read a stale record gets
//! `ConcurrentModification` instead of overwriting someone else's update.

mod json_file;
mod memory;

pub use json_file::{JsonFileKeyStore, DEFAULT_LOCK_TIMEOUT};
pub use memory::MemoryKeyStore;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};

/// Key type tag of every record this crate produces
pub const KEY_TYPE_SSH_RSA: &str = "ssh-rsa";

/// A persisted system key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSshKeyRecord {
    pub id: Uuid,
    pub name: String,
    pub key_type: String,
    /// `ssh-rsa <base64> <comment>`
    pub public_key: String,
    /// `ivhex:ciphertexthex`, see [`crate::cipher::EncryptedPrivateKeyRecord`]
    pub private_key_encrypted: String,
    pub fingerprint: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SystemSshKeyRecord {
    /// A fresh active `ssh-rsa` record
    pub fn new(name: &str, material: KeyMaterialUpdate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            key_type: KEY_TYPE_SSH_RSA.to_string(),
            public_key: material.public_key,
            private_key_encrypted: material.private_key_encrypted,
            fingerprint: material.fingerprint,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the key material in place, keeping identity and creation time
    pub(crate) fn apply(&mut self, material: KeyMaterialUpdate) {
        self.public_key = material.public_key;
        self.private_key_encrypted = material.private_key_encrypted;
        self.fingerprint = material.fingerprint;
        self.updated_at = next_updated_at(self.updated_at);
    }
}

/// The three fields that always change together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterialUpdate {
    pub public_key: String,
    pub private_key_encrypted: String,
    pub fingerprint: String,
}

/// Storage backend for key records
pub trait KeyStore: Send + Sync {
    /// The active record called `name`, if any
    fn get_active_by_name(&self, name: &str) -> KeyCustodyResult<Option<SystemSshKeyRecord>>;

    /// Insert `record` as the active record for its name.
    ///
    /// Fails with `ConcurrentModification` if an active record already exists.
    fn create_active(&self, record: SystemSshKeyRecord) -> KeyCustodyResult<SystemSshKeyRecord>;

    /// Replace the key material of the active record called `name`.
    ///
    /// Only succeeds while the record's `updated_at` still equals
    /// `expected_updated_at`. All three fields are written or none is.
    fn update_active(
        &self,
        name: &str,
        expected_updated_at: DateTime<Utc>,
        update: KeyMaterialUpdate,
    ) -> KeyCustodyResult<SystemSshKeyRecord>;

    /// Active records of the given key type
    fn list_by_type(&self, key_type: &str) -> KeyCustodyResult<Vec<SystemSshKeyRecord>>;

    /// Mark the active record called `name` inactive. Returns whether one existed.
    fn deactivate(&self, name: &str) -> KeyCustodyResult<bool>;
}

/// `updated_at` for a write following `previous`. Strictly increasing even
/// when the clock has not moved or went backwards.
pub(crate) fn next_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

// Record-list operations shared by the in-memory and file-backed stores.
// Callers hold whatever lock guards `records`.

pub(crate) fn find_active<'a>(
    records: &'a [SystemSshKeyRecord],
    name: &str,
) -> Option<&'a SystemSshKeyRecord> {
    records.iter().find(|r| r.is_active && r.name == name)
}

pub(crate) fn insert_active(
    records: &mut Vec<SystemSshKeyRecord>,
    record: SystemSshKeyRecord,
) -> KeyCustodyResult<SystemSshKeyRecord> {
    if !record.is_active {
        return Err(KeyCustodyError::invalid_parameter(
            "record.is_active",
            "true",
            "false",
        ));
    }
    if find_active(records, &record.name).is_some() {
        return Err(KeyCustodyError::concurrent_modification(&record.name));
    }
    records.push(record.clone());
    Ok(record)
}

pub(crate) fn compare_and_swap(
    records: &mut [SystemSshKeyRecord],
    name: &str,
    expected_updated_at: DateTime<Utc>,
    update: KeyMaterialUpdate,
) -> KeyCustodyResult<SystemSshKeyRecord> {
    let record = records
        .iter_mut()
        .find(|r| r.is_active && r.name == name)
        .ok_or_else(|| KeyCustodyError::KeyNotFound(name.to_string()))?;

    if record.updated_at != expected_updated_at {
        log::warn!(
            "Rejected stale write to '{}': expected updated_at {}, found {}",
            name,
            expected_updated_at,
            record.updated_at
        );
        return Err(KeyCustodyError::concurrent_modification(name));
    }

    record.apply(update);
    Ok(record.clone())
}

pub(crate) fn mark_inactive(records: &mut [SystemSshKeyRecord], name: &str) -> bool {
    match records.iter_mut().find(|r| r.is_active && r.name == name) {
        Some(record) => {
            record.is_active = false;
            record.updated_at = next_updated_at(record.updated_at);
            true
        }
        None => false,
    }
}

pub(crate) fn active_of_type(records: &[SystemSshKeyRecord], key_type: &str) -> Vec<SystemSshKeyRecord> {
    records
        .iter()
        .filter(|r| r.is_active && r.key_type == key_type)
        .cloned()
        .collect()
}

pub(crate) fn poisoned(operation: &str) -> KeyCustodyError {
    KeyCustodyError::store_error(
        operation,
        "store lock poisoned by a panicked writer",
        error_codes::STORE_WRITE_FAILED,
        None,
    )
}
