use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{
    active_of_type, compare_and_swap, find_active, insert_active, mark_inactive, poisoned,
    KeyMaterialUpdate, KeyStore, SystemSshKeyRecord,
};
use crate::error::KeyCustodyResult;

/// Process-local store, used by tests and embedders with their own persistence
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    records: Mutex<Vec<SystemSshKeyRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, inactive ones included
    pub fn all_records(&self) -> KeyCustodyResult<Vec<SystemSshKeyRecord>> {
        Ok(self.lock("all_records")?.clone())
    }

    fn lock(&self, operation: &str) -> KeyCustodyResult<MutexGuard<'_, Vec<SystemSshKeyRecord>>> {
        self.records.lock().map_err(|_| poisoned(operation))
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_active_by_name(&self, name: &str) -> KeyCustodyResult<Option<SystemSshKeyRecord>> {
        let records = self.lock("get_active_by_name")?;
        Ok(find_active(&records, name).cloned())
    }

    fn create_active(&self, record: SystemSshKeyRecord) -> KeyCustodyResult<SystemSshKeyRecord> {
        let mut records = self.lock("create_active")?;
        insert_active(&mut records, record)
    }

    fn update_active(
        &self,
        name: &str,
        expected_updated_at: DateTime<Utc>,
        update: KeyMaterialUpdate,
    ) -> KeyCustodyResult<SystemSshKeyRecord> {
        let mut records = self.lock("update_active")?;
        compare_and_swap(&mut records, name, expected_updated_at, update)
    }

    fn list_by_type(&self, key_type: &str) -> KeyCustodyResult<Vec<SystemSshKeyRecord>> {
        let records = self.lock("list_by_type")?;
        Ok(active_of_type(&records, key_type))
    }

    fn deactivate(&self, name: &str) -> KeyCustodyResult<bool> {
        let mut records = self.lock("deactivate")?;
        Ok(mark_inactive(&mut records, name))
    }
}
