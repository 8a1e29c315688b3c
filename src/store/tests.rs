use super::*;
use tempfile::tempdir;

fn material(tag: &str) -> KeyMaterialUpdate {
    KeyMaterialUpdate {
        public_key: format!("ssh-rsa AAAA{} keywarden-admin", tag),
        private_key_encrypted: format!("000102030405060708090a0b0c0d0e0f:{}", tag),
        fingerprint: format!("fp-{}", tag),
    }
}

/// Runs the same behavioural checks against any store
fn exercise_store(store: &dyn KeyStore) {
    assert!(store.get_active_by_name("default-admin-key").unwrap().is_none());

    let created = store
        .create_active(SystemSshKeyRecord::new("default-admin-key", material("one")))
        .unwrap();
    assert_eq!(created.key_type, KEY_TYPE_SSH_RSA);
    assert!(created.is_active);

    // Only one active record per name
    assert!(matches!(
        store.create_active(SystemSshKeyRecord::new("default-admin-key", material("dup"))),
        Err(KeyCustodyError::ConcurrentModification { .. })
    ));

    let updated = store
        .update_active("default-admin-key", created.updated_at, material("two"))
        .unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.updated_at > created.updated_at);
    assert_eq!(updated.fingerprint, "fp-two");

    // A writer holding the old timestamp loses
    assert!(matches!(
        store.update_active("default-admin-key", created.updated_at, material("stale")),
        Err(KeyCustodyError::ConcurrentModification { .. })
    ));
    let current = store.get_active_by_name("default-admin-key").unwrap().unwrap();
    assert_eq!(current, updated);

    assert!(matches!(
        store.update_active("missing", Utc::now(), material("x")),
        Err(KeyCustodyError::KeyNotFound(_))
    ));

    store
        .create_active(SystemSshKeyRecord::new("backup-admin-key", material("b")))
        .unwrap();
    let mut other_type = SystemSshKeyRecord::new("ed-key", material("e"));
    other_type.key_type = "ssh-ed25519".to_string();
    store.create_active(other_type).unwrap();

    let mut names: Vec<String> = store
        .list_by_type(KEY_TYPE_SSH_RSA)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["backup-admin-key", "default-admin-key"]);

    assert!(store.deactivate("backup-admin-key").unwrap());
    assert!(!store.deactivate("backup-admin-key").unwrap());
    assert!(store.get_active_by_name("backup-admin-key").unwrap().is_none());
    assert_eq!(store.list_by_type(KEY_TYPE_SSH_RSA).unwrap().len(), 1);

    // A deactivated name can be reused
    store
        .create_active(SystemSshKeyRecord::new("backup-admin-key", material("b2")))
        .unwrap();
}

#[test]
fn test_memory_store_behaviour() {
    exercise_store(&MemoryKeyStore::new());
}

#[test]
fn test_json_file_store_behaviour() {
    let dir = tempdir().unwrap();
    exercise_store(&JsonFileKeyStore::new(dir.path().join("keys.json")));
}

#[test]
fn test_memory_store_keeps_inactive_history() {
    let store = MemoryKeyStore::new();
    store
        .create_active(SystemSshKeyRecord::new("k", material("a")))
        .unwrap();
    store.deactivate("k").unwrap();
    store
        .create_active(SystemSshKeyRecord::new("k", material("b")))
        .unwrap();

    let all = store.all_records().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|r| r.is_active).count(), 1);
}

#[test]
fn test_json_file_store_persists_across_instances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("keys.json");

    let created = JsonFileKeyStore::new(&path)
        .create_active(SystemSshKeyRecord::new("default-admin-key", material("one")))
        .unwrap();

    let reopened = JsonFileKeyStore::new(&path);
    let loaded = reopened.get_active_by_name("default-admin-key").unwrap().unwrap();
    assert_eq!(loaded, created);

    // Timestamps survive serialization exactly, so CAS still works after reload
    reopened
        .update_active("default-admin-key", loaded.updated_at, material("two"))
        .unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("\"privateKeyEncrypted\""));
    assert!(raw.contains("\"version\": 1"));
}

#[test]
fn test_json_file_store_rejects_corrupt_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("keys.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = JsonFileKeyStore::new(&path);
    assert!(matches!(
        store.get_active_by_name("default-admin-key"),
        Err(KeyCustodyError::KeyStoreError { .. })
    ));
    // A failed load must not clobber the file
    assert!(store
        .create_active(SystemSshKeyRecord::new("default-admin-key", material("one")))
        .is_err());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
}

#[cfg(unix)]
#[test]
fn test_json_file_store_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let path = dir.path().join("keys.json");
    JsonFileKeyStore::new(&path)
        .create_active(SystemSshKeyRecord::new("default-admin-key", material("one")))
        .unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_next_updated_at_is_strictly_increasing() {
    let future = Utc::now() + Duration::seconds(60);
    let next = next_updated_at(future);
    assert!(next > future);
    assert_eq!(next - future, Duration::microseconds(1));
}

#[test]
fn test_json_file_store_serializes_writers_across_instances() {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let dir = tempdir().unwrap();
    let path = dir.path().join("keys.json");
    let seeded = JsonFileKeyStore::new(&path)
        .create_active(SystemSshKeyRecord::new("default-admin-key", material("one")))
        .unwrap();

    // Separate instances share nothing but the file, like two CLI processes
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = path.clone();
            let barrier = barrier.clone();
            let expected = seeded.updated_at;
            thread::spawn(move || {
                let store = JsonFileKeyStore::new(&path);
                barrier.wait();
                store.update_active("default-admin-key", expected, material(&format!("w{}", i)))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(
                matches!(e, KeyCustodyError::ConcurrentModification { .. }),
                "unexpected error {:?}",
                e
            );
        }
    }

    let current = JsonFileKeyStore::new(&path)
        .get_active_by_name("default-admin-key")
        .unwrap()
        .unwrap();
    assert_eq!(&current, winners[0]);
    assert!(!JsonFileKeyStore::new(&path).lock_path().exists());
}

#[test]
fn test_json_file_store_waits_for_held_lock() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("keys.json");
    let store = JsonFileKeyStore::new(&path).with_lock_timeout(std::time::Duration::from_millis(100));
    let created = store
        .create_active(SystemSshKeyRecord::new("default-admin-key", material("one")))
        .unwrap();
    let before = std::fs::read(&path).unwrap();

    std::fs::write(store.lock_path(), "4242\n").unwrap();
    match store.update_active("default-admin-key", created.updated_at, material("two")) {
        Err(e @ KeyCustodyError::KeyStoreError { .. }) => {
            assert_eq!(e.error_code(), error_codes::STORE_LOCKED);
            assert!(e.suggested_remediation().is_some());
        }
        other => panic!("expected a lock timeout, got {:?}", other),
    }
    assert_eq!(std::fs::read(&path).unwrap(), before);
    // A foreign lock is left for its owner
    assert!(store.lock_path().exists());

    std::fs::remove_file(store.lock_path()).unwrap();
    store
        .update_active("default-admin-key", created.updated_at, material("two"))
        .unwrap();
}

#[test]
fn test_json_file_store_breaks_stale_lock() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("keys.json");
    let store = JsonFileKeyStore::new(&path).with_lock_timeout(std::time::Duration::from_millis(100));

    let lock = std::fs::File::create(store.lock_path()).unwrap();
    lock.set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(600))
        .unwrap();
    drop(lock);

    store
        .create_active(SystemSshKeyRecord::new("default-admin-key", material("one")))
        .unwrap();
    assert!(!store.lock_path().exists());
}
