use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{
    active_of_type, compare_and_swap, find_active, insert_active, mark_inactive, poisoned,
    KeyMaterialUpdate, KeyStore, SystemSshKeyRecord,
};
use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};

const STORE_VERSION: u32 = 1;

/// How long a writer waits for another writer's lock file
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);
/// A lock file this old belongs to a writer that died mid-mutation
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

/// On-disk layout of the store file
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    records: Vec<SystemSshKeyRecord>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            records: Vec::new(),
        }
    }
}

/// Key store backed by a single JSON file.
///
/// Every mutation re-reads the file, applies the change and replaces the
/// file atomically (write to a sibling temp file, then rename). A failed
/// write leaves the previous file intact. The file is created owner-only.
///
/// Mutations hold `<path>.lock`, created exclusively, from load to rename.
/// That serializes writers across processes and store instances, so the
/// `updated_at` compare-and-swap always sees the latest committed record.
/// Reads take no lock.
#[derive(Debug)]
pub struct JsonFileKeyStore {
    path: PathBuf,
    lock_timeout: Duration,
    write_lock: Mutex<()>,
}

impl JsonFileKeyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    fn load(&self) -> KeyCustodyResult<StoreDocument> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreDocument::default()),
            Err(e) => {
                return Err(self.io_failure("load", &e.to_string(), error_codes::STORE_READ_FAILED))
            }
        };

        let document: StoreDocument = serde_json::from_str(&contents).map_err(|e| {
            self.io_failure("load", &format!("corrupt store file: {}", e), error_codes::STORE_READ_FAILED)
        })?;

        if document.version != STORE_VERSION {
            return Err(self.io_failure(
                "load",
                &format!(
                    "unsupported store version {} (expected {})",
                    document.version, STORE_VERSION
                ),
                error_codes::STORE_READ_FAILED,
            ));
        }

        Ok(document)
    }

    fn save(&self, document: &StoreDocument) -> KeyCustodyResult<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .map_err(|e| self.io_failure("save", &e.to_string(), error_codes::STORE_WRITE_FAILED))?;

        let serialized = serde_json::to_string_pretty(document)?;

        let write_failed =
            |e: std::io::Error| self.io_failure("save", &e.to_string(), error_codes::STORE_WRITE_FAILED);

        // NamedTempFile is created with mode 0600 on Unix
        let mut tmp = NamedTempFile::new_in(&parent).map_err(write_failed)?;
        tmp.write_all(serialized.as_bytes()).map_err(write_failed)?;
        tmp.as_file().sync_all().map_err(write_failed)?;
        tmp.persist(&self.path)
            .map_err(|e| write_failed(e.error))?;

        log::debug!(
            "Saved {} key record(s) to {}",
            document.records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load, apply `change`, and save only if `change` succeeded
    fn mutate<T, F>(&self, operation: &str, change: F) -> KeyCustodyResult<T>
    where
        F: FnOnce(&mut Vec<SystemSshKeyRecord>) -> KeyCustodyResult<T>,
    {
        let _guard = self.write_lock.lock().map_err(|_| poisoned(operation))?;
        let _file_lock = self.lock_file(operation)?;
        let mut document = self.load()?;
        let result = change(&mut document.records)?;
        self.save(&document)?;
        Ok(result)
    }

    fn lock_file(&self, operation: &str) -> KeyCustodyResult<StoreFileLock> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| {
            self.io_failure(operation, &e.to_string(), error_codes::STORE_WRITE_FAILED)
        })?;

        StoreFileLock::acquire(self.lock_path(), self.lock_timeout).map_err(|e| {
            let code = if e.kind() == ErrorKind::TimedOut {
                error_codes::STORE_LOCKED
            } else {
                error_codes::STORE_WRITE_FAILED
            };
            self.io_failure(operation, &e.to_string(), code)
        })
    }

    fn io_failure(&self, operation: &str, cause: &str, error_code: u32) -> KeyCustodyError {
        let mut err = KeyCustodyError::store_error(operation, cause, error_code, None);
        if let KeyCustodyError::KeyStoreError { context, .. } = &mut err {
            context.insert("path".to_string(), self.path.display().to_string());
        }
        err
    }
}

/// Exclusive lock file, removed on drop
#[derive(Debug)]
struct StoreFileLock {
    path: PathBuf,
}

impl StoreFileLock {
    fn acquire(path: PathBuf, timeout: Duration) -> io::Result<Self> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Holder pid, for operators inspecting a leftover lock
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(&path).map_or(false, |age| age > STALE_LOCK_AGE) {
                        log::warn!("Removing stale store lock {}", path.display());
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    if started.elapsed() >= timeout {
                        return Err(io::Error::new(
                            ErrorKind::TimedOut,
                            format!(
                                "{} is held by another writer (waited {:?})",
                                path.display(),
                                timeout
                            ),
                        ));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for StoreFileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to release store lock {}: {}", self.path.display(), e);
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

impl KeyStore for JsonFileKeyStore {
    fn get_active_by_name(&self, name: &str) -> KeyCustodyResult<Option<SystemSshKeyRecord>> {
        let document = self.load()?;
        Ok(find_active(&document.records, name).cloned())
    }

    fn create_active(&self, record: SystemSshKeyRecord) -> KeyCustodyResult<SystemSshKeyRecord> {
        self.mutate("create_active", |records| insert_active(records, record))
    }

    fn update_active(
        &self,
        name: &str,
        expected_updated_at: DateTime<Utc>,
        update: KeyMaterialUpdate,
    ) -> KeyCustodyResult<SystemSshKeyRecord> {
        self.mutate("update_active", |records| {
            compare_and_swap(records, name, expected_updated_at, update)
        })
    }

    fn list_by_type(&self, key_type: &str) -> KeyCustodyResult<Vec<SystemSshKeyRecord>> {
        let document = self.load()?;
        Ok(active_of_type(&document.records, key_type))
    }

    fn deactivate(&self, name: &str) -> KeyCustodyResult<bool> {
        self.mutate("deactivate", |records| Ok(mark_inactive(records, name)))
    }
}
