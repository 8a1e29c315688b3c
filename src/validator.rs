//! External validation of freshly generated public keys.
//!
//! A key that an external tool rejects is never persisted. A tool that
//! cannot be run at all only produces a warning.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;

use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};

/// Default validator program, looked up on `PATH`
pub const DEFAULT_VALIDATOR_PROGRAM: &str = "ssh-keygen";

/// Checks a public key line before it is stored
pub trait KeyValidator: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// `Ok` if the key is acceptable, `ValidationFailed` if it was rejected,
    /// `ValidationUnavailable` if the check could not be carried out
    fn validate(&self, public_key_line: &str) -> KeyCustodyResult<()>;
}

/// Validates keys with `ssh-keygen -l -f <file>`
#[derive(Debug, Clone)]
pub struct SshKeygenValidator {
    program: PathBuf,
}

impl Default for SshKeygenValidator {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATOR_PROGRAM)
    }
}

impl SshKeygenValidator {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    fn unavailable(&self, cause: &str) -> KeyCustodyError {
        KeyCustodyError::ValidationUnavailable {
            tool: self.program.display().to_string(),
            cause: cause.to_string(),
        }
    }
}

impl KeyValidator for SshKeygenValidator {
    fn name(&self) -> &str {
        self.program.to_str().unwrap_or(DEFAULT_VALIDATOR_PROGRAM)
    }

    fn validate(&self, public_key_line: &str) -> KeyCustodyResult<()> {
        let mut file = NamedTempFile::new()
            .map_err(|e| self.unavailable(&format!("cannot create temp file: {}", e)))?;
        writeln!(file, "{}", public_key_line.trim())
            .and_then(|_| file.flush())
            .map_err(|e| self.unavailable(&format!("cannot write temp file: {}", e)))?;

        let output = Command::new(&self.program)
            .arg("-l")
            .arg("-f")
            .arg(file.path())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => self.unavailable("program not found"),
                _ => self.unavailable(&e.to_string()),
            })?;

        if output.status.success() {
            log::debug!(
                "{} accepted key: {}",
                self.name(),
                String::from_utf8_lossy(&output.stdout).trim()
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let details = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        };

        Err(KeyCustodyError::ValidationFailed {
            tool: self.name().to_string(),
            details,
            error_code: error_codes::VALIDATION_REJECTED,
        })
    }
}
