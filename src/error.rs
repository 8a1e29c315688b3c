/*!
 * Error Handling for the Keywarden Custody Engine
 *
 * Provides the error taxonomy for key generation, wire encoding, at-rest
 * encryption, consistency checks and rotation, with error codes,
 * user-friendly messages and suggested remediation strategies.
 */

use std::collections::HashMap;
use thiserror::Error;

/// Error type for all key custody operations
#[derive(Debug, Error)]
pub enum KeyCustodyError {
    #[error("Key generation failed: {operation} - {cause}")]
    GenerationError {
        operation: String,
        cause: String,
        error_code: u32,
    },

    #[error("Malformed input: {context} - {cause}")]
    FormatError {
        context: String,
        cause: String,
        error_code: u32,
    },

    #[error("Decryption failed: {cause}")]
    DecryptionError { cause: String, error_code: u32 },

    #[error(
        "Key pair mismatch for '{name}': stored fingerprint {stored_fingerprint}, derived fingerprint {derived_fingerprint}{}",
        recorded_suffix(.recorded_fingerprint)
    )]
    ConsistencyMismatch {
        name: String,
        stored_fingerprint: String,
        /// Persisted fingerprint column, kept only when it disagrees with `stored_fingerprint`
        recorded_fingerprint: Option<String>,
        derived_fingerprint: String,
        error_code: u32,
    },

    #[error("Key validation unavailable: {tool} - {cause}")]
    ValidationUnavailable { tool: String, cause: String },

    #[error("Key validation rejected the public key: {tool} - {details}")]
    ValidationFailed {
        tool: String,
        details: String,
        error_code: u32,
    },

    #[error("No recoverable key material for '{name}' (tried: {})", .attempted_sources.join(", "))]
    NoRecoverableKeyMaterial {
        name: String,
        attempted_sources: Vec<String>,
        error_code: u32,
    },

    #[error("Key store error: {operation} - {cause}")]
    KeyStoreError {
        operation: String,
        cause: String,
        error_code: u32,
        context: HashMap<String, String>,
    },

    #[error("Concurrent modification of key record '{name}'")]
    ConcurrentModification { name: String, error_code: u32 },

    #[error("No active key record named '{0}'")]
    KeyNotFound(String),

    #[error("Invalid parameter: {parameter} - expected {expected} - got {actual}")]
    InvalidParameter {
        parameter: String,
        expected: String,
        actual: String,
        error_code: u32,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Error code constants for different error categories
pub mod error_codes {
    // Generation errors: 1000-1999
    pub const RSA_GENERATION_FAILED: u32 = 1001;
    pub const PRIVATE_KEY_ENCODING_FAILED: u32 = 1002;
    pub const UNSUPPORTED_MODULUS_SIZE: u32 = 1003;

    // Format errors: 2000-2999
    pub const MALFORMED_PUBLIC_KEY_LINE: u32 = 2001;
    pub const UNSUPPORTED_KEY_ALGORITHM: u32 = 2002;
    pub const TRUNCATED_WIRE_BLOB: u32 = 2003;
    pub const MALFORMED_ENCRYPTED_RECORD: u32 = 2004;
    pub const MALFORMED_PRIVATE_KEY: u32 = 2005;

    // Cipher errors: 3000-3999
    pub const CBC_ENCRYPTION_FAILED: u32 = 3001;
    pub const CBC_DECRYPTION_FAILED: u32 = 3002;
    pub const CBC_INVALID_PADDING: u32 = 3003;
    pub const IV_GENERATION_FAILED: u32 = 3004;
    pub const PLAINTEXT_NOT_A_PRIVATE_KEY: u32 = 3005;

    // Custody errors: 4000-4999
    pub const CONSISTENCY_MISMATCH: u32 = 4001;
    pub const NO_RECOVERABLE_KEY_MATERIAL: u32 = 4002;

    // Store errors: 5000-5999
    pub const STORE_READ_FAILED: u32 = 5001;
    pub const STORE_WRITE_FAILED: u32 = 5002;
    pub const STORE_CONFLICT: u32 = 5003;
    pub const STORE_LOCKED: u32 = 5004;

    // Validation errors: 6000-6999
    pub const VALIDATION_REJECTED: u32 = 6001;

    // Config and IO errors: 9000-9999
    pub const INVALID_PARAMETER: u32 = 9000;
    pub const CONFIG_INVALID: u32 = 9001;
    pub const SERIALIZATION_FAILED: u32 = 9002;
    pub const IO_FAILED: u32 = 9003;
    pub const KEY_NOT_FOUND: u32 = 9004;
    pub const VALIDATION_UNAVAILABLE: u32 = 9005;
}

impl KeyCustodyError {
    /// Get the numeric error code for this error
    pub fn error_code(&self) -> u32 {
        match self {
            KeyCustodyError::GenerationError { error_code, .. } => *error_code,
            KeyCustodyError::FormatError { error_code, .. } => *error_code,
            KeyCustodyError::DecryptionError { error_code, .. } => *error_code,
            KeyCustodyError::ConsistencyMismatch { error_code, .. } => *error_code,
            KeyCustodyError::ValidationUnavailable { .. } => error_codes::VALIDATION_UNAVAILABLE,
            KeyCustodyError::ValidationFailed { error_code, .. } => *error_code,
            KeyCustodyError::NoRecoverableKeyMaterial { error_code, .. } => *error_code,
            KeyCustodyError::KeyStoreError { error_code, .. } => *error_code,
            KeyCustodyError::ConcurrentModification { error_code, .. } => *error_code,
            KeyCustodyError::KeyNotFound(_) => error_codes::KEY_NOT_FOUND,
            KeyCustodyError::InvalidParameter { error_code, .. } => *error_code,
            KeyCustodyError::ConfigError(_) => error_codes::CONFIG_INVALID,
            KeyCustodyError::SerializationError(_) => error_codes::SERIALIZATION_FAILED,
            KeyCustodyError::IoError(_) => error_codes::IO_FAILED,
        }
    }

    /// Get the error category/type as a string
    pub fn error_type(&self) -> &'static str {
        match self {
            KeyCustodyError::GenerationError { .. } => "GenerationError",
            KeyCustodyError::FormatError { .. } => "FormatError",
            KeyCustodyError::DecryptionError { .. } => "DecryptionError",
            KeyCustodyError::ConsistencyMismatch { .. } => "ConsistencyMismatch",
            KeyCustodyError::ValidationUnavailable { .. } => "ValidationUnavailable",
            KeyCustodyError::ValidationFailed { .. } => "ValidationFailed",
            KeyCustodyError::NoRecoverableKeyMaterial { .. } => "NoRecoverableKeyMaterial",
            KeyCustodyError::KeyStoreError { .. } => "KeyStoreError",
            KeyCustodyError::ConcurrentModification { .. } => "ConcurrentModification",
            KeyCustodyError::KeyNotFound(_) => "KeyNotFound",
            KeyCustodyError::InvalidParameter { .. } => "InvalidParameter",
            KeyCustodyError::ConfigError(_) => "ConfigError",
            KeyCustodyError::SerializationError(_) => "SerializationError",
            KeyCustodyError::IoError(_) => "IoError",
        }
    }

    /// Whether the failure can be resolved without an operator decision
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KeyCustodyError::DecryptionError { .. }
                | KeyCustodyError::ConcurrentModification { .. }
                | KeyCustodyError::ValidationUnavailable { .. }
        )
    }

    /// Get a user-friendly error message
    pub fn user_friendly_message(&self) -> String {
        match self {
            KeyCustodyError::GenerationError { operation, .. } => {
                format!("Generating the admin key failed during '{}'. No key was stored.", operation)
            }
            KeyCustodyError::FormatError { context, .. } => {
                format!("The {} is malformed and was rejected.", context)
            }
            KeyCustodyError::DecryptionError { .. } => {
                "The stored private key could not be decrypted with the configured secret.".to_string()
            }
            KeyCustodyError::ConsistencyMismatch {
                name,
                stored_fingerprint,
                recorded_fingerprint,
                derived_fingerprint,
                ..
            } => format!(
                "Admin key '{}' is inconsistent: stored {} vs derived {}{}. It must not be used for new sessions.",
                name,
                stored_fingerprint,
                derived_fingerprint,
                recorded_suffix(recorded_fingerprint)
            ),
            KeyCustodyError::ValidationUnavailable { tool, .. } => {
                format!("External key validation with '{}' was skipped because the tool is unavailable.", tool)
            }
            KeyCustodyError::ValidationFailed { tool, .. } => {
                format!("'{}' rejected the generated public key. Nothing was stored.", tool)
            }
            KeyCustodyError::NoRecoverableKeyMaterial { name, .. } => format!(
                "The private key for '{}' could not be recovered with any known secret or key file.",
                name
            ),
            KeyCustodyError::KeyStoreError { operation, .. } => {
                format!("Key store operation '{}' failed.", operation)
            }
            KeyCustodyError::ConcurrentModification { name, .. } => {
                format!("Key '{}' was modified by another operation. Retry the request.", name)
            }
            KeyCustodyError::KeyNotFound(name) => {
                format!("No active admin key named '{}' exists.", name)
            }
            KeyCustodyError::InvalidParameter {
                parameter, expected, ..
            } => format!("Invalid parameter '{}'. Expected {}.", parameter, expected),
            KeyCustodyError::ConfigError(_) => {
                "The keywarden configuration is invalid.".to_string()
            }
            KeyCustodyError::SerializationError(_) => {
                "Data serialization failed. Data format may be corrupted.".to_string()
            }
            KeyCustodyError::IoError(_) => {
                "Input/output operation failed. Check file permissions and disk space.".to_string()
            }
        }
    }

    /// Get technical details for debugging
    pub fn technical_details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();

        details.insert("error_code".to_string(), self.error_code().to_string());
        details.insert("error_type".to_string(), self.error_type().to_string());
        details.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());

        match self {
            KeyCustodyError::GenerationError {
                operation, cause, ..
            } => {
                details.insert("operation".to_string(), operation.clone());
                details.insert("cause".to_string(), cause.clone());
            }
            KeyCustodyError::FormatError { context, cause, .. } => {
                details.insert("context".to_string(), context.clone());
                details.insert("cause".to_string(), cause.clone());
            }
            KeyCustodyError::ConsistencyMismatch {
                name,
                stored_fingerprint,
                recorded_fingerprint,
                derived_fingerprint,
                ..
            } => {
                details.insert("name".to_string(), name.clone());
                details.insert("stored_fingerprint".to_string(), stored_fingerprint.clone());
                if let Some(recorded) = recorded_fingerprint {
                    details.insert("recorded_fingerprint".to_string(), recorded.clone());
                }
                details.insert("derived_fingerprint".to_string(), derived_fingerprint.clone());
            }
            KeyCustodyError::NoRecoverableKeyMaterial {
                name,
                attempted_sources,
                ..
            } => {
                details.insert("name".to_string(), name.clone());
                details.insert("attempted_sources".to_string(), attempted_sources.join(","));
            }
            KeyCustodyError::KeyStoreError {
                operation,
                cause,
                context,
                ..
            } => {
                details.insert("operation".to_string(), operation.clone());
                details.insert("cause".to_string(), cause.clone());
                details.extend(context.clone());
            }
            KeyCustodyError::InvalidParameter {
                parameter,
                expected,
                actual,
                ..
            } => {
                details.insert("parameter".to_string(), parameter.clone());
                details.insert("expected".to_string(), expected.clone());
                details.insert("actual".to_string(), actual.clone());
            }
            _ => {
                details.insert("details".to_string(), self.to_string());
            }
        }

        details
    }

    /// Get suggested remediation steps
    pub fn suggested_remediation(&self) -> Option<String> {
        match self {
            KeyCustodyError::GenerationError { .. } => Some(
                "Check system entropy sources and retry generation explicitly.".to_string(),
            ),
            KeyCustodyError::DecryptionError { .. } => Some(
                "Provide the previous encryption secret or the out-of-band key file and run rotate-secret."
                    .to_string(),
            ),
            KeyCustodyError::ConsistencyMismatch { .. } => Some(
                "Regenerate the admin key. Machines provisioned with the old key need manual re-keying."
                    .to_string(),
            ),
            KeyCustodyError::NoRecoverableKeyMaterial { .. } => Some(
                "Decide between regenerating (losing admin access to existing machines) or manual recovery."
                    .to_string(),
            ),
            KeyCustodyError::ValidationUnavailable { .. } => {
                Some("Install OpenSSH client tools to enable key validation.".to_string())
            }
            KeyCustodyError::ConcurrentModification { .. } => {
                Some("Another rotation finished first. Re-read the key and retry.".to_string())
            }
            KeyCustodyError::ConfigError(_) => Some(
                "Check the configuration file and KEYWARDEN_* environment variables.".to_string(),
            ),
            KeyCustodyError::KeyStoreError { error_code, .. }
                if *error_code == error_codes::STORE_LOCKED =>
            {
                Some("Another keywarden process is writing the store. Retry once it finishes.".to_string())
            }
            _ => None,
        }
    }
}

/// Convenience constructors for common error types
impl KeyCustodyError {
    pub fn generation_error(operation: &str, cause: &str, error_code: u32) -> Self {
        KeyCustodyError::GenerationError {
            operation: operation.to_string(),
            cause: cause.to_string(),
            error_code,
        }
    }

    pub fn format_error(context: &str, cause: &str, error_code: u32) -> Self {
        KeyCustodyError::FormatError {
            context: context.to_string(),
            cause: cause.to_string(),
            error_code,
        }
    }

    pub fn decryption_error(cause: &str, error_code: u32) -> Self {
        KeyCustodyError::DecryptionError {
            cause: cause.to_string(),
            error_code,
        }
    }

    pub fn consistency_mismatch(
        name: &str,
        stored_fingerprint: &str,
        derived_fingerprint: &str,
    ) -> Self {
        KeyCustodyError::ConsistencyMismatch {
            name: name.to_string(),
            stored_fingerprint: stored_fingerprint.to_string(),
            recorded_fingerprint: None,
            derived_fingerprint: derived_fingerprint.to_string(),
            error_code: error_codes::CONSISTENCY_MISMATCH,
        }
    }

    /// Attach the persisted fingerprint column to a `ConsistencyMismatch`.
    /// It is only kept when it differs from the stored line's fingerprint.
    pub fn with_recorded_fingerprint(mut self, recorded: &str) -> Self {
        if let KeyCustodyError::ConsistencyMismatch {
            stored_fingerprint,
            recorded_fingerprint,
            ..
        } = &mut self
        {
            let recorded = recorded.trim().to_ascii_lowercase();
            *recorded_fingerprint = (recorded != *stored_fingerprint).then_some(recorded);
        }
        self
    }

    pub fn store_error(operation: &str, cause: &str, error_code: u32, name: Option<&str>) -> Self {
        let mut context = HashMap::new();
        if let Some(name) = name {
            context.insert("name".to_string(), name.to_string());
        }

        KeyCustodyError::KeyStoreError {
            operation: operation.to_string(),
            cause: cause.to_string(),
            error_code,
            context,
        }
    }

    pub fn concurrent_modification(name: &str) -> Self {
        KeyCustodyError::ConcurrentModification {
            name: name.to_string(),
            error_code: error_codes::STORE_CONFLICT,
        }
    }

    pub fn invalid_parameter(parameter: &str, expected: &str, actual: &str) -> Self {
        KeyCustodyError::InvalidParameter {
            parameter: parameter.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            error_code: error_codes::INVALID_PARAMETER,
        }
    }

    pub fn unsupported_modulus_size(bits: u32) -> Self {
        KeyCustodyError::InvalidParameter {
            parameter: "modulus_bits".to_string(),
            expected: "2048, 3072 or 4096".to_string(),
            actual: bits.to_string(),
            error_code: error_codes::UNSUPPORTED_MODULUS_SIZE,
        }
    }
}

fn recorded_suffix(recorded_fingerprint: &Option<String>) -> String {
    match recorded_fingerprint {
        Some(recorded) => format!(" (fingerprint column says {})", recorded),
        None => String::new(),
    }
}

impl From<std::io::Error> for KeyCustodyError {
    fn from(err: std::io::Error) -> Self {
        KeyCustodyError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for KeyCustodyError {
    fn from(err: serde_json::Error) -> Self {
        KeyCustodyError::SerializationError(err.to_string())
    }
}

/// Result type alias for custody operations
pub type KeyCustodyResult<T> = Result<T, KeyCustodyError>;
