use std::fmt;
use std::str::FromStr;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};
use crate::keygen::KeyPair;
use crate::secure_memory::{SecretString, SecureBytes};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the derived AES-256 key
pub const KEY_LEN: usize = 32;
/// Length of the random CBC initialization vector
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Derive the 32-byte AES key for `secret`.
///
/// SHA-256 over the UTF-8 bytes of the secret. Every encryption and
/// decryption goes through this one function.
pub fn derive_key(secret: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&digest);
    key
}

/// An encrypted private key: a random IV and the CBC ciphertext.
///
/// Serialized as `<32 hex chars>:<hex ciphertext>`. Only decryptable under
/// the secret that was active when it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPrivateKeyRecord {
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedPrivateKeyRecord {
    pub fn new(iv: [u8; IV_LEN], ciphertext: Vec<u8>) -> KeyCustodyResult<Self> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(KeyCustodyError::format_error(
                "encrypted private key",
                &format!(
                    "ciphertext length {} is not a positive multiple of {}",
                    ciphertext.len(),
                    BLOCK_LEN
                ),
                error_codes::MALFORMED_ENCRYPTED_RECORD,
            ));
        }
        Ok(Self { iv, ciphertext })
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

impl fmt::Display for EncryptedPrivateKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.iv), hex::encode(&self.ciphertext))
    }
}

impl FromStr for EncryptedPrivateKeyRecord {
    type Err = KeyCustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |cause: &str| {
            KeyCustodyError::format_error(
                "encrypted private key",
                cause,
                error_codes::MALFORMED_ENCRYPTED_RECORD,
            )
        };

        let (iv_hex, ciphertext_hex) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| malformed("missing ':' separator"))?;

        if iv_hex.len() != IV_LEN * 2 {
            return Err(malformed(&format!(
                "IV must be {} hex chars, got {}",
                IV_LEN * 2,
                iv_hex.len()
            )));
        }

        let mut iv = [0u8; IV_LEN];
        hex::decode_to_slice(iv_hex, &mut iv)
            .map_err(|e| malformed(&format!("invalid IV hex: {}", e)))?;

        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|e| malformed(&format!("invalid ciphertext hex: {}", e)))?;

        Self::new(iv, ciphertext)
    }
}

/// Symmetric cipher bound to one encryption secret
#[derive(Clone)]
pub struct KeyCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCipher")
            .field("key", &"[AES-256-CBC key]")
            .finish()
    }
}

impl KeyCipher {
    /// Create a cipher for `secret`
    pub fn new(secret: &SecretString) -> Self {
        Self {
            key: derive_key(secret.expose()),
        }
    }

    /// Encrypt `plaintext` under a fresh random IV
    pub fn encrypt(&self, plaintext: &[u8]) -> KeyCustodyResult<EncryptedPrivateKeyRecord> {
        let mut iv = [0u8; IV_LEN];
        OsRng.try_fill_bytes(&mut iv).map_err(|e| {
            KeyCustodyError::generation_error(
                "iv_generation",
                &e.to_string(),
                error_codes::IV_GENERATION_FAILED,
            )
        })?;

        self.encrypt_with_iv(plaintext, iv)
    }

    pub(crate) fn encrypt_with_iv(
        &self,
        plaintext: &[u8],
        iv: [u8; IV_LEN],
    ) -> KeyCustodyResult<EncryptedPrivateKeyRecord> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key[..], &iv).map_err(|e| {
            KeyCustodyError::generation_error(
                "cbc_init",
                &e.to_string(),
                error_codes::CBC_ENCRYPTION_FAILED,
            )
        })?;

        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        EncryptedPrivateKeyRecord::new(iv, ciphertext)
    }

    /// Decrypt a record to the private key PEM it holds.
    ///
    /// The plaintext must parse as an RSA private key. Valid padding under a
    /// wrong secret is still a `DecryptionError`.
    pub fn decrypt(&self, record: &EncryptedPrivateKeyRecord) -> KeyCustodyResult<SecureBytes> {
        let plaintext = self.decrypt_raw(record)?;
        KeyPair::from_private_key_bytes(&plaintext).map_err(not_a_private_key)?;
        Ok(plaintext)
    }

    /// Parse a serialized `iv:ciphertext` record and decrypt it.
    ///
    /// A record that cannot be parsed can never be decrypted, so it is
    /// reported as `DecryptionError` too.
    pub fn decrypt_serialized(&self, serialized: &str) -> KeyCustodyResult<SecureBytes> {
        self.decrypt(&parse_stored(serialized)?)
    }

    /// Decrypt a serialized record straight into a key pair
    pub(crate) fn decrypt_key_pair(&self, serialized: &str) -> KeyCustodyResult<KeyPair> {
        let plaintext = self.decrypt_raw(&parse_stored(serialized)?)?;
        KeyPair::from_private_key_bytes(&plaintext).map_err(not_a_private_key)
    }

    /// CBC decryption and unpadding with no check on the plaintext
    pub(crate) fn decrypt_raw(
        &self,
        record: &EncryptedPrivateKeyRecord,
    ) -> KeyCustodyResult<SecureBytes> {
        let cipher = Aes256CbcDec::new_from_slices(&self.key[..], record.iv()).map_err(|e| {
            KeyCustodyError::decryption_error(
                &format!("cbc init failed: {}", e),
                error_codes::CBC_DECRYPTION_FAILED,
            )
        })?;

        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(record.ciphertext())
            .map(SecureBytes::from)
            .map_err(|_| {
                KeyCustodyError::decryption_error(
                    "invalid padding (wrong secret or corrupted ciphertext)",
                    error_codes::CBC_INVALID_PADDING,
                )
            })
    }
}

fn parse_stored(serialized: &str) -> KeyCustodyResult<EncryptedPrivateKeyRecord> {
    serialized.parse().map_err(|e| {
        KeyCustodyError::decryption_error(
            &format!("stored record unreadable: {}", e),
            error_codes::CBC_DECRYPTION_FAILED,
        )
    })
}

fn not_a_private_key(e: KeyCustodyError) -> KeyCustodyError {
    KeyCustodyError::decryption_error(
        &format!("plaintext is not a private key (wrong secret or corrupted ciphertext): {}", e),
        error_codes::PLAINTEXT_NOT_A_PRIVATE_KEY,
    )
}

/// Encrypt `plaintext` under `secret`
pub fn encrypt(plaintext: &[u8], secret: &SecretString) -> KeyCustodyResult<EncryptedPrivateKeyRecord> {
    KeyCipher::new(secret).encrypt(plaintext)
}

/// Decrypt `record` under `secret`
pub fn decrypt(record: &EncryptedPrivateKeyRecord, secret: &SecretString) -> KeyCustodyResult<SecureBytes> {
    KeyCipher::new(secret).decrypt(record)
}
