/*!
 * At-rest encryption of private key material
 *
 * AES-256-CBC with PKCS#7 padding under a key derived from the configured
 * encryption secret. Records are stored as `<iv hex>:<ciphertext hex>`.
 */

mod key_cipher;

pub use key_cipher::*;
