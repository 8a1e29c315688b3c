/*!
 * OpenSSH public key wire format
 *
 * Converts an RSA public key (modulus, exponent) to and from the
 * `ssh-rsa <base64> [comment]` line used in `authorized_keys` files.
 */

mod encoder;

pub use encoder::*;
