//! MD5 fingerprints of OpenSSH public keys.
//!
//! The fingerprint is the MD5 digest of the wire blob rendered as 16
//! colon-separated lowercase hex pairs, the same value `ssh-keygen -l -E md5`
//! prints. It depends on the blob only, never on the comment.

use crate::error::KeyCustodyResult;
use crate::openssh;

/// Fingerprint of a raw wire blob
pub fn fingerprint_blob(blob: &[u8]) -> String {
    let digest = md5::compute(blob);
    let hex = hex::encode(digest.0);

    let mut out = String::with_capacity(hex.len() + hex.len() / 2);
    for (i, c) in hex.chars().enumerate() {
        if i > 0 && i % 2 == 0 {
            out.push(':');
        }
        out.push(c);
    }
    out
}

/// Fingerprint of an `ssh-rsa <base64> [comment]` line
pub fn fingerprint(line: &str) -> KeyCustodyResult<String> {
    let blob = openssh::blob_from_line(line)?;
    Ok(fingerprint_blob(&blob))
}

/// Whether `candidate` has the `xx:xx:...:xx` shape of an MD5 fingerprint
pub fn is_well_formed(candidate: &str) -> bool {
    let pairs: Vec<&str> = candidate.split(':').collect();
    pairs.len() == 16
        && pairs.iter().all(|pair| {
            pair.len() == 2
                && pair
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        })
}
