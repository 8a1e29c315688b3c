use std::fmt;

use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};

/// Algorithm name carried both as the line prefix and inside the wire blob
pub const SSH_RSA: &str = "ssh-rsa";

/// Size of the big-endian length prefix in front of every wire field
const LENGTH_PREFIX_SIZE: usize = 4;

/// An RSA public key in OpenSSH form.
///
/// `modulus` and `exponent` hold the unsigned big-endian magnitudes, without
/// the sign byte that the wire encoding may add. The comment is advisory and
/// never part of the key's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSshPublicKey {
    pub algorithm: String,
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
    pub comment: Option<String>,
}

impl OpenSshPublicKey {
    /// Create an `ssh-rsa` key from big-endian modulus and exponent bytes
    pub fn new(modulus: &[u8], exponent: &[u8], comment: Option<&str>) -> Self {
        Self {
            algorithm: SSH_RSA.to_string(),
            modulus: modulus.to_vec(),
            exponent: exponent.to_vec(),
            comment: comment
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        }
    }

    /// Parse an `ssh-rsa <base64> [comment]` line
    pub fn parse(line: &str) -> KeyCustodyResult<Self> {
        decode(line)
    }

    /// The binary payload carried inside the line, before base64
    pub fn wire_blob(&self) -> Vec<u8> {
        wire_blob(&self.modulus, &self.exponent)
    }

    /// `ssh-rsa <base64>` without the comment; this is what identifies the key
    pub fn key_material(&self) -> String {
        format!("{} {}", self.algorithm, base64::encode(self.wire_blob()))
    }

    /// Full line including the comment, if any
    pub fn to_line(&self) -> String {
        match &self.comment {
            Some(comment) => format!("{} {}", self.key_material(), comment),
            None => self.key_material(),
        }
    }

    /// Bit length of the modulus
    pub fn modulus_bits(&self) -> usize {
        let significant = self.modulus.iter().skip_while(|b| **b == 0).count();
        match self.modulus.iter().find(|b| **b != 0) {
            Some(first) => significant * 8 - first.leading_zeros() as usize,
            None => 0,
        }
    }
}

impl fmt::Display for OpenSshPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Encode an unsigned big-endian integer as an SSH mpint body.
///
/// A single `0x00` is prepended only when the high bit of the first byte is
/// set, so the value is not read back as negative. No other bytes are added
/// or removed.
pub fn mpint(x: &[u8]) -> Vec<u8> {
    match x.first() {
        Some(first) if first & 0x80 != 0 => {
            let mut out = Vec::with_capacity(x.len() + 1);
            out.push(0x00);
            out.extend_from_slice(x);
            out
        }
        _ => x.to_vec(),
    }
}

fn put_length_prefixed(out: &mut Vec<u8>, buf: &[u8]) {
    out.extend_from_slice(&(buf.len() as u32).to_be_bytes());
    out.extend_from_slice(buf);
}

/// Build the `ssh-rsa` wire blob: algorithm name, exponent, modulus
pub fn wire_blob(modulus: &[u8], exponent: &[u8]) -> Vec<u8> {
    let e = mpint(exponent);
    let n = mpint(modulus);

    let mut blob =
        Vec::with_capacity(3 * LENGTH_PREFIX_SIZE + SSH_RSA.len() + e.len() + n.len());
    put_length_prefixed(&mut blob, SSH_RSA.as_bytes());
    put_length_prefixed(&mut blob, &e);
    put_length_prefixed(&mut blob, &n);
    blob
}

/// Encode (modulus, exponent) as an OpenSSH public key line
///
/// # Example
///
/// ```
/// use keywarden::openssh;
///
/// let line = openssh::encode(&[0xc3, 0x5a], &[0x01, 0x00, 0x01], Some("admin"));
/// assert!(line.starts_with("ssh-rsa AAAAB3NzaC1yc2E"));
/// assert!(line.ends_with(" admin"));
/// ```
pub fn encode(modulus: &[u8], exponent: &[u8], comment: Option<&str>) -> String {
    OpenSshPublicKey::new(modulus, exponent, comment).to_line()
}

/// Decode an OpenSSH public key line into its algorithm, modulus and exponent.
///
/// Rejects the whole line with `FormatError` if the algorithm is not
/// `ssh-rsa`, if any declared length runs past the end of the blob, or if
/// bytes are left over after the three fields.
pub fn decode(line: &str) -> KeyCustodyResult<OpenSshPublicKey> {
    let mut fields = line.split_whitespace();

    let prefix = fields.next().ok_or_else(|| {
        KeyCustodyError::format_error(
            "public key line",
            "empty line",
            error_codes::MALFORMED_PUBLIC_KEY_LINE,
        )
    })?;
    let encoded = fields.next().ok_or_else(|| {
        KeyCustodyError::format_error(
            "public key line",
            "missing base64 key field",
            error_codes::MALFORMED_PUBLIC_KEY_LINE,
        )
    })?;
    let comment: Vec<&str> = fields.collect();

    let blob = base64::decode(encoded).map_err(|e| {
        KeyCustodyError::format_error(
            "public key line",
            &format!("invalid base64: {}", e),
            error_codes::MALFORMED_PUBLIC_KEY_LINE,
        )
    })?;

    let (algorithm, modulus, exponent) = decode_wire_blob(&blob)?;

    if prefix != algorithm {
        return Err(KeyCustodyError::format_error(
            "public key line",
            &format!("line says '{}' but blob says '{}'", prefix, algorithm),
            error_codes::UNSUPPORTED_KEY_ALGORITHM,
        ));
    }

    let comment = if comment.is_empty() {
        None
    } else {
        Some(comment.join(" "))
    };

    Ok(OpenSshPublicKey {
        algorithm,
        modulus,
        exponent,
        comment,
    })
}

/// Walk the three length-prefixed fields of an `ssh-rsa` wire blob.
///
/// Returns (algorithm, modulus, exponent) with sign bytes removed.
pub fn decode_wire_blob(blob: &[u8]) -> KeyCustodyResult<(String, Vec<u8>, Vec<u8>)> {
    let mut reader = WireReader::new(blob);

    let algorithm = reader.read_field("algorithm name")?;
    if algorithm != SSH_RSA.as_bytes() {
        return Err(KeyCustodyError::format_error(
            "wire blob",
            &format!(
                "unsupported algorithm '{}'",
                String::from_utf8_lossy(algorithm)
            ),
            error_codes::UNSUPPORTED_KEY_ALGORITHM,
        ));
    }

    let exponent = unsigned_magnitude(reader.read_field("exponent")?, "exponent")?;
    let modulus = unsigned_magnitude(reader.read_field("modulus")?, "modulus")?;

    if reader.remaining() != 0 {
        return Err(KeyCustodyError::format_error(
            "wire blob",
            &format!("{} trailing bytes after modulus", reader.remaining()),
            error_codes::TRUNCATED_WIRE_BLOB,
        ));
    }

    Ok((SSH_RSA.to_string(), modulus, exponent))
}

/// Extract and decode the base64 field of a public key line
pub fn blob_from_line(line: &str) -> KeyCustodyResult<Vec<u8>> {
    let encoded = line.split_whitespace().nth(1).ok_or_else(|| {
        KeyCustodyError::format_error(
            "public key line",
            "missing base64 key field",
            error_codes::MALFORMED_PUBLIC_KEY_LINE,
        )
    })?;

    base64::decode(encoded).map_err(|e| {
        KeyCustodyError::format_error(
            "public key line",
            &format!("invalid base64: {}", e),
            error_codes::MALFORMED_PUBLIC_KEY_LINE,
        )
    })
}

/// Strip the mpint sign byte. Negative values are not valid RSA parameters.
fn unsigned_magnitude(field: &[u8], name: &str) -> KeyCustodyResult<Vec<u8>> {
    match field {
        [] => Err(KeyCustodyError::format_error(
            "wire blob",
            &format!("{} is empty", name),
            error_codes::TRUNCATED_WIRE_BLOB,
        )),
        [first, ..] if first & 0x80 != 0 => Err(KeyCustodyError::format_error(
            "wire blob",
            &format!("{} is negative", name),
            error_codes::MALFORMED_PUBLIC_KEY_LINE,
        )),
        [0x00, second, rest @ ..] if second & 0x80 != 0 => {
            let mut magnitude = Vec::with_capacity(rest.len() + 1);
            magnitude.push(*second);
            magnitude.extend_from_slice(rest);
            Ok(magnitude)
        }
        _ => Ok(field.to_vec()),
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_field(&mut self, name: &str) -> KeyCustodyResult<&'a [u8]> {
        if self.remaining() < LENGTH_PREFIX_SIZE {
            return Err(KeyCustodyError::format_error(
                "wire blob",
                &format!("missing length prefix for {}", name),
                error_codes::TRUNCATED_WIRE_BLOB,
            ));
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[self.pos..self.pos + LENGTH_PREFIX_SIZE]);
        let declared = u32::from_be_bytes(prefix) as usize;
        self.pos += LENGTH_PREFIX_SIZE;

        if declared > self.remaining() {
            return Err(KeyCustodyError::format_error(
                "wire blob",
                &format!(
                    "{} declares {} bytes but only {} remain",
                    name,
                    declared,
                    self.remaining()
                ),
                error_codes::TRUNCATED_WIRE_BLOB,
            ));
        }

        let field = &self.buf[self.pos..self.pos + declared];
        self.pos += declared;
        Ok(field)
    }
}
