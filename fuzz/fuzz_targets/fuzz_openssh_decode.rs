#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use keywarden::{fingerprint, openssh};

#[derive(Arbitrary, Debug)]
struct DecodeFuzzInput {
    line: String,
    blob: Vec<u8>,
}

fuzz_target!(|input: DecodeFuzzInput| {
    // Arbitrary text lines
    if let Ok(key) = openssh::decode(&input.line) {
        // Anything accepted must re-encode to the same key material
        let reencoded = key.key_material();
        let again = openssh::decode(&reencoded).expect("re-encoded key must decode");
        assert_eq!(again.modulus, key.modulus);
        assert_eq!(again.exponent, key.exponent);
        let _ = fingerprint::fingerprint(&input.line);
    }

    // Raw wire blobs, bypassing the base64 layer
    let _ = openssh::decode_wire_blob(&input.blob);
});
