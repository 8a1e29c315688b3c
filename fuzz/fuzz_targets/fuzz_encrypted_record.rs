#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use keywarden::cipher::{EncryptedPrivateKeyRecord, KeyCipher};
use keywarden::secure_memory::SecretString;

const ADMIN_PKCS8: &str = include_str!("../../tests/fixtures/admin_rsa_pkcs8.pem");

#[derive(Arbitrary, Debug)]
struct RecordFuzzInput {
    serialized: String,
    secret: String,
    plaintext: Vec<u8>,
}

fuzz_target!(|input: RecordFuzzInput| {
    let cipher = KeyCipher::new(&SecretString::new(input.secret));

    // Parsing and decrypting untrusted records must never panic
    if let Ok(record) = input.serialized.parse::<EncryptedPrivateKeyRecord>() {
        let reparsed: EncryptedPrivateKeyRecord = record.to_string().parse().expect("serialized record must parse");
        assert_eq!(reparsed, record);
        let _ = cipher.decrypt(&record);
    }
    let _ = cipher.decrypt_serialized(&input.serialized);

    // Arbitrary plaintext is only returned if it is a private key
    let record = cipher.encrypt(&input.plaintext).expect("encryption must succeed");
    if let Ok(decrypted) = cipher.decrypt(&record) {
        assert_eq!(decrypted.as_bytes(), &input.plaintext[..]);
    }

    let record = cipher.encrypt(ADMIN_PKCS8.as_bytes()).expect("encryption must succeed");
    let decrypted = cipher.decrypt(&record).expect("own ciphertext must decrypt");
    assert_eq!(decrypted.as_bytes(), ADMIN_PKCS8.as_bytes());
});
