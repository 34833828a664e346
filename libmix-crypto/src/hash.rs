//! # Digests
//!
//! SHA-1 is the packet digest of the Type III format: header digests, key
//! digests, payload checksums and every derived key go through [`hash`].
//!
//! ## Key derivation
//!
//! Sub-keys are the first [`KEY_LEN`] bytes of `hash(secret | label)`:
//!
//! ```text
//! sub_key(s, "HEADER SECRET KEY")  -> header stream key
//! sub_key(s, "RANDOM JUNK")        -> junk padding key
//! ```
//!
//! MD5 and the HMAC helpers exist for the TLS 1.0 PRF, record MACs and
//! ServerKeyExchange signatures.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// SHA-1 output size in bytes
pub const HASH_LEN: usize = 20;
/// Symmetric key size in bytes (AES-128)
pub const KEY_LEN: usize = 16;
/// MD5 output size in bytes
pub const MD5_LEN: usize = 16;

/// Fixed-size SHA-1 digest
pub type Digest20 = [u8; HASH_LEN];

/// SHA-1 of a single buffer
pub fn hash(data: &[u8]) -> Digest20 {
    Sha1::digest(data).into()
}

/// SHA-1 over the concatenation of `parts`
pub fn hash_concat(parts: &[&[u8]]) -> Digest20 {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derive a 16-byte key: first bytes of `hash(secret | label)`
pub fn sub_key(secret: &[u8], label: &str) -> [u8; KEY_LEN] {
    let digest = hash_concat(&[secret, label.as_bytes()]);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

/// MD5 over the concatenation of `parts`
pub fn md5_concat(parts: &[&[u8]]) -> [u8; MD5_LEN] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// HMAC-SHA1 over the concatenation of `parts`
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Digest20 {
    let mut mac = <Hmac<Sha1> as KeyInit>::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// HMAC-MD5 over the concatenation of `parts`
pub fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; MD5_LEN] {
    let mut mac = <Hmac<Md5> as KeyInit>::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time equality for digests and MACs
pub fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            hex::encode(hash(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_hash_concat_matches_single_buffer() {
        let joined = hash(b"header secret");
        let parts = hash_concat(&[b"header", b" ", b"secret"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_sub_key_is_prefix_of_labelled_hash() {
        let secret = [7u8; 16];
        let key = sub_key(&secret, "HEADER SECRET KEY");
        let full = hash_concat(&[&secret, b"HEADER SECRET KEY"]);
        assert_eq!(&key[..], &full[..KEY_LEN]);
        assert_ne!(key, sub_key(&secret, "RANDOM JUNK"));
    }

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(
            hex::encode(md5_concat(&[b"a", b"bc"])),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_hmac_rfc2202_vectors() {
        // RFC 2202 test case 2
        let sha = hmac_sha1(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        assert_eq!(hex::encode(sha), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");

        let md5 = hmac_md5(b"Jefe", &[b"what do ya want for nothing?"]);
        assert_eq!(hex::encode(md5), "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn test_hmac_long_key() {
        // RFC 2202 test case 6: 80-byte key is hashed first
        let key = [0xaau8; 80];
        let tag = hmac_sha1(&key, &[b"Test Using Larger Than Block-Size Key - Hash Key First"]);
        assert_eq!(hex::encode(tag), "aa4ae5e15272d00e95705637ce8a3b55ed402112");

        // RFC 2202 test case 7, HMAC-MD5 with an 80-byte key
        let key = [0xaau8; 80];
        let tag = hmac_md5(&key, &[b"Test Using Larger Than Block-Size Key and Larger Than One Block-Size Data"]);
        assert_eq!(hex::encode(tag), "6f630fad67cda0ee1fb1f562db3aa53e");
    }

    #[test]
    fn test_hmac_empty_key() {
        let mac = <Hmac<Sha1> as KeyInit>::new_from_slice(b"").unwrap().chain_update(b"data").finalize();
        assert_eq!(hmac_sha1(b"", &[b"da", b"ta"]), <Digest20>::from(mac.into_bytes()));
    }

    #[test]
    fn test_digest_eq() {
        assert!(digest_eq(b"same", b"same"));
        assert!(!digest_eq(b"same", b"diff"));
        assert!(!digest_eq(b"short", b"longer"));
    }
}
