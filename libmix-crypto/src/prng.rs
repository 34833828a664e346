//! # Keystream PRNG
//!
//! AES-128 in counter mode with a 128-bit big-endian counter that starts at
//! zero. The same `(key, length)` always yields the same bytes, which the
//! header junk, fragment padding and reply-block secret expansion rely on.
//! XOR with the keystream doubles as the stream cipher ([`encrypt`]).

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::hash::KEY_LEN;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

fn keystream(key: &[u8; KEY_LEN]) -> Aes128Ctr {
    let iv = [0u8; 16];
    Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv))
}

/// Deterministic keystream of `len` bytes
pub fn create_prng(key: &[u8; KEY_LEN], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    keystream(key).apply_keystream(&mut out);
    out
}

/// XOR `data` in place with the keystream of `key`
pub fn apply_keystream(key: &[u8; KEY_LEN], data: &mut [u8]) {
    keystream(key).apply_keystream(data);
}

/// Stream-encrypt a copy of `data`; the operation is its own inverse
pub fn encrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_keystream(key, &mut out);
    out
}
