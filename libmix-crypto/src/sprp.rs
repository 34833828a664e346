//! # LIONESS wide-block cipher
//!
//! A super-pseudorandom permutation over blocks of any length of at least
//! [`SPRP_KEY_LEN`] bytes, built from SHA-1 and the AES-CTR keystream.
//! Headers and payloads are wrapped with it so that changing any byte of a
//! block garbles all of it.
//!
//! ## Rounds
//!
//! ```text
//! L = block[..20], R = block[20..]
//! R ^= PRNG(H(K1 | L | K1)[..16])
//! L ^= H(K2 | R | K2)
//! R ^= PRNG(H(K3 | L | K3)[..16])
//! L ^= H(K4 | R | K4)
//! ```
//!
//! K2..K4 are the caller key with the last byte xored by 1, 2 and 3.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::{hash_concat, HASH_LEN, KEY_LEN};
use crate::prng::apply_keystream;

/// LIONESS key size (one SHA-1 digest)
pub const SPRP_KEY_LEN: usize = HASH_LEN;

/// Error types for SPRP operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SprpError {
    /// Block shorter than the left half
    BlockTooShort {
        /// Length of the rejected block
        len: usize,
    },
}

impl std::fmt::Display for SprpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SprpError::BlockTooShort { len } => {
                write!(f, "SPRP block of {} bytes is shorter than {}", len, SPRP_KEY_LEN)
            }
        }
    }
}

impl std::error::Error for SprpError {}

/// Expanded LIONESS round keys
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Lioness {
    keys: [[u8; SPRP_KEY_LEN]; 4],
}

impl Lioness {
    /// Expand a 20-byte key into the four round keys
    pub fn new(key: &[u8; SPRP_KEY_LEN]) -> Self {
        let mut keys = [*key; 4];
        for (i, round_key) in keys.iter_mut().enumerate().skip(1) {
            round_key[SPRP_KEY_LEN - 1] ^= i as u8;
        }
        Self { keys }
    }

    fn stream_round(key: &[u8; SPRP_KEY_LEN], left: &[u8], right: &mut [u8]) {
        let digest = hash_concat(&[key, left, key]);
        let mut stream_key = [0u8; KEY_LEN];
        stream_key.copy_from_slice(&digest[..KEY_LEN]);
        apply_keystream(&stream_key, right);
        stream_key.zeroize();
    }

    fn hash_round(key: &[u8; SPRP_KEY_LEN], left: &mut [u8], right: &[u8]) {
        let digest = hash_concat(&[key, right, key]);
        for (l, d) in left.iter_mut().zip(digest.iter()) {
            *l ^= d;
        }
    }

    /// Encrypt `block` in place
    pub fn encrypt(&self, block: &mut [u8]) -> Result<(), SprpError> {
        if block.len() < SPRP_KEY_LEN {
            return Err(SprpError::BlockTooShort { len: block.len() });
        }
        let (left, right) = block.split_at_mut(SPRP_KEY_LEN);
        Self::stream_round(&self.keys[0], left, right);
        Self::hash_round(&self.keys[1], left, right);
        Self::stream_round(&self.keys[2], left, right);
        Self::hash_round(&self.keys[3], left, right);
        Ok(())
    }

    /// Decrypt `block` in place
    pub fn decrypt(&self, block: &mut [u8]) -> Result<(), SprpError> {
        if block.len() < SPRP_KEY_LEN {
            return Err(SprpError::BlockTooShort { len: block.len() });
        }
        let (left, right) = block.split_at_mut(SPRP_KEY_LEN);
        Self::hash_round(&self.keys[3], left, right);
        Self::stream_round(&self.keys[2], left, right);
        Self::hash_round(&self.keys[1], left, right);
        Self::stream_round(&self.keys[0], left, right);
        Ok(())
    }
}

/// Encrypt a copy of `block` under `key`
pub fn sprp_encrypt(key: &[u8; SPRP_KEY_LEN], block: &[u8]) -> Result<Vec<u8>, SprpError> {
    let mut out = block.to_vec();
    Lioness::new(key).encrypt(&mut out)?;
    Ok(out)
}

/// Decrypt a copy of `block` under `key`
pub fn sprp_decrypt(key: &[u8; SPRP_KEY_LEN], block: &[u8]) -> Result<Vec<u8>, SprpError> {
    let mut out = block.to_vec();
    Lioness::new(key).decrypt(&mut out)?;
    Ok(out)
}
