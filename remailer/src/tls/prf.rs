//! TLS 1.0 pseudo-random function and key derivation
//!
//! `PRF(secret, label, seed) = P_MD5(S1, label | seed) XOR P_SHA1(S2, label | seed)`
//! where S1 and S2 are the two (possibly overlapping) halves of the secret.

use libmix_crypto::{hash, hmac_md5, hmac_sha1, md5_concat};
use zeroize::Zeroizing;

use super::cipher_suite::CipherSuite;
use super::RANDOM_LEN;

/// Master secret size
pub const MASTER_SECRET_LEN: usize = 48;

/// Finished verify_data size
pub const VERIFY_DATA_LEN: usize = 12;

/// Finished label of the initiator
pub const CLIENT_FINISHED: &str = "client finished";

/// Finished label of the responder
pub const SERVER_FINISHED: &str = "server finished";

const MASTER_SECRET_LABEL: &str = "master secret";
const KEY_EXPANSION_LABEL: &str = "key expansion";

fn p_md5(secret: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 16);
    let mut a = hmac_md5(secret, &[seed]);
    while out.len() < len {
        out.extend_from_slice(&hmac_md5(secret, &[&a, seed]));
        a = hmac_md5(secret, &[&a]);
    }
    out.truncate(len);
    out
}

fn p_sha1(secret: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 20);
    let mut a = hmac_sha1(secret, &[seed]);
    while out.len() < len {
        out.extend_from_slice(&hmac_sha1(secret, &[&a, seed]));
        a = hmac_sha1(secret, &[&a]);
    }
    out.truncate(len);
    out
}

/// `len` bytes of PRF output
pub fn prf(secret: &[u8], label: &str, seed: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let labeled = [label.as_bytes(), seed].concat();
    let mut out = Zeroizing::new(p_md5(s1, &labeled, len));
    for (o, b) in out.iter_mut().zip(p_sha1(s2, &labeled, len)) {
        *o ^= b;
    }
    out
}

/// Master secret from the DH premaster secret
pub fn master_secret(
    pre_master: &[u8],
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
) -> Zeroizing<Vec<u8>> {
    prf(pre_master, MASTER_SECRET_LABEL, &[&client_random[..], &server_random[..]].concat(), MASTER_SECRET_LEN)
}

/// Per-direction record keys
pub struct KeyBlock {
    /// Initiator write MAC key
    pub client_mac: Zeroizing<Vec<u8>>,
    /// Responder write MAC key
    pub server_mac: Zeroizing<Vec<u8>>,
    /// Initiator write key
    pub client_key: Zeroizing<Vec<u8>>,
    /// Responder write key
    pub server_key: Zeroizing<Vec<u8>>,
    /// Initiator CBC IV
    pub client_iv: Vec<u8>,
    /// Responder CBC IV
    pub server_iv: Vec<u8>,
}

impl std::fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBlock").finish_non_exhaustive()
    }
}

/// Expand the master secret into record keys for `suite`
pub fn key_block(
    master: &[u8],
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
    suite: CipherSuite,
) -> KeyBlock {
    let seed = [&server_random[..], &client_random[..]].concat();
    let block = prf(master, KEY_EXPANSION_LABEL, &seed, suite.key_block_len());

    let (mac, key, iv) = (suite.mac_len(), suite.key_len(), suite.iv_len());
    let mut rest: &[u8] = &block;
    let mut take = |n: usize| {
        let (head, tail) = rest.split_at(n);
        rest = tail;
        head.to_vec()
    };
    KeyBlock {
        client_mac: Zeroizing::new(take(mac)),
        server_mac: Zeroizing::new(take(mac)),
        client_key: Zeroizing::new(take(key)),
        server_key: Zeroizing::new(take(key)),
        client_iv: take(iv),
        server_iv: take(iv),
    }
}

/// MD5 | SHA-1 of `data`, the digest TLS 1.0 signs
pub fn md5_sha1(data: &[u8]) -> [u8; 36] {
    let mut out = [0u8; 36];
    out[..16].copy_from_slice(&md5_concat(&[data]));
    out[16..].copy_from_slice(&hash(data));
    out
}

/// Finished verify_data over the handshake transcript
pub fn finished(master: &[u8], label: &str, transcript: &[u8]) -> [u8; VERIFY_DATA_LEN] {
    let out = prf(master, label, &md5_sha1(transcript), VERIFY_DATA_LEN);
    let mut data = [0u8; VERIFY_DATA_LEN];
    data.copy_from_slice(&out);
    data
}
