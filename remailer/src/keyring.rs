//! Keyring
//!
//! Password-protected store of the long-term user secrets reply blocks are
//! generated from.
//!
//! # Format
//!
//! ```text
//! data'   = len(4) | items | random padding to a multiple of 1024
//! key     = hash(salt | password | salt)[..16]
//! encdata = Encrypt(key, data' | hash(data' | salt | "KEYRING2"))
//! item    = type(1) | len(2) | value
//! SURB key value = expires(4) | name (NUL-terminated) | secret(20)
//! ```
//!
//! Items of unknown type are carried through unchanged.

use std::path::Path;

use libmix_crypto::{digest_eq, encrypt, hash_concat, random_bytes, random_vec, HASH_LEN, KEY_LEN};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::armor;
use crate::reply_block::is_own_handle;
use crate::routing::TAG_LEN;
use crate::{unix_now, MixError, MixResult, REPLY_BLOCK_LIFETIME};

/// Armor begin line
pub const BEGIN_MARKER: &str = "-----BEGIN TYPE III KEYRING-----";

/// Armor end line
pub const END_MARKER: &str = "-----END TYPE III KEYRING-----";

/// Armor version line
pub const VERSION_LINE: &str = "Version: 0.1";

/// Length of a user secret
pub const USER_SECRET_LEN: usize = HASH_LEN;

const SALT: [u8; 8] = [0x12, 0x08, 0x20, 0x10, 0x34, 0x56, 0x07, 0x13];
const MAGIC: &[u8; 8] = b"KEYRING2";
const SURB_KEY_ITEM: u8 = 0x00;
const SURB_KEY_NAME: [u8; 10] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x00];
const PAD_BLOCK: usize = 1024;

/// One user secret
#[derive(Clone)]
pub struct UserSecret {
    secret: [u8; USER_SECRET_LEN],
    expires: u64,
}

impl std::fmt::Debug for UserSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSecret").field("expires", &self.expires).finish()
    }
}

impl Drop for UserSecret {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl UserSecret {
    /// Secret bytes
    pub fn secret(&self) -> &[u8; USER_SECRET_LEN] {
        &self.secret
    }

    /// Expiry, Unix seconds
    pub fn expires(&self) -> u64 {
        self.expires
    }
}

/// User secrets plus items this version does not interpret
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    secrets: Vec<UserSecret>,
    unknown: Vec<(u8, Vec<u8>)>,
}

impl Keyring {
    /// Empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored secrets, oldest first
    pub fn secrets(&self) -> &[UserSecret] {
        &self.secrets
    }

    /// Number of secrets
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// No secrets stored
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Generate and store a new secret
    pub fn new_secret(&mut self) -> MixResult<[u8; USER_SECRET_LEN]> {
        self.new_secret_at(unix_now())
    }

    /// [`Keyring::new_secret`] with an explicit time
    pub fn new_secret_at(&mut self, now: u64) -> MixResult<[u8; USER_SECRET_LEN]> {
        let secret = random_bytes::<USER_SECRET_LEN>()?;
        self.secrets.push(UserSecret { secret, expires: now + REPLY_BLOCK_LIFETIME });
        debug!(count = self.secrets.len(), "added user secret");
        Ok(secret)
    }

    /// Newest secret still valid at `now`
    pub fn current_secret(&self, now: u64) -> Option<&[u8; USER_SECRET_LEN]> {
        self.secrets
            .iter()
            .filter(|s| s.expires > now)
            .max_by_key(|s| s.expires)
            .map(|s| &s.secret)
    }

    /// Secret that generated the reply block with `handle`
    pub fn secret_for_handle(&self, handle: &[u8; TAG_LEN]) -> Option<&[u8; USER_SECRET_LEN]> {
        self.secrets
            .iter()
            .map(|s| &s.secret)
            .find(|s| is_own_handle(handle, &s[..]))
    }

    /// Encrypt and armor. Secrets more than one lifetime past expiry are
    /// left out.
    pub fn pack(&self, password: &str, now: u64) -> MixResult<String> {
        let mut items = Zeroizing::new(Vec::new());
        for s in self.secrets.iter().filter(|s| s.expires + REPLY_BLOCK_LIFETIME > now) {
            let mut value = Vec::with_capacity(4 + SURB_KEY_NAME.len() + USER_SECRET_LEN);
            value.extend_from_slice(&(s.expires.min(u32::MAX as u64) as u32).to_be_bytes());
            value.extend_from_slice(&SURB_KEY_NAME);
            value.extend_from_slice(&s.secret);
            push_item(&mut items, SURB_KEY_ITEM, &value);
            value.zeroize();
        }
        for (kind, value) in &self.unknown {
            push_item(&mut items, *kind, value);
        }

        let blocks = ((items.len() + PAD_BLOCK - 1) / PAD_BLOCK).max(1);
        let mut data = Zeroizing::new(Vec::with_capacity(4 + blocks * PAD_BLOCK + HASH_LEN));
        data.extend_from_slice(&(items.len() as u32).to_be_bytes());
        data.extend_from_slice(&items[..]);
        data.extend(random_vec(blocks * PAD_BLOCK - items.len())?);
        let digest = hash_concat(&[&data[..], &SALT, MAGIC]);
        data.extend_from_slice(&digest);

        let encrypted = encrypt(&password_key(password), &data);
        Ok(format!(
            "{}\n{}\n\n{}\n{}\n",
            BEGIN_MARKER,
            VERSION_LINE,
            armor::encode(&encrypted),
            END_MARKER
        ))
    }

    /// Decrypt an armored keyring
    pub fn unpack(text: &str, password: &str) -> MixResult<Self> {
        let mut lines = text.lines().skip_while(|l| l.trim() != BEGIN_MARKER);
        if lines.next().is_none() {
            return Err(MixError::InvalidKeyring("no keyring armor".into()));
        }
        // armor headers end at the first blank line
        let body: Vec<&str> = lines
            .skip_while(|l| !l.trim().is_empty())
            .take_while(|l| l.trim() != END_MARKER)
            .collect();
        let encrypted = armor::decode(body.iter().copied())
            .map_err(|e| MixError::InvalidKeyring(e.to_string()))?;
        if encrypted.len() < 4 + HASH_LEN {
            return Err(MixError::InvalidKeyring("keyring too short".into()));
        }

        let data = Zeroizing::new(encrypt(&password_key(password), &encrypted));
        let (body, digest) = data.split_at(data.len() - HASH_LEN);
        if !digest_eq(&hash_concat(&[body, &SALT, MAGIC]), digest) {
            return Err(MixError::WrongPassword);
        }

        let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let items = body
            .get(4..4 + len)
            .ok_or_else(|| MixError::InvalidKeyring("item length exceeds data".into()))?;
        let keyring = Self::parse_items(items)?;
        info!(secrets = keyring.secrets.len(), "unpacked keyring");
        Ok(keyring)
    }

    fn parse_items(mut items: &[u8]) -> MixResult<Self> {
        let mut keyring = Self::new();
        while !items.is_empty() {
            if items.len() < 3 {
                return Err(MixError::InvalidKeyring("truncated item header".into()));
            }
            let kind = items[0];
            let len = u16::from_be_bytes([items[1], items[2]]) as usize;
            let value = items
                .get(3..3 + len)
                .ok_or_else(|| MixError::InvalidKeyring("truncated item".into()))?;
            if kind == SURB_KEY_ITEM {
                keyring.secrets.push(parse_surb_key(value)?);
            } else {
                keyring.unknown.push((kind, value.to_vec()));
            }
            items = &items[3 + len..];
        }
        Ok(keyring)
    }

    /// Read a keyring file
    pub fn load(path: &Path, password: &str) -> MixResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MixError::InvalidKeyring(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::unpack(&text, password)
    }

    /// Write a keyring file
    pub fn save(&self, path: &Path, password: &str) -> MixResult<()> {
        std::fs::write(path, self.pack(password, unix_now())?)?;
        Ok(())
    }
}

fn push_item(out: &mut Vec<u8>, kind: u8, value: &[u8]) {
    out.push(kind);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn parse_surb_key(value: &[u8]) -> MixResult<UserSecret> {
    if value.len() < 4 {
        return Err(MixError::InvalidKeyring("SURB key item too short".into()));
    }
    let expires = u32::from_be_bytes([value[0], value[1], value[2], value[3]]) as u64;
    let name_end = value[4..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| MixError::InvalidKeyring("SURB key name not terminated".into()))?;
    let secret_bytes = &value[4 + name_end + 1..];
    if secret_bytes.len() != USER_SECRET_LEN {
        return Err(MixError::InvalidKeyring(format!(
            "SURB key secret is {} bytes",
            secret_bytes.len()
        )));
    }
    let mut secret = [0u8; USER_SECRET_LEN];
    secret.copy_from_slice(secret_bytes);
    Ok(UserSecret { secret, expires })
}

fn password_key(password: &str) -> [u8; KEY_LEN] {
    let digest = hash_concat(&[&SALT, password.as_bytes(), &SALT]);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn test_pack_unpack() {
        let mut ring = Keyring::new();
        let a = ring.new_secret_at(NOW).unwrap();
        let b = ring.new_secret_at(NOW + 10).unwrap();

        let text = ring.pack("hunter2", NOW).unwrap();
        assert!(text.starts_with(BEGIN_MARKER));
        assert!(text.contains(VERSION_LINE));

        let back = Keyring::unpack(&text, "hunter2").unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.secrets()[0].secret(), &a);
        assert_eq!(back.secrets()[1].secret(), &b);
        assert_eq!(back.secrets()[0].expires(), NOW + REPLY_BLOCK_LIFETIME);
        assert_eq!(back.current_secret(NOW), Some(&b));
    }

    #[test]
    fn test_wrong_password() {
        let mut ring = Keyring::new();
        ring.new_secret_at(NOW).unwrap();
        let text = ring.pack("right", NOW).unwrap();
        assert!(matches!(Keyring::unpack(&text, "wrong"), Err(MixError::WrongPassword)));
    }

    #[test]
    fn test_empty_keyring_padded() {
        let text = Keyring::new().pack("pw", NOW).unwrap();
        let body: Vec<&str> = text.lines().skip(3).take_while(|l| *l != END_MARKER).collect();
        let bytes = armor::decode(body).unwrap();
        assert_eq!(bytes.len(), 4 + PAD_BLOCK + HASH_LEN);
        assert!(Keyring::unpack(&text, "pw").unwrap().is_empty());
    }

    #[test]
    fn test_long_expired_secret_dropped() {
        let mut ring = Keyring::new();
        ring.new_secret_at(NOW).unwrap();
        let later = NOW + 2 * REPLY_BLOCK_LIFETIME + 1;
        ring.new_secret_at(later).unwrap();
        let back = Keyring::unpack(&ring.pack("pw", later).unwrap(), "pw").unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.current_secret(NOW + REPLY_BLOCK_LIFETIME + 1).is_some());
    }

    #[test]
    fn test_unknown_items_preserved() {
        let mut items = Vec::new();
        push_item(&mut items, 0x07, b"opaque");
        let ring = Keyring::parse_items(&items).unwrap();
        assert!(ring.is_empty());
        let back = Keyring::unpack(&ring.pack("pw", NOW).unwrap(), "pw").unwrap();
        assert_eq!(back.unknown, vec![(0x07, b"opaque".to_vec())]);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring");
        let mut ring = Keyring::new();
        let secret = ring.new_secret().unwrap();
        ring.save(&path, "pw").unwrap();
        let back = Keyring::load(&path, "pw").unwrap();
        assert_eq!(back.secrets()[0].secret(), &secret);
    }

    #[test]
    fn test_not_armored() {
        assert!(Keyring::unpack("hello", "pw").unwrap_err().is_parse_error());
    }
}
