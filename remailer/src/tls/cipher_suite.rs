//! Cipher Suites and Record Protection
//!
//! Every suite is DHE-RSA with a CBC block cipher and HMAC-SHA1, MAC then
//! encrypt. The IV of each record is the last ciphertext block of the one
//! before it.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use des::TdesEde3;
use libmix_crypto::{hmac_sha1, random_bytes, Digest20, HASH_LEN};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeLess};
use zeroize::Zeroizing;

use super::record::ContentType;
use super::PROTOCOL_VERSION;
use crate::{MixError, MixResult};

/// Largest random padding added on top of the minimum, in blocks
const MAX_EXTRA_PAD_BLOCKS: u8 = 4;

/// Supported cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CipherSuite {
    /// TLS_DHE_RSA_WITH_3DES_EDE_CBC_SHA
    DheRsa3desEdeCbcSha = 0x0016,
    /// TLS_DHE_RSA_WITH_AES_128_CBC_SHA
    DheRsaAes128CbcSha = 0x0033,
    /// TLS_DHE_RSA_WITH_AES_256_CBC_SHA
    DheRsaAes256CbcSha = 0x0039,
}

impl CipherSuite {
    /// Suite for a wire code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0016 => Some(CipherSuite::DheRsa3desEdeCbcSha),
            0x0033 => Some(CipherSuite::DheRsaAes128CbcSha),
            0x0039 => Some(CipherSuite::DheRsaAes256CbcSha),
            _ => None,
        }
    }

    /// Wire code
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Standard name
    pub fn name(self) -> &'static str {
        match self {
            CipherSuite::DheRsa3desEdeCbcSha => "TLS_DHE_RSA_WITH_3DES_EDE_CBC_SHA",
            CipherSuite::DheRsaAes128CbcSha => "TLS_DHE_RSA_WITH_AES_128_CBC_SHA",
            CipherSuite::DheRsaAes256CbcSha => "TLS_DHE_RSA_WITH_AES_256_CBC_SHA",
        }
    }

    /// Cipher key size
    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::DheRsaAes128CbcSha => 16,
            CipherSuite::DheRsa3desEdeCbcSha => 24,
            CipherSuite::DheRsaAes256CbcSha => 32,
        }
    }

    /// Cipher block size
    pub fn block_len(self) -> usize {
        match self {
            CipherSuite::DheRsa3desEdeCbcSha => 8,
            CipherSuite::DheRsaAes128CbcSha | CipherSuite::DheRsaAes256CbcSha => 16,
        }
    }

    /// MAC key and tag size
    pub fn mac_len(self) -> usize {
        HASH_LEN
    }

    /// CBC IV size
    pub fn iv_len(self) -> usize {
        self.block_len()
    }

    /// Key material drawn from the master secret
    pub fn key_block_len(self) -> usize {
        2 * (self.mac_len() + self.key_len() + self.iv_len())
    }
}

/// First suite in `preferred` that the peer also `offered`
pub fn negotiate(offered: &[u16], preferred: &[CipherSuite]) -> MixResult<CipherSuite> {
    preferred
        .iter()
        .copied()
        .find(|suite| offered.contains(&suite.code()))
        .ok_or_else(|| MixError::Protocol("no supported ciphersuite found".into()))
}

enum BlockCipher {
    TdesEde3(TdesEde3),
    Aes128(Aes128),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(suite: CipherSuite, key: &[u8]) -> MixResult<Self> {
        let invalid = |_| MixError::Crypto(format!("{} needs a {}-byte key", suite.name(), suite.key_len()));
        Ok(match suite {
            CipherSuite::DheRsa3desEdeCbcSha => BlockCipher::TdesEde3(TdesEde3::new_from_slice(key).map_err(invalid)?),
            CipherSuite::DheRsaAes128CbcSha => BlockCipher::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            CipherSuite::DheRsaAes256CbcSha => BlockCipher::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
        })
    }

    /// `block` must be exactly one cipher block
    fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            BlockCipher::TdesEde3(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes128(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes256(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            BlockCipher::TdesEde3(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes256(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

/// Protection state for one direction of a connection
pub struct CipherState {
    suite: CipherSuite,
    cipher: BlockCipher,
    mac_key: Zeroizing<Vec<u8>>,
    iv: Vec<u8>,
    sequence: u64,
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("suite", &self.suite)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl CipherState {
    /// State keyed from one half of a key block
    pub fn new(suite: CipherSuite, key: &[u8], mac_key: &[u8], iv: &[u8]) -> MixResult<Self> {
        if iv.len() != suite.iv_len() {
            return Err(MixError::Crypto(format!("IV must be {} bytes", suite.iv_len())));
        }
        if mac_key.len() != suite.mac_len() {
            return Err(MixError::Crypto(format!("MAC key must be {} bytes", suite.mac_len())));
        }
        Ok(Self {
            suite,
            cipher: BlockCipher::new(suite, key)?,
            mac_key: Zeroizing::new(mac_key.to_vec()),
            iv: iv.to_vec(),
            sequence: 0,
        })
    }

    /// Negotiated suite
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Records processed so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn mac(&self, content_type: ContentType, data: &[u8]) -> Digest20 {
        hmac_sha1(
            &self.mac_key,
            &[
                &self.sequence.to_be_bytes(),
                &[content_type as u8],
                &PROTOCOL_VERSION,
                &(data.len() as u16).to_be_bytes(),
                data,
            ],
        )
    }

    fn cbc_encrypt(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(self.iv.len()) {
            for (b, c) in block.iter_mut().zip(self.iv.iter()) {
                *b ^= c;
            }
            self.cipher.encrypt_block(block);
            self.iv.copy_from_slice(block);
        }
    }

    fn cbc_decrypt(&mut self, data: &mut [u8]) {
        let mut next = vec![0u8; self.iv.len()];
        for block in data.chunks_exact_mut(self.iv.len()) {
            next.copy_from_slice(block);
            self.cipher.decrypt_block(block);
            for (b, c) in block.iter_mut().zip(self.iv.iter()) {
                *b ^= c;
            }
            std::mem::swap(&mut self.iv, &mut next);
        }
    }

    /// MAC, pad and encrypt one record body
    pub fn seal(&mut self, content_type: ContentType, plaintext: &[u8]) -> MixResult<Vec<u8>> {
        let block_len = self.suite.block_len();
        let mac = self.mac(content_type, plaintext);

        let unpadded = plaintext.len() + mac.len() + 1;
        let minimum = (block_len - unpadded % block_len) % block_len;
        let [extra] = random_bytes::<1>()?;
        let pad_len = minimum + (extra % (MAX_EXTRA_PAD_BLOCKS + 1)) as usize * block_len;

        let mut data = Vec::with_capacity(unpadded + pad_len);
        data.extend_from_slice(plaintext);
        data.extend_from_slice(&mac);
        data.resize(unpadded + pad_len, pad_len as u8);

        self.cbc_encrypt(&mut data);
        self.sequence += 1;
        Ok(data)
    }

    /// Decrypt and verify one record body.
    ///
    /// Padding and MAC failures are indistinguishable: the MAC is computed
    /// whatever the padding looks like and both checks are folded into one
    /// result.
    pub fn open(&mut self, content_type: ContentType, ciphertext: &[u8]) -> MixResult<Vec<u8>> {
        let mac_len = self.suite.mac_len();
        if ciphertext.len() % self.suite.block_len() != 0 || ciphertext.len() < mac_len + 1 {
            return Err(MixError::BadRecordMac);
        }

        let mut data = ciphertext.to_vec();
        self.cbc_decrypt(&mut data);

        let len = data.len();
        let claimed = data[len - 1];
        // bytes available for padding between the MAC and the length byte
        let room = len - 1 - mac_len;
        let mut padding_ok = !(room as u64).ct_lt(&(claimed as u64));
        for i in 0..room.min(u8::MAX as usize) {
            let in_padding: Choice = (i as u8).ct_lt(&claimed);
            padding_ok &= !in_padding | data[len - 2 - i].ct_eq(&claimed);
        }
        let pad_len = u8::conditional_select(&0, &claimed, padding_ok) as usize;

        let body_len = room - pad_len;
        let expected = self.mac(content_type, &data[..body_len]);
        let mac_ok = expected[..].ct_eq(&data[body_len..body_len + mac_len]);
        if !bool::from(padding_ok & mac_ok) {
            return Err(MixError::BadRecordMac);
        }

        self.sequence += 1;
        data.truncate(body_len);
        Ok(data)
    }
}
