//! Payload Encoding
//!
//! The 28672-byte payload of a packet is either a singleton, carrying the
//! whole compressed message, or one fragment of a longer message.
//!
//! ```text
//! singleton: size(2) | hash(rest)(20) | compressed data | random padding
//! fragment:  flag(3) | hash(id | size | body)(20) | id(20) | size(4) | body
//! ```
//!
//! The two are told apart by which hash matches.

use libmix_crypto::{decompress, digest_eq, fill_random, hash, HASH_LEN};

use crate::fragment::FragmentPacket;
use crate::{MixError, MixResult, PAYLOAD_LEN};

/// Singleton header: size and hash
pub const SINGLETON_HEADER_LEN: usize = 2 + HASH_LEN;

/// Fragment header: flag, hash, message id and size
pub const FRAGMENT_HEADER_LEN: usize = 3 + HASH_LEN + HASH_LEN + 4;

/// Largest compressed message a singleton holds
pub const MAX_SINGLETON_DATA: usize = PAYLOAD_LEN - SINGLETON_HEADER_LEN;

/// Upper bound on a decompressed message
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Kind of a decrypted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Whole message in one packet
    Singleton,
    /// One share of a fragmented message
    Fragment,
}

/// Decrypted payload contents
#[derive(Debug, Clone)]
pub enum DecodedPayload {
    /// Decompressed message
    Singleton(Vec<u8>),
    /// Fragment to hand to a [`crate::FragmentPool`]
    Fragment(FragmentPacket),
}

/// Whether `compressed_len` bytes fit a singleton
pub fn fits_singleton(compressed_len: usize) -> bool {
    compressed_len + SINGLETON_HEADER_LEN <= PAYLOAD_LEN
}

/// Wrap compressed data as a singleton payload
pub fn encode_singleton(compressed: &[u8]) -> MixResult<Vec<u8>> {
    if !fits_singleton(compressed.len()) {
        return Err(MixError::InvalidPayload(format!(
            "{} bytes do not fit a singleton (max {})",
            compressed.len(),
            MAX_SINGLETON_DATA
        )));
    }

    let mut payload = vec![0u8; PAYLOAD_LEN];
    payload[..2].copy_from_slice(&(compressed.len() as u16).to_be_bytes());
    let data_end = SINGLETON_HEADER_LEN + compressed.len();
    payload[SINGLETON_HEADER_LEN..data_end].copy_from_slice(compressed);
    fill_random(&mut payload[data_end..])?;

    let digest = hash(&payload[SINGLETON_HEADER_LEN..]);
    payload[2..SINGLETON_HEADER_LEN].copy_from_slice(&digest);
    Ok(payload)
}

/// Recognise a decrypted payload by its hash
pub fn classify(payload: &[u8]) -> Option<PayloadKind> {
    if payload.len() < FRAGMENT_HEADER_LEN {
        return None;
    }
    if digest_eq(&hash(&payload[SINGLETON_HEADER_LEN..]), &payload[2..SINGLETON_HEADER_LEN]) {
        return Some(PayloadKind::Singleton);
    }
    if digest_eq(&hash(&payload[3 + HASH_LEN..]), &payload[3..3 + HASH_LEN]) {
        return Some(PayloadKind::Fragment);
    }
    None
}

/// Decode a payload that [`classify`] recognised
pub fn decode_payload(payload: &[u8]) -> MixResult<DecodedPayload> {
    match classify(payload) {
        Some(PayloadKind::Singleton) => {
            let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
            let data = payload
                .get(SINGLETON_HEADER_LEN..SINGLETON_HEADER_LEN + len)
                .ok_or_else(|| MixError::InvalidPayload(format!("singleton size {} too large", len)))?;
            Ok(DecodedPayload::Singleton(decompress(data, MAX_MESSAGE_SIZE)?))
        }
        Some(PayloadKind::Fragment) => Ok(DecodedPayload::Fragment(FragmentPacket::parse(payload)?)),
        None => Err(MixError::InvalidPayload("payload hash does not verify".into())),
    }
}
