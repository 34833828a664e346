//! Reply Decoding
//!
//! Exit relays mail payloads they cannot read as an armored "encrypted"
//! message carrying the decoding handle. The reply block owner finds the
//! keyring secret whose validation byte matches the handle, regenerates the
//! hop secrets and re-applies the payload layers one hop at a time until a
//! payload hash verifies. The path length is unknown, so up to
//! [`MAX_PATH_STEPS`] layers are tried.

use libmix_crypto::{create_prng, sprp_encrypt, KEY_LEN};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::armor;
use crate::fragment::{FragmentOutcome, FragmentPool};
use crate::keyring::Keyring;
use crate::payload::{classify, decode_payload, DecodedPayload};
use crate::relay::{layer_key, PAYLOAD_ENCRYPT};
use crate::reply_block::{generation_key, is_own_handle};
use crate::routing::TAG_LEN;
use crate::{MixError, MixResult, PAYLOAD_LEN};

/// Armor begin line
pub const BEGIN_MARKER: &str = "-----BEGIN TYPE III ANONYMOUS MESSAGE-----";

/// Armor end line
pub const END_MARKER: &str = "-----END TYPE III ANONYMOUS MESSAGE-----";

const MESSAGE_TYPE: &str = "Message-type: ";
const DECODING_HANDLE: &str = "Decoding-handle: ";
const ENCRYPTED: &str = "encrypted";

/// Most layers tried per secret
pub const MAX_PATH_STEPS: usize = 20;

/// Result of decoding one reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedReply {
    /// Complete message
    Message(Vec<u8>),
    /// A fragment was stored; more are needed
    FragmentPending,
    /// A fragment that was already seen or is no longer needed
    FragmentIgnored,
}

/// Decodes replies sent to this user's reply blocks
#[derive(Debug)]
pub struct ReplyDecoder {
    keyring: Keyring,
    fragments: FragmentPool,
}

impl ReplyDecoder {
    /// Decoder over the secrets of `keyring`
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring, fragments: FragmentPool::new() }
    }

    /// Secrets tried when decoding
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Mutable access, e.g. to add a secret for new reply blocks
    pub fn keyring_mut(&mut self) -> &mut Keyring {
        &mut self.keyring
    }

    /// Armor an unreadable payload for mailing to its handle's owner
    pub fn armor(handle: &[u8; TAG_LEN], payload: &[u8]) -> String {
        format!(
            "{}\n{}{}\n{}{}\n\n{}\n{}\n",
            BEGIN_MARKER,
            MESSAGE_TYPE,
            ENCRYPTED,
            DECODING_HANDLE,
            armor::encode(handle),
            armor::encode(payload),
            END_MARKER
        )
    }

    /// Handle and payload of the first armored message in `text`
    pub fn parse_armored(text: &str) -> MixResult<([u8; TAG_LEN], Vec<u8>)> {
        let mut lines = text.lines().skip_while(|l| !l.starts_with(BEGIN_MARKER)).skip(1);

        let kind = lines
            .next()
            .and_then(|l| l.strip_prefix(MESSAGE_TYPE))
            .ok_or_else(|| MixError::InvalidPayload("missing message type".into()))?;
        if kind.trim() != ENCRYPTED {
            return Err(MixError::InvalidPayload(format!("unsupported message type {}", kind.trim())));
        }

        let handle_b64 = lines
            .next()
            .and_then(|l| l.strip_prefix(DECODING_HANDLE))
            .ok_or_else(|| MixError::InvalidPayload("missing decoding handle".into()))?;
        let handle_bytes = armor::decode([handle_b64])?;
        let handle: [u8; TAG_LEN] = handle_bytes
            .as_slice()
            .try_into()
            .map_err(|_| MixError::InvalidPayload("decoding handle is not 20 bytes".into()))?;

        let mut body = Vec::new();
        let mut terminated = false;
        for line in lines {
            if line.starts_with(END_MARKER) {
                terminated = true;
                break;
            }
            body.push(line);
        }
        if !terminated {
            return Err(MixError::InvalidPayload("missing end marker".into()));
        }
        let payload = armor::decode(body)?;
        if payload.len() != PAYLOAD_LEN {
            return Err(MixError::InvalidPayload(format!("payload is {} bytes", payload.len())));
        }
        Ok((handle, payload))
    }

    /// Decode an armored reply
    pub fn decode(&self, text: &str) -> MixResult<DecodedReply> {
        let (handle, payload) = Self::parse_armored(text)?;
        self.decode_payload(&handle, &payload)
    }

    /// Decode a payload delivered with `handle`
    pub fn decode_payload(&self, handle: &[u8; TAG_LEN], payload: &[u8]) -> MixResult<DecodedReply> {
        for user_secret in self.keyring.secrets() {
            if !is_own_handle(handle, user_secret.secret()) {
                continue;
            }
            let key = Zeroizing::new(generation_key(handle, user_secret.secret()));
            let stream = Zeroizing::new(create_prng(&key, KEY_LEN * MAX_PATH_STEPS));

            let mut candidate = payload.to_vec();
            for (step, hop_secret) in stream.chunks(KEY_LEN).enumerate() {
                candidate = sprp_encrypt(&layer_key(hop_secret, PAYLOAD_ENCRYPT), &candidate)?;
                if classify(&candidate).is_none() {
                    continue;
                }
                debug!(layers = step + 1, "reply payload recognised");
                return self.finish(&candidate);
            }
        }
        Err(MixError::InvalidPayload("no keyring secret decodes this reply".into()))
    }

    fn finish(&self, payload: &[u8]) -> MixResult<DecodedReply> {
        match decode_payload(payload)? {
            DecodedPayload::Singleton(body) => {
                info!(len = body.len(), "decoded reply");
                Ok(DecodedReply::Message(body))
            }
            DecodedPayload::Fragment(packet) => match self.fragments.accept(&packet)? {
                FragmentOutcome::Complete { body, .. } => {
                    info!(len = body.len(), "reassembled fragmented reply");
                    Ok(DecodedReply::Message(body))
                }
                FragmentOutcome::Stored { .. } => Ok(DecodedReply::FragmentPending),
                FragmentOutcome::Ignored => Ok(DecodedReply::FragmentIgnored),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::encode_singleton;
    use libmix_crypto::{compress, sprp_decrypt};

    const NOW: u64 = 1_700_000_000;

    /// Apply the reply leg as sender and relays would
    fn simulate_reply(block_secrets: &[[u8; KEY_LEN]], shared: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut p = sprp_decrypt(&layer_key(shared, PAYLOAD_ENCRYPT), payload).unwrap();
        for s in block_secrets {
            p = sprp_decrypt(&layer_key(s, PAYLOAD_ENCRYPT), &p).unwrap();
        }
        p
    }

    fn hop_secrets(handle: &[u8; TAG_LEN], user_secret: &[u8], hops: usize) -> (Vec<[u8; KEY_LEN]>, Vec<u8>) {
        let stream = create_prng(&generation_key(handle, user_secret), KEY_LEN * (hops + 1));
        let secrets = (0..hops)
            .map(|p| {
                let start = (hops - 1 - p) * KEY_LEN;
                stream[start..start + KEY_LEN].try_into().unwrap()
            })
            .collect();
        (secrets, stream[hops * KEY_LEN..].to_vec())
    }

    fn own_handle(secret: &[u8]) -> [u8; TAG_LEN] {
        loop {
            let tag = crate::routing::ExitInformation::random_tag().unwrap();
            if is_own_handle(&tag, secret) {
                return tag;
            }
        }
    }

    #[test]
    fn test_decode_reply() {
        let mut keyring = Keyring::new();
        let secret = keyring.new_secret_at(NOW).unwrap();
        let handle = own_handle(&secret);
        let (hops, shared) = hop_secrets(&handle, &secret, 3);

        let message = b"Subject: re: hello\n\nthanks";
        let payload = encode_singleton(&compress(message).unwrap()).unwrap();
        let delivered = simulate_reply(&hops, &shared, &payload);

        let text = format!("Received: from exit\n\n{}", ReplyDecoder::armor(&handle, &delivered));
        let decoder = ReplyDecoder::new(keyring);
        assert_eq!(decoder.decode(&text).unwrap(), DecodedReply::Message(message.to_vec()));
    }

    #[test]
    fn test_foreign_handle() {
        let mut keyring = Keyring::new();
        keyring.new_secret_at(NOW).unwrap();
        let decoder = ReplyDecoder::new(keyring);
        let stranger = own_handle(b"someone else's secret");
        let err = decoder.decode_payload(&stranger, &vec![0u8; PAYLOAD_LEN]).unwrap_err();
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_parse_armored() {
        let handle = [9u8; TAG_LEN];
        let payload = vec![3u8; PAYLOAD_LEN];
        let (h, p) = ReplyDecoder::parse_armored(&ReplyDecoder::armor(&handle, &payload)).unwrap();
        assert_eq!(h, handle);
        assert_eq!(p, payload);

        let plain = format!("{}\nMessage-type: plaintext\n", BEGIN_MARKER);
        assert!(ReplyDecoder::parse_armored(&plain).is_err());

        let cut: String = ReplyDecoder::armor(&handle, &payload).lines().take(6).collect::<Vec<_>>().join("\n");
        assert!(ReplyDecoder::parse_armored(&cut).is_err());
    }
}
