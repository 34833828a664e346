//! Reply Blocks
//!
//! A reply block is a pre-built header for the path back to its owner. The
//! owner never stores per-block state: the decoding handle (seed) is chosen
//! so that `hash(seed | user secret | "Validate")` ends in a zero byte, and
//! every hop secret is re-derived from `hash(seed | user secret | "Generate")`.
//!
//! # Wire Format
//!
//! ```text
//! "SURB" | 0x01 0x00 | expiry(4) | header(2048) | routing len(2) |
//! routing type(2) | shared secret(16) | first hop routing
//! ```
//!
//! Blocks travel as Base64 between `-----BEGIN TYPE III REPLY BLOCK-----`
//! and `-----END TYPE III REPLY BLOCK-----`, possibly inside a message.

use libmix_crypto::{create_prng, hash_concat, HASH_LEN, KEY_LEN};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::armor;
use crate::descriptor::RoutingDescriptor;
use crate::header::{Header, HeaderBuilder};
use crate::routing::{ExitInformation, HostRoute, RoutingInformation, RoutingType, TAG_LEN};
use crate::{unix_now, MixError, MixResult, HEADER_LEN, REPLY_BLOCK_LIFETIME, SECRET_LEN};

/// Armor begin line
pub const BEGIN_MARKER: &str = "-----BEGIN TYPE III REPLY BLOCK-----";

/// Armor end line
pub const END_MARKER: &str = "-----END TYPE III REPLY BLOCK-----";

/// Armor version line
pub const VERSION_LINE: &str = "VERSION: 0.2";

const MAGIC: &[u8; 4] = b"SURB";
const FORMAT_VERSION: [u8; 2] = [0x01, 0x00];

/// Offset of the first hop routing body
const FIXED_LEN: usize = 4 + 2 + 4 + HEADER_LEN + 2 + 2 + SECRET_LEN;

/// Whether `handle` was generated from `user_secret`
pub fn is_own_handle(handle: &[u8; TAG_LEN], user_secret: &[u8]) -> bool {
    hash_concat(&[handle, user_secret, b"Validate"])[HASH_LEN - 1] == 0
}

/// Key expanding into the hop secrets of the block with `handle`
pub fn generation_key(handle: &[u8; TAG_LEN], user_secret: &[u8]) -> [u8; KEY_LEN] {
    let digest = hash_concat(&[handle, user_secret, b"Generate"]);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

/// A single-use return path
#[derive(Clone, PartialEq, Eq)]
pub struct ReplyBlock {
    header: Header,
    shared_secret: [u8; SECRET_LEN],
    routing: RoutingInformation,
    expires: u64,
}

impl std::fmt::Debug for ReplyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyBlock")
            .field("first_hop", &self.routing.route().host)
            .field("expires", &self.expires)
            .finish()
    }
}

impl Drop for ReplyBlock {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl ReplyBlock {
    /// Build a block delivering to `return_address` over `path`
    pub fn build(return_address: &str, path: &[RoutingDescriptor], user_secret: &[u8]) -> MixResult<Self> {
        Self::build_at(return_address, path, user_secret, unix_now())
    }

    /// [`ReplyBlock::build`] with an explicit creation time
    pub fn build_at(
        return_address: &str,
        path: &[RoutingDescriptor],
        user_secret: &[u8],
        now: u64,
    ) -> MixResult<Self> {
        let first = path.first().ok_or(MixError::EmptyPath)?;
        let hops = path.len();

        let mut attempts = 0u32;
        let seed = loop {
            attempts += 1;
            let seed = ExitInformation::random_tag()?;
            if is_own_handle(&seed, user_secret) {
                break seed;
            }
        };

        let mut stream = create_prng(&generation_key(&seed, user_secret), KEY_LEN * (hops + 1));
        let secrets: Vec<[u8; SECRET_LEN]> = (0..hops)
            .map(|p| {
                let start = (hops - 1 - p) * KEY_LEN;
                let mut s = [0u8; SECRET_LEN];
                s.copy_from_slice(&stream[start..start + KEY_LEN]);
                s
            })
            .collect();
        let mut shared_secret = [0u8; SECRET_LEN];
        shared_secret.copy_from_slice(&stream[hops * KEY_LEN..]);
        stream.zeroize();

        let exit = ExitInformation::for_recipients(&[return_address.to_string()], Some(seed))?;
        let header = HeaderBuilder::new(path, &secrets, exit).build();
        for mut s in secrets {
            s.zeroize();
        }

        debug!(hops, attempts, first_hop = first.nickname(), "built reply block");
        Ok(Self {
            header: header?,
            shared_secret,
            routing: RoutingInformation::SwapForwardToHost(first.host_route()),
            expires: now + REPLY_BLOCK_LIFETIME,
        })
    }

    /// Header for the return leg
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// End-to-end secret the sender encrypts the payload with
    pub fn shared_secret(&self) -> &[u8; SECRET_LEN] {
        &self.shared_secret
    }

    /// Swap routing to the first hop of the return leg
    pub fn routing(&self) -> &RoutingInformation {
        &self.routing
    }

    /// Expiry, Unix seconds
    pub fn expires(&self) -> u64 {
        self.expires
    }

    /// Past its expiry at `now`
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires
    }

    /// Binary form
    pub fn to_bytes(&self) -> Vec<u8> {
        let content = self.routing.content();
        let mut out = Vec::with_capacity(FIXED_LEN + content.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION);
        out.extend_from_slice(&(self.expires.min(u32::MAX as u64) as u32).to_be_bytes());
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.routing.routing_type() as u16).to_be_bytes());
        out.extend_from_slice(&self.shared_secret);
        out.extend_from_slice(&content);
        out
    }

    /// Parse the binary form
    pub fn from_bytes(bytes: &[u8]) -> MixResult<Self> {
        if bytes.len() < FIXED_LEN {
            return Err(MixError::InvalidReplyBlock(format!("{} bytes is too short", bytes.len())));
        }
        if &bytes[..4] != MAGIC {
            return Err(MixError::InvalidReplyBlock("bad magic".into()));
        }
        if bytes[4..6] != FORMAT_VERSION {
            return Err(MixError::InvalidReplyBlock(format!(
                "unsupported version {}.{}",
                bytes[4], bytes[5]
            )));
        }

        let expires = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as u64;
        let header = Header::from_bytes(&bytes[10..10 + HEADER_LEN])?;
        let at = 10 + HEADER_LEN;
        let routing_len = u16::from_be_bytes([bytes[at], bytes[at + 1]]) as usize;
        let routing_type = u16::from_be_bytes([bytes[at + 2], bytes[at + 3]]);
        if routing_type != RoutingType::SwapForwardToHost as u16 {
            return Err(MixError::InvalidReplyBlock(format!(
                "first hop routing type {:#06x} is not a swap",
                routing_type
            )));
        }

        let mut shared_secret = [0u8; SECRET_LEN];
        shared_secret.copy_from_slice(&bytes[at + 4..FIXED_LEN]);
        let content = bytes
            .get(FIXED_LEN..FIXED_LEN + routing_len)
            .ok_or_else(|| MixError::InvalidReplyBlock("routing information truncated".into()))?;
        let route = HostRoute::decode(content)
            .map_err(|e| MixError::InvalidReplyBlock(e.to_string()))?;

        Ok(Self {
            header,
            shared_secret,
            routing: RoutingInformation::SwapForwardToHost(route),
            expires,
        })
    }

    /// Armored text for embedding in a message
    pub fn to_armored(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n",
            BEGIN_MARKER,
            VERSION_LINE,
            armor::encode(&self.to_bytes()),
            END_MARKER
        )
    }

    /// All reply blocks in `text`. Quoted blocks are skipped; a malformed
    /// block fails the whole parse.
    pub fn parse_all(text: &str) -> MixResult<Vec<Self>> {
        let lines: Vec<&str> = text.lines().collect();
        let mut blocks = Vec::new();
        let mut pos = 0;

        while pos < lines.len() {
            if !lines[pos].trim_end().ends_with(BEGIN_MARKER) {
                pos += 1;
                continue;
            }
            pos += 1;
            if lines.get(pos).map_or(false, |l| l.starts_with('>')) {
                debug!(line = pos, "skipping quoted reply block");
                continue;
            }
            if lines.get(pos).map_or(false, |l| l.trim().starts_with("VERSION:")) {
                pos += 1;
            }

            let start = pos;
            while pos < lines.len() && !lines[pos].trim_end().ends_with(END_MARKER) {
                pos += 1;
            }
            if pos == lines.len() {
                return Err(MixError::InvalidReplyBlock("missing end marker".into()));
            }
            let bytes = armor::decode(lines[start..pos].iter().copied())
                .map_err(|e| MixError::InvalidReplyBlock(e.to_string()))?;
            blocks.push(Self::from_bytes(&bytes)?);
            pos += 1;
        }
        Ok(blocks)
    }

    /// Usable blocks in `text`: expired ones are dropped with a warning
    pub fn parse_valid(text: &str, now: u64) -> MixResult<Vec<Self>> {
        let (valid, expired): (Vec<Self>, Vec<Self>) =
            Self::parse_all(text)?.into_iter().partition(|b| !b.is_expired(now));
        if !expired.is_empty() {
            warn!(expired = expired.len(), "ignoring expired reply blocks");
        }
        Ok(valid)
    }
}

/// `text` with every armored reply block removed
pub fn remove_reply_blocks(text: &str) -> String {
    let mut out = Vec::new();
    let mut inside = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.ends_with(BEGIN_MARKER) {
            inside = true;
        }
        if !inside {
            out.push(line);
        }
        if trimmed.ends_with(END_MARKER) {
            inside = false;
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderProcessor;
    use crate::routing::Routing;
    use crate::test_keys::relay_key;

    const USER_SECRET: &[u8] = b"0123456789abcdefghij";

    fn path() -> Vec<RoutingDescriptor> {
        (0..2)
            .map(|i| {
                let key = relay_key(i).public_key();
                RoutingDescriptor::new(
                    format!("relay{}", i),
                    format!("mix{}.example.net", i),
                    48099,
                    key.clone(),
                    Some(key),
                )
                .unwrap()
            })
            .collect()
    }

    fn block() -> ReplyBlock {
        ReplyBlock::build_at("me@example.org", &path(), USER_SECRET, 1_000_000).unwrap()
    }

    #[test]
    fn test_build() {
        let block = block();
        assert_eq!(block.header().as_bytes().len(), HEADER_LEN);
        assert_eq!(block.expires(), 1_000_000 + REPLY_BLOCK_LIFETIME);
        assert_eq!(block.routing().routing_type(), RoutingType::SwapForwardToHost);
        assert_eq!(block.routing().route().host, "mix0.example.net");
    }

    #[test]
    fn test_expiry() {
        let block = block();
        assert!(!block.is_expired(1_000_000));
        assert!(!block.is_expired(1_000_000 + REPLY_BLOCK_LIFETIME));
        assert!(block.is_expired(1_000_001 + REPLY_BLOCK_LIFETIME));
    }

    #[test]
    fn test_handle_validates() {
        let block = block();
        // peel the return path to reach the exit handle
        let first = HeaderProcessor::new(&relay_key(0)).process(block.header()).unwrap();
        let last = HeaderProcessor::new(&relay_key(1)).process(&first.next).unwrap();
        let handle = match last.routing {
            Routing::Exit(ExitInformation::Smtp { tag, ref address }) => {
                assert_eq!(address, "me@example.org");
                tag
            }
            ref other => panic!("unexpected {:?}", other),
        };
        assert!(is_own_handle(&handle, USER_SECRET));
        assert_eq!(handle[0] & 0x80, 0);

        let stream = create_prng(&generation_key(&handle, USER_SECRET), KEY_LEN * 3);
        assert_eq!(&stream[32..48], block.shared_secret());
        assert_eq!(&stream[16..32], &first.sub_header.secret);
        assert_eq!(&stream[..16], &last.sub_header.secret);
    }

    #[test]
    fn test_armor_roundtrip_in_text() {
        let block = block();
        let text = format!(
            "Hello,\nplease reply.\n\n:{}\nSignature line\n",
            block.to_armored().trim_end()
        );
        let parsed = ReplyBlock::parse_all(&text).unwrap();
        assert_eq!(parsed, vec![block]);
    }

    #[test]
    fn test_quoted_block_skipped() {
        let quoted: String = block()
            .to_armored()
            .lines()
            .map(|l| format!("> {}\n", l))
            .collect();
        assert!(ReplyBlock::parse_all(&quoted).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_block() {
        let text = format!("{}\n{}\nAAAA\n{}\n", BEGIN_MARKER, VERSION_LINE, END_MARKER);
        assert!(matches!(ReplyBlock::parse_all(&text), Err(MixError::InvalidReplyBlock(_))));

        let unterminated = format!("{}\n{}\nAAAA\n", BEGIN_MARKER, VERSION_LINE);
        assert!(ReplyBlock::parse_all(&unterminated).unwrap_err().is_parse_error());

        let mut bytes = block().to_bytes();
        bytes[0] = b'X';
        assert!(ReplyBlock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_parse_valid_drops_expired() {
        let text = block().to_armored();
        assert_eq!(ReplyBlock::parse_valid(&text, 1_000_000).unwrap().len(), 1);
        assert!(ReplyBlock::parse_valid(&text, u64::from(u32::MAX)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_reply_blocks() {
        let text = format!("before\n{}after", block().to_armored());
        assert_eq!(remove_reply_blocks(&text), "before\nafter");
    }
}
