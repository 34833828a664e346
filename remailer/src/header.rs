//! Onion Headers
//!
//! A header is 2048 bytes and carries one sub-header per hop. Each hop can
//! open only its own layer: the first 256 bytes are RSA-OAEP sealed to the
//! hop's packet key, the rest is encrypted with a key derived from the hop's
//! secret.
//!
//! # Sub-header
//!
//! ```text
//! version(2) = 0x00 0x03
//! secret(16)
//! digest(20)          SHA-1 of the encrypted rest plus the junk seen so far
//! routing length(2)
//! routing type(2)
//! routing body(len)
//! ```
//!
//! # Junk
//!
//! Every hop pads the header back to 2048 bytes with keystream junk after
//! removing its sub-header. The builder precomputes that junk so each digest
//! covers exactly the bytes the hop will see.

use libmix_crypto::{
    create_prng, digest_eq, encrypt, hash, hash_concat, random_vec, sub_key, PrivateKey,
    HASH_LEN, PK_ENC_LEN, PK_MAX_DATA, PK_OVERHEAD,
};
use tracing::trace;
use zeroize::Zeroize;

use crate::descriptor::RoutingDescriptor;
use crate::routing::Routing;
use crate::{MixError, MixResult, HEADER_LEN, MAX_HOPS, SECRET_LEN};

/// Major/minor version bytes of the sub-header format
pub const SUBHEADER_VERSION: [u8; 2] = [0x00, 0x03];

/// Sub-header length without routing body
pub const MIN_SUBHEADER_LEN: usize = 2 + SECRET_LEN + HASH_LEN + 2 + 2;

/// Longest routing body that fits the sealed part
pub const MAX_ROUTING_LEN: usize = PK_MAX_DATA - MIN_SUBHEADER_LEN;

const HEADER_KEY_LABEL: &str = "HEADER SECRET KEY";
const JUNK_KEY_LABEL: &str = "RANDOM JUNK";

/// One 2048-byte onion header
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Header({}..)", hex::encode(&self.bytes[..8]))
    }
}

impl Header {
    /// Wrap exactly 2048 bytes
    pub fn from_bytes(bytes: &[u8]) -> MixResult<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(MixError::InvalidHeader(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        Ok(Self { bytes: bytes.to_vec() })
    }

    /// Random bytes in the shape of a header
    pub fn random() -> MixResult<Self> {
        Ok(Self { bytes: random_vec(HEADER_LEN)? })
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for Header {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Decoded sub-header
#[derive(Debug, Clone)]
pub struct SubHeader {
    /// Hop master secret
    pub secret: [u8; SECRET_LEN],
    /// Digest of the encrypted rest
    pub digest: [u8; HASH_LEN],
    /// Routing type code
    pub routing_type: u16,
    /// Routing body
    pub routing_content: Vec<u8>,
}

impl Drop for SubHeader {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl SubHeader {
    fn new(secret: &[u8; SECRET_LEN], digest: [u8; HASH_LEN], routing: &Routing) -> Self {
        Self {
            secret: *secret,
            digest,
            routing_type: routing.routing_type() as u16,
            routing_content: routing.content(),
        }
    }

    /// Encoded length
    pub fn encoded_len(&self) -> usize {
        MIN_SUBHEADER_LEN + self.routing_content.len()
    }

    /// Serialize
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&SUBHEADER_VERSION);
        out.extend_from_slice(&self.secret);
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&(self.routing_content.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.routing_type.to_be_bytes());
        out.extend_from_slice(&self.routing_content);
        out
    }

    /// Parse from the start of a decrypted RSA part
    pub fn decode(data: &[u8]) -> MixResult<Self> {
        if data.len() < MIN_SUBHEADER_LEN {
            return Err(MixError::InvalidHeader("sub-header truncated".into()));
        }
        if data[..2] != SUBHEADER_VERSION {
            return Err(MixError::InvalidHeader(format!(
                "unsupported sub-header version {}.{}",
                data[0], data[1]
            )));
        }
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(&data[2..2 + SECRET_LEN]);
        let mut digest = [0u8; HASH_LEN];
        digest.copy_from_slice(&data[18..18 + HASH_LEN]);
        let routing_len = u16::from_be_bytes([data[38], data[39]]) as usize;
        let routing_type = u16::from_be_bytes([data[40], data[41]]);
        let end = MIN_SUBHEADER_LEN + routing_len;
        if end > data.len() {
            secret.zeroize();
            return Err(MixError::InvalidHeader(format!(
                "routing length {} exceeds sub-header",
                routing_len
            )));
        }
        Ok(Self {
            secret,
            digest,
            routing_type,
            routing_content: data[MIN_SUBHEADER_LEN..end].to_vec(),
        })
    }

    /// Decode the routing instruction
    pub fn routing(&self) -> MixResult<Routing> {
        Routing::decode(self.routing_type, &self.routing_content)
    }
}

/// Builds a header for one leg of a path
#[derive(Debug)]
pub struct HeaderBuilder<'a> {
    path: &'a [RoutingDescriptor],
    secrets: &'a [[u8; SECRET_LEN]],
    terminal: Routing,
}

impl<'a> HeaderBuilder<'a> {
    /// `secrets[i]` is shared with `path[i]`; `terminal` is what the last
    /// hop is told to do
    pub fn new(
        path: &'a [RoutingDescriptor],
        secrets: &'a [[u8; SECRET_LEN]],
        terminal: impl Into<Routing>,
    ) -> Self {
        Self { path, secrets, terminal: terminal.into() }
    }

    /// Routing instruction for each hop
    fn routings(&self) -> Vec<Routing> {
        let mut routings: Vec<Routing> = self.path[1..]
            .iter()
            .map(|d| Routing::Hop(d.routing_information()))
            .collect();
        routings.push(self.terminal.clone());
        routings
    }

    /// Check the path before building anything
    fn validate(&self) -> MixResult<()> {
        if self.path.is_empty() {
            return Err(MixError::EmptyPath);
        }
        if self.path.len() > MAX_HOPS {
            return Err(MixError::PathTooLong(self.path.len(), MAX_HOPS));
        }
        if self.path.len() != self.secrets.len() {
            return Err(MixError::SecretCountMismatch {
                path: self.path.len(),
                secrets: self.secrets.len(),
            });
        }
        if let Some(desc) = self.path.iter().find(|d| d.packet_key().is_none()) {
            return Err(MixError::MissingPacketKey(desc.nickname().to_string()));
        }
        Ok(())
    }

    /// Build the 2048-byte header
    pub fn build(&self) -> MixResult<Header> {
        self.validate()?;
        let hops = self.path.len();
        let routings = self.routings();

        let mut sizes = Vec::with_capacity(hops);
        for routing in &routings {
            let len = routing.content().len();
            if len > MAX_ROUTING_LEN {
                return Err(MixError::RoutingTooLong(len, MAX_ROUTING_LEN));
            }
            sizes.push(MIN_SUBHEADER_LEN + len + PK_OVERHEAD);
        }
        let total: usize = sizes.iter().sum();
        let before_last = total - sizes[hops - 1];
        if total > HEADER_LEN || HEADER_LEN - before_last < PK_ENC_LEN {
            return Err(MixError::HeaderOverflow(total, HEADER_LEN));
        }

        let header_keys: Vec<[u8; 16]> = self
            .secrets
            .iter()
            .map(|s| sub_key(s, HEADER_KEY_LABEL))
            .collect();

        // junk_seen[i] is what hop i+1 sees appended after hop i's processing
        let mut junk_seen: Vec<Vec<u8>> = Vec::with_capacity(hops + 1);
        junk_seen.push(Vec::new());
        for i in 0..hops {
            let last = &junk_seen[i];
            let mut junk = last.clone();
            junk.extend(create_prng(&sub_key(&self.secrets[i], JUNK_KEY_LABEL), sizes[i]));
            let stream = create_prng(&header_keys[i], HEADER_LEN + sizes[i]);
            let offset = HEADER_LEN - PK_ENC_LEN - last.len();
            for (j, b) in junk.iter_mut().enumerate() {
                *b ^= stream[offset + j];
            }
            junk_seen.push(junk);
        }

        let mut next = random_vec(HEADER_LEN - total)?;
        for i in (0..hops).rev() {
            let routing = &routings[i];
            let sh0 = SubHeader::new(&self.secrets[i], [0u8; HASH_LEN], routing);
            let sh_len = sh0.encoded_len();

            let mut h0 = sh0.encode();
            h0.extend_from_slice(&next);

            let erest = encrypt(&header_keys[i], &h0[PK_MAX_DATA..]);
            let digest = hash_concat(&[&erest, &junk_seen[i]]);

            let sh = SubHeader::new(&self.secrets[i], digest, routing);
            let mut rsa_part = sh.encode();
            rsa_part.extend_from_slice(&h0[sh_len..PK_MAX_DATA]);

            let packet_key = self.path[i]
                .packet_key()
                .ok_or_else(|| MixError::MissingPacketKey(self.path[i].nickname().to_string()))?;
            let mut layer = packet_key.oaep_encrypt(&rsa_part)?;
            layer.extend_from_slice(&erest);
            rsa_part.zeroize();
            h0.zeroize();

            trace!(hop = i, nickname = self.path[i].nickname(), len = layer.len(), "sealed header layer");
            next = layer;
        }

        debug_assert_eq!(next.len(), HEADER_LEN);
        Header::from_bytes(&next)
    }
}

/// Result of peeling one header layer
#[derive(Debug)]
pub struct ProcessedHeader {
    /// Sub-header addressed to this hop
    pub sub_header: SubHeader,
    /// Decoded routing instruction
    pub routing: Routing,
    /// Header for the next hop
    pub next: Header,
}

/// Peels header layers with a relay's packet key
pub struct HeaderProcessor<'a> {
    packet_key: &'a PrivateKey,
}

impl<'a> HeaderProcessor<'a> {
    /// Processor for the relay owning `packet_key`
    pub fn new(packet_key: &'a PrivateKey) -> Self {
        Self { packet_key }
    }

    /// Open this hop's sub-header, verify the digest and shift in junk
    pub fn process(&self, header: &Header) -> MixResult<ProcessedHeader> {
        let bytes = header.as_bytes();
        let rsa_part = self.packet_key.oaep_decrypt(&bytes[..PK_ENC_LEN])?;
        let sub_header = SubHeader::decode(&rsa_part)?;
        let sh_len = sub_header.encoded_len();

        let rest = &bytes[PK_ENC_LEN..];
        if !digest_eq(&hash(rest), &sub_header.digest) {
            return Err(MixError::InvalidHeader("digest mismatch".into()));
        }

        let header_key = sub_key(&sub_header.secret, HEADER_KEY_LABEL);
        let junk_key = sub_key(&sub_header.secret, JUNK_KEY_LABEL);

        let mut tail = rest.to_vec();
        tail.extend(create_prng(&junk_key, sh_len + PK_OVERHEAD));
        let tail = encrypt(&header_key, &tail);

        let mut next = rsa_part[sh_len..].to_vec();
        next.extend_from_slice(&tail);

        let routing = sub_header.routing()?;
        Ok(ProcessedHeader {
            next: Header::from_bytes(&next)?,
            routing,
            sub_header,
        })
    }
}
