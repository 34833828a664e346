//! Relay Descriptors
//!
//! One `[Server]` record of the directory text describes one relay: its
//! names, keys and address, and which delivery methods it offers as an exit.
//!
//! # Record Format
//!
//! ```text
//! [Server]
//! Descriptor-Version: 0.2
//! Nickname: <name>
//! Identity: <base64 PKCS#1 key>
//! Digest: <base64>
//! Signature: <base64>
//! Published: <yyyy-MM-dd HH:mm:ss>
//! Packet-Key: <base64 PKCS#1 key>
//! Software: <version>
//! [Incoming/MMTP]
//! Hostname: <host>
//! Port: <port>
//! Key-Digest: <base64>
//! [Delivery/SMTP]            (exit relays)
//! [Delivery/Fragmented]      (reassembling relays)
//! [Testing]
//! ```
//!
//! Fields are read in this order; unknown lines between them are skipped.
//! A record that ends before all of them were found is rejected whole.

use base64::{engine::general_purpose::STANDARD, Engine};
use libmix_crypto::{PublicKey, HASH_LEN};

use crate::routing::{HostRoute, RoutingInformation};
use crate::{MixError, MixResult};

/// Marker opening a record
pub const SERVER_MARKER: &str = "[Server]";

const INCOMING_MARKER: &str = "[Incoming/MMTP]";
const TESTING_MARKER: &str = "[Testing]";
const SMTP_MARKER: &str = "[Delivery/SMTP]";
const MBOX_MARKER: &str = "[Delivery/MBOX]";
const FRAGMENTED_MARKER: &str = "[Delivery/Fragmented";

/// Parsed relay descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDescriptor {
    nickname: String,
    host: String,
    port: u16,
    identity_key: PublicKey,
    packet_key: Option<PublicKey>,
    digest: Vec<u8>,
    signature: Vec<u8>,
    key_digest: [u8; HASH_LEN],
    is_exit: bool,
    allows_mbox: bool,
    allows_fragmented: bool,
    software: String,
    published: String,
}

impl RoutingDescriptor {
    /// Descriptor for a relay known out of band
    pub fn new(
        nickname: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        identity_key: PublicKey,
        packet_key: Option<PublicKey>,
    ) -> MixResult<Self> {
        let key_digest = identity_key.key_digest()?;
        Ok(Self {
            nickname: nickname.into(),
            host: host.into(),
            port,
            identity_key,
            packet_key,
            digest: Vec::new(),
            signature: Vec::new(),
            key_digest,
            is_exit: false,
            allows_mbox: false,
            allows_fragmented: false,
            software: format!("remailer {}", env!("CARGO_PKG_VERSION")),
            published: "1970-01-01".into(),
        })
    }

    /// Mark as SMTP exit
    pub fn with_exit(mut self, is_exit: bool) -> Self {
        self.is_exit = is_exit;
        self
    }

    /// Mark as accepting fragmented messages
    pub fn with_fragmented(mut self, allows_fragmented: bool) -> Self {
        self.allows_fragmented = allows_fragmented;
        self
    }

    /// Parse the first record in `text`
    pub fn parse(text: &str) -> MixResult<Self> {
        let lines: Vec<&str> = text.lines().collect();
        let start = lines
            .iter()
            .position(|l| l.trim() == SERVER_MARKER)
            .ok_or_else(|| MixError::InvalidDescriptor("no [Server] record".into()))?;
        Self::parse_record(&lines, start).map(|(desc, _)| desc)
    }

    /// Parse the record opening at `lines[start]`.
    ///
    /// Returns the descriptor and the index of the first line after it.
    pub(crate) fn parse_record(lines: &[&str], start: usize) -> MixResult<(Self, usize)> {
        let mut reader = RecordReader { lines, pos: start + 1 };

        let nickname = reader.field("Nickname")?;
        let identity = reader.base64_field("Identity")?;
        let digest = reader.base64_field("Digest")?;
        let signature = reader.base64_field("Signature")?;
        let published = parse_published(&reader.field("Published")?)?;
        let packet_key = reader.base64_field("Packet-Key")?;
        let software = reader.field("Software")?;

        reader.section(INCOMING_MARKER)?;
        let host = reader.field("Hostname")?;
        let port = reader
            .field("Port")?
            .parse::<u16>()
            .map_err(|_| MixError::InvalidDescriptor(format!("{}: bad port", nickname)))?;
        let key_digest_bytes = reader.base64_field("Key-Digest")?;
        let key_digest: [u8; HASH_LEN] = key_digest_bytes
            .as_slice()
            .try_into()
            .map_err(|_| MixError::InvalidDescriptor(format!("{}: bad key digest", nickname)))?;

        let (is_exit, allows_mbox, allows_fragmented) = reader.capabilities()?;

        let identity_key = PublicKey::from_pkcs1_der(&identity)
            .map_err(|e| MixError::InvalidDescriptor(format!("{}: identity key: {}", nickname, e)))?;
        let packet_key = PublicKey::from_pkcs1_der(&packet_key)
            .map_err(|e| MixError::InvalidDescriptor(format!("{}: packet key: {}", nickname, e)))?;

        let desc = Self {
            nickname,
            host,
            port,
            identity_key,
            packet_key: Some(packet_key),
            digest,
            signature,
            key_digest,
            is_exit,
            allows_mbox,
            allows_fragmented,
            software,
            published,
        };
        Ok((desc, reader.pos))
    }

    /// Render as a directory record
    pub fn to_text(&self) -> MixResult<String> {
        let mut out = String::new();
        out.push_str("[Server]\n");
        out.push_str("Descriptor-Version: 0.2\n");
        out.push_str(&format!("Nickname: {}\n", self.nickname));
        out.push_str(&format!("Identity: {}\n", STANDARD.encode(self.identity_key.to_pkcs1_der()?)));
        out.push_str(&format!("Digest: {}\n", STANDARD.encode(&self.digest)));
        out.push_str(&format!("Signature: {}\n", STANDARD.encode(&self.signature)));
        out.push_str(&format!("Published: {} 00:00:00\n", self.published));
        out.push_str(&format!("Valid-After: {}\n", self.published));
        if let Some(key) = &self.packet_key {
            out.push_str(&format!("Packet-Key: {}\n", STANDARD.encode(key.to_pkcs1_der()?)));
        }
        out.push_str("Packet-Versions: 0.3\n");
        out.push_str(&format!("Software: {}\n", self.software));
        out.push_str("[Incoming/MMTP]\n");
        out.push_str("Version: 0.1\n");
        out.push_str(&format!("Hostname: {}\n", self.host));
        out.push_str(&format!("Port: {}\n", self.port));
        out.push_str(&format!("Key-Digest: {}\n", STANDARD.encode(self.key_digest)));
        out.push_str("Protocols: 0.3\n");
        out.push_str("[Outgoing/MMTP]\n");
        out.push_str("Version: 0.1\n");
        if self.is_exit {
            out.push_str("[Delivery/SMTP]\nVersion: 0.1\n");
        }
        if self.allows_mbox {
            out.push_str("[Delivery/MBOX]\nVersion: 0.1\n");
        }
        if self.allows_fragmented {
            out.push_str("[Delivery/Fragmented]\nVersion: 0.1\nMaximum-Fragments: 16\n");
        }
        out.push_str("[Testing]\n");
        out.push_str("Platform: remailer\n");
        Ok(out)
    }

    /// Forwarding instruction pointing at this relay
    pub fn routing_information(&self) -> RoutingInformation {
        RoutingInformation::ForwardToHost(self.host_route())
    }

    /// Address of this relay inside a routing body
    pub fn host_route(&self) -> HostRoute {
        HostRoute {
            port: self.port,
            key_digest: self.key_digest,
            host: self.host.clone(),
        }
    }

    /// Relay nickname
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Hostname
    pub fn host(&self) -> &str {
        &self.host
    }

    /// MMTP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Identity key
    pub fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    /// Packet key, if known
    pub fn packet_key(&self) -> Option<&PublicKey> {
        self.packet_key.as_ref()
    }

    /// Descriptor digest
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Descriptor signature
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Identity key digest
    pub fn key_digest(&self) -> &[u8; HASH_LEN] {
        &self.key_digest
    }

    /// Delivers by SMTP
    pub fn is_exit(&self) -> bool {
        self.is_exit
    }

    /// Delivers to local mailboxes
    pub fn allows_mbox(&self) -> bool {
        self.allows_mbox
    }

    /// Reassembles fragmented messages
    pub fn allows_fragmented(&self) -> bool {
        self.allows_fragmented
    }

    /// Software version string
    pub fn software(&self) -> &str {
        &self.software
    }

    /// Publication date (`yyyy-MM-dd`)
    pub fn published(&self) -> &str {
        &self.published
    }
}

struct RecordReader<'a> {
    lines: &'a [&'a str],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    /// Scan forward to `key: value` inside the current section
    fn field(&mut self, key: &str) -> MixResult<String> {
        while let Some(line) = self.lines.get(self.pos) {
            let line = line.trim();
            if line.starts_with('[') {
                break;
            }
            self.pos += 1;
            if let Some(value) = line.strip_prefix(key).and_then(|r| r.strip_prefix(':')) {
                return Ok(value.trim().to_string());
            }
        }
        Err(MixError::InvalidDescriptor(format!("missing {}", key)))
    }

    fn base64_field(&mut self, key: &str) -> MixResult<Vec<u8>> {
        let value = self.field(key)?;
        STANDARD
            .decode(value.as_bytes())
            .map_err(|e| MixError::InvalidDescriptor(format!("{}: {}", key, e)))
    }

    /// Scan forward to a section marker without leaving the record
    fn section(&mut self, marker: &str) -> MixResult<()> {
        while let Some(line) = self.lines.get(self.pos) {
            let line = line.trim();
            if line == SERVER_MARKER {
                break;
            }
            self.pos += 1;
            if line.starts_with(marker) {
                return Ok(());
            }
        }
        Err(MixError::InvalidDescriptor(format!("missing {}", marker)))
    }

    /// Delivery markers up to `[Testing]`: (smtp, mbox, fragmented)
    fn capabilities(&mut self) -> MixResult<(bool, bool, bool)> {
        let (mut smtp, mut mbox, mut fragmented) = (false, false, false);
        while let Some(line) = self.lines.get(self.pos) {
            let line = line.trim();
            if line == SERVER_MARKER {
                break;
            }
            self.pos += 1;
            if line.starts_with(TESTING_MARKER) {
                return Ok((smtp, mbox, fragmented));
            }
            smtp |= line.starts_with(SMTP_MARKER);
            mbox |= line.starts_with(MBOX_MARKER);
            fragmented |= line.starts_with(FRAGMENTED_MARKER);
        }
        Err(MixError::InvalidDescriptor(format!("missing {}", TESTING_MARKER)))
    }
}

/// Keep the date part of a `Published` value
fn parse_published(value: &str) -> MixResult<String> {
    let date = value.get(..10).unwrap_or(value);
    let bytes = date.as_bytes();
    let well_formed = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !well_formed {
        return Err(MixError::InvalidDescriptor(format!("bad Published date: {}", value)));
    }

    let month: u32 = date[5..7].parse().unwrap_or(0);
    let day: u32 = date[8..10].parse().unwrap_or(0);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(MixError::InvalidDescriptor(format!("bad Published date: {}", value)));
    }
    Ok(date.to_string())
}
