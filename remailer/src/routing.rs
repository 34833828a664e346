//! Routing and Exit Information
//!
//! Every sub-header carries one routing instruction: a 2-byte type code and
//! a variable body. Codes below 0x0100 tell a relay where to forward the
//! packet; codes from 0x0100 up tell the last hop what to do with the
//! payload.
//!
//! # Wire Formats
//!
//! ```text
//! FWD_HOST / SWAP_FWD_HOST:  port(2) | key digest(20) | hostname
//! SMTP:                      tag(20) | address
//! MBOX:                      tag(20) | mailbox
//! DROP:                      tag(20)
//! FRAGMENT:                  (empty)
//! ```

use crate::{MixError, MixResult};
use libmix_crypto::{random_bytes, HASH_LEN};

/// Length of the exit tag / decoding handle
pub const TAG_LEN: usize = HASH_LEN;

/// Routing type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RoutingType {
    /// Discard the payload
    Drop = 0x0000,
    /// Forward to the next relay
    ForwardToHost = 0x0003,
    /// Forward to the next relay after swapping headers
    SwapForwardToHost = 0x0004,
    /// Deliver by SMTP
    Smtp = 0x0100,
    /// Deliver to a local mailbox
    Mbox = 0x0101,
    /// Payload is a fragment for reassembly at the exit
    Fragment = 0x0102,
}

impl TryFrom<u16> for RoutingType {
    type Error = MixError;

    fn try_from(value: u16) -> MixResult<Self> {
        match value {
            0x0000 => Ok(RoutingType::Drop),
            0x0003 => Ok(RoutingType::ForwardToHost),
            0x0004 => Ok(RoutingType::SwapForwardToHost),
            0x0100 => Ok(RoutingType::Smtp),
            0x0101 => Ok(RoutingType::Mbox),
            0x0102 => Ok(RoutingType::Fragment),
            _ => Err(MixError::UnknownRoutingType(value)),
        }
    }
}

impl RoutingType {
    /// Exit types end a path
    pub fn is_exit(&self) -> bool {
        (*self as u16) >= 0x0100 || *self == RoutingType::Drop
    }
}

/// Address of the next relay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostRoute {
    /// MMTP port
    pub port: u16,
    /// SHA-1 of the relay's identity key
    pub key_digest: [u8; HASH_LEN],
    /// Hostname or address
    pub host: String,
}

impl HostRoute {
    /// Encode as `port | key digest | host`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + HASH_LEN + self.host.len());
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.key_digest);
        out.extend_from_slice(self.host.as_bytes());
        out
    }

    /// Decode a routing body
    pub fn decode(data: &[u8]) -> MixResult<Self> {
        if data.len() < 2 + HASH_LEN + 1 {
            return Err(MixError::InvalidHeader(format!(
                "host route of {} bytes too short",
                data.len()
            )));
        }
        let port = u16::from_be_bytes([data[0], data[1]]);
        let mut key_digest = [0u8; HASH_LEN];
        key_digest.copy_from_slice(&data[2..2 + HASH_LEN]);
        let host = String::from_utf8(data[2 + HASH_LEN..].to_vec())
            .map_err(|_| MixError::InvalidHeader("host route is not UTF-8".into()))?;
        Ok(Self { port, key_digest, host })
    }
}

/// Instruction for an intermediate hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingInformation {
    /// Forward with headers unchanged
    ForwardToHost(HostRoute),
    /// Forward after swapping in the second header
    SwapForwardToHost(HostRoute),
}

impl RoutingInformation {
    /// Wire type code
    pub fn routing_type(&self) -> RoutingType {
        match self {
            RoutingInformation::ForwardToHost(_) => RoutingType::ForwardToHost,
            RoutingInformation::SwapForwardToHost(_) => RoutingType::SwapForwardToHost,
        }
    }

    /// Next relay
    pub fn route(&self) -> &HostRoute {
        match self {
            RoutingInformation::ForwardToHost(r) | RoutingInformation::SwapForwardToHost(r) => r,
        }
    }

    /// Routing body
    pub fn content(&self) -> Vec<u8> {
        self.route().encode()
    }

    /// Same route, swap variant
    pub fn into_swap(self) -> Self {
        match self {
            RoutingInformation::ForwardToHost(r) => RoutingInformation::SwapForwardToHost(r),
            swap => swap,
        }
    }
}

/// Instruction for the last hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitInformation {
    /// Discard the payload
    Drop {
        /// Random tag
        tag: [u8; TAG_LEN],
    },
    /// Deliver by SMTP
    Smtp {
        /// Random tag or decoding handle
        tag: [u8; TAG_LEN],
        /// Recipient address
        address: String,
    },
    /// Deliver to a local mailbox
    Mbox {
        /// Random tag or decoding handle
        tag: [u8; TAG_LEN],
        /// Mailbox name
        mailbox: String,
    },
    /// Payload is a fragment
    Fragmented,
}

impl ExitInformation {
    /// Random tag with the top bit cleared
    pub fn random_tag() -> MixResult<[u8; TAG_LEN]> {
        let mut tag = random_bytes::<TAG_LEN>()?;
        tag[0] &= 0x7F;
        Ok(tag)
    }

    /// Exit for a recipient list: SMTP to the first address, or drop when
    /// the list is empty. `handle` replaces the random tag for reply blocks.
    pub fn for_recipients(recipients: &[String], handle: Option<[u8; TAG_LEN]>) -> MixResult<Self> {
        let tag = match handle {
            Some(h) => h,
            None => Self::random_tag()?,
        };
        match recipients.first() {
            None => {
                tracing::warn!("no recipients; packet will be dropped at the exit");
                Ok(ExitInformation::Drop { tag })
            }
            Some(address) => {
                if recipients.len() > 1 {
                    tracing::warn!(
                        dropped = recipients.len() - 1,
                        "only the first recipient is delivered"
                    );
                }
                if address.is_empty() || !address.contains('@') {
                    return Err(MixError::InvalidRecipient(address.clone()));
                }
                Ok(ExitInformation::Smtp { tag, address: address.clone() })
            }
        }
    }

    /// Wire type code
    pub fn routing_type(&self) -> RoutingType {
        match self {
            ExitInformation::Drop { .. } => RoutingType::Drop,
            ExitInformation::Smtp { .. } => RoutingType::Smtp,
            ExitInformation::Mbox { .. } => RoutingType::Mbox,
            ExitInformation::Fragmented => RoutingType::Fragment,
        }
    }

    /// Tag carried by the exit, if any
    pub fn tag(&self) -> Option<&[u8; TAG_LEN]> {
        match self {
            ExitInformation::Drop { tag }
            | ExitInformation::Smtp { tag, .. }
            | ExitInformation::Mbox { tag, .. } => Some(tag),
            ExitInformation::Fragmented => None,
        }
    }

    /// Routing body
    pub fn content(&self) -> Vec<u8> {
        match self {
            ExitInformation::Drop { tag } => tag.to_vec(),
            ExitInformation::Smtp { tag, address } => [&tag[..], address.as_bytes()].concat(),
            ExitInformation::Mbox { tag, mailbox } => [&tag[..], mailbox.as_bytes()].concat(),
            ExitInformation::Fragmented => Vec::new(),
        }
    }

    fn split_tag(content: &[u8]) -> MixResult<([u8; TAG_LEN], &[u8])> {
        if content.len() < TAG_LEN {
            return Err(MixError::InvalidHeader("exit information shorter than tag".into()));
        }
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&content[..TAG_LEN]);
        Ok((tag, &content[TAG_LEN..]))
    }

    fn text(bytes: &[u8]) -> MixResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| MixError::InvalidHeader("exit address is not UTF-8".into()))
    }
}

/// Any routing instruction a sub-header can hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Forward to another relay
    Hop(RoutingInformation),
    /// Final delivery
    Exit(ExitInformation),
}

impl Routing {
    /// Wire type code
    pub fn routing_type(&self) -> RoutingType {
        match self {
            Routing::Hop(r) => r.routing_type(),
            Routing::Exit(e) => e.routing_type(),
        }
    }

    /// Routing body
    pub fn content(&self) -> Vec<u8> {
        match self {
            Routing::Hop(r) => r.content(),
            Routing::Exit(e) => e.content(),
        }
    }

    /// Decode a type code and body
    pub fn decode(code: u16, content: &[u8]) -> MixResult<Self> {
        let routing = match RoutingType::try_from(code)? {
            RoutingType::ForwardToHost => {
                Routing::Hop(RoutingInformation::ForwardToHost(HostRoute::decode(content)?))
            }
            RoutingType::SwapForwardToHost => {
                Routing::Hop(RoutingInformation::SwapForwardToHost(HostRoute::decode(content)?))
            }
            RoutingType::Drop => {
                let (tag, _) = ExitInformation::split_tag(content)?;
                Routing::Exit(ExitInformation::Drop { tag })
            }
            RoutingType::Smtp => {
                let (tag, rest) = ExitInformation::split_tag(content)?;
                Routing::Exit(ExitInformation::Smtp { tag, address: ExitInformation::text(rest)? })
            }
            RoutingType::Mbox => {
                let (tag, rest) = ExitInformation::split_tag(content)?;
                Routing::Exit(ExitInformation::Mbox { tag, mailbox: ExitInformation::text(rest)? })
            }
            RoutingType::Fragment => Routing::Exit(ExitInformation::Fragmented),
        };
        Ok(routing)
    }
}

impl From<RoutingInformation> for Routing {
    fn from(r: RoutingInformation) -> Self {
        Routing::Hop(r)
    }
}

impl From<ExitInformation> for Routing {
    fn from(e: ExitInformation) -> Self {
        Routing::Exit(e)
    }
}
