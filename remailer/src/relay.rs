//! Relay Packet Processing
//!
//! What a relay does with one 32768-byte packet: open its sub-header in
//! header 1, strip one layer from header 2 and the payload, then either
//! forward, swap the headers at the crossover point, or deliver.
//!
//! # Layer Keys
//!
//! ```text
//! header 2:  SPRP key hash(secret | "HEADER ENCRYPT")
//! payload:   SPRP key hash(secret | "PAYLOAD ENCRYPT")
//! hide:      hash(hash(payload) | "HIDE HEADER"), hash(hash(header 2) | "HIDE PAYLOAD")
//! ```
//!
//! Senders apply the same keys with `sprp_encrypt`, innermost hop first.

use libmix_crypto::{hash, hash_concat, sprp_decrypt, Digest20, PrivateKey};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::decoder::ReplyDecoder;
use crate::fragment::{FragmentOutcome, FragmentPool};
use crate::header::{Header, HeaderProcessor};
use crate::payload::{decode_payload, DecodedPayload};
use crate::routing::{ExitInformation, HostRoute, Routing, RoutingInformation};
use crate::{MixError, MixResult, HEADER_LEN, PACKET_SIZE};

/// Label for the header 2 layer key
pub const HEADER_ENCRYPT: &str = "HEADER ENCRYPT";

/// Label for the payload layer key
pub const PAYLOAD_ENCRYPT: &str = "PAYLOAD ENCRYPT";

/// Label for hiding header 2 under the payload
pub const HIDE_HEADER: &str = "HIDE HEADER";

/// Label for hiding the payload under header 2
pub const HIDE_PAYLOAD: &str = "HIDE PAYLOAD";

/// SPRP key `hash(secret | label)`
pub fn layer_key(secret: &[u8], label: &str) -> Digest20 {
    hash_concat(&[secret, label.as_bytes()])
}

/// Key hiding header 2, bound to the payload it travels with
pub fn hide_header_key(payload: &[u8]) -> Digest20 {
    layer_key(&hash(payload), HIDE_HEADER)
}

/// Key hiding the payload, bound to the already hidden header 2
pub fn hide_payload_key(header2: &[u8]) -> Digest20 {
    layer_key(&hash(header2), HIDE_PAYLOAD)
}

/// What to do with a processed packet
#[derive(Debug)]
pub enum RelayAction {
    /// Send `packet` on to the relay at `route`
    Forward {
        /// Next relay
        route: HostRoute,
        /// Rewritten packet
        packet: Vec<u8>,
    },
    /// This relay is the exit
    Deliver {
        /// Exit instruction
        exit: ExitInformation,
        /// Fully decrypted payload
        payload: Vec<u8>,
    },
}

/// Outcome of exit delivery
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Discarded on request
    Dropped,
    /// Plaintext message for the exit address
    Message {
        /// Exit instruction
        exit: ExitInformation,
        /// Decompressed message
        body: Vec<u8>,
    },
    /// Payload only the reply block owner can read, armored for mailing
    Encrypted {
        /// Exit instruction
        exit: ExitInformation,
        /// Armored message text
        text: String,
    },
    /// Fragment stored; more are needed
    FragmentPending,
    /// Fragment not needed: duplicate, or its message was already rebuilt
    FragmentIgnored,
}

/// Processes packets with one relay's packet key
pub struct RelayProcessor {
    packet_key: PrivateKey,
    fragments: FragmentPool,
}

impl RelayProcessor {
    /// Processor for a relay's packet key
    pub fn new(packet_key: PrivateKey) -> Self {
        Self { packet_key, fragments: FragmentPool::new() }
    }

    /// Fragments waiting for reassembly
    pub fn fragments(&self) -> &FragmentPool {
        &self.fragments
    }

    /// Peel this relay's layer off a packet
    pub fn process(&self, packet: &[u8]) -> MixResult<RelayAction> {
        if packet.len() != PACKET_SIZE {
            return Err(MixError::InvalidPayload(format!(
                "packet is {} bytes, expected {}",
                packet.len(),
                PACKET_SIZE
            )));
        }
        let header1 = Header::from_bytes(&packet[..HEADER_LEN])?;
        let processed = HeaderProcessor::new(&self.packet_key).process(&header1)?;
        let secret = Zeroizing::new(processed.sub_header.secret);

        let mut header2 = sprp_decrypt(
            &layer_key(&secret[..], HEADER_ENCRYPT),
            &packet[HEADER_LEN..2 * HEADER_LEN],
        )?;
        let mut payload = sprp_decrypt(
            &layer_key(&secret[..], PAYLOAD_ENCRYPT),
            &packet[2 * HEADER_LEN..],
        )?;

        match processed.routing {
            Routing::Hop(RoutingInformation::ForwardToHost(route)) => {
                trace!(host = %route.host, port = route.port, "forwarding packet");
                let packet = [processed.next.as_bytes(), &header2, &payload].concat();
                Ok(RelayAction::Forward { route, packet })
            }
            Routing::Hop(RoutingInformation::SwapForwardToHost(route)) => {
                payload = sprp_decrypt(&hide_payload_key(&header2), &payload)?;
                header2 = sprp_decrypt(&hide_header_key(&payload), &header2)?;
                debug!(host = %route.host, port = route.port, "swapping headers at crossover");
                let packet = [&header2, processed.next.as_bytes(), &payload].concat();
                Ok(RelayAction::Forward { route, packet })
            }
            Routing::Exit(exit) => Ok(RelayAction::Deliver { exit, payload }),
        }
    }

    /// Act on an exit instruction
    pub fn deliver(&self, exit: ExitInformation, payload: &[u8]) -> MixResult<Delivery> {
        match exit {
            ExitInformation::Drop { .. } => Ok(Delivery::Dropped),
            ExitInformation::Fragmented => match decode_payload(payload)? {
                DecodedPayload::Fragment(packet) => match self.fragments.accept(&packet)? {
                    FragmentOutcome::Complete { exit, body } => Ok(Delivery::Message { exit, body }),
                    FragmentOutcome::Stored { .. } => Ok(Delivery::FragmentPending),
                    FragmentOutcome::Ignored => Ok(Delivery::FragmentIgnored),
                },
                DecodedPayload::Singleton(_) => Err(MixError::InvalidPayload(
                    "fragment exit received a singleton".into(),
                )),
            },
            ExitInformation::Smtp { tag, .. } | ExitInformation::Mbox { tag, .. } => {
                match decode_payload(payload) {
                    Ok(DecodedPayload::Singleton(body)) => Ok(Delivery::Message { exit, body }),
                    // Readable only by whoever holds the handle
                    Ok(DecodedPayload::Fragment(_)) | Err(_) => {
                        let text = ReplyDecoder::armor(&tag, payload);
                        Ok(Delivery::Encrypted { exit, text })
                    }
                }
            }
        }
    }
}
