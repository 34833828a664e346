//! Message Assembly
//!
//! Turns a message into wire packets. Each packet travels two legs: header 1
//! carries it to the crossover relay, which swaps in header 2 for the rest
//! of the path. Payload layers are applied innermost first:
//!
//! ```text
//! 1. P  = SPRP_E(hash(s2_i | "PAYLOAD ENCRYPT"), P)    second leg, last hop first
//! 2. H2 = SPRP_E(hide_header_key(P), H2)                hide
//!    P  = SPRP_E(hide_payload_key(H2), P)
//! 3. H2 = SPRP_E(hash(s1_i | "HEADER ENCRYPT"), H2)     first leg, last hop first
//!    P  = SPRP_E(hash(s1_i | "PAYLOAD ENCRYPT"), P)
//! ```
//!
//! Replies use a reply block's header as header 2; the payload gets one
//! SPRP decryption under the block's shared secret instead of step 1.

use libmix_crypto::{compress, sprp_decrypt, sprp_encrypt};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::descriptor::RoutingDescriptor;
use crate::directory::DescriptorList;
use crate::fragment::FragmentEngine;
use crate::header::{Header, HeaderBuilder};
use crate::key_pool::{OsSecrets, SecretSource};
use crate::payload::{encode_singleton, fits_singleton};
use crate::relay::{hide_header_key, hide_payload_key, layer_key, HEADER_ENCRYPT, PAYLOAD_ENCRYPT};
use crate::reply_block::ReplyBlock;
use crate::routing::{ExitInformation, Routing, RoutingInformation};
use crate::{unix_now, MixError, MixResult, MAX_HOPS, MIN_HOPS, PACKET_SIZE, PAYLOAD_LEN, SECRET_LEN};

/// One wire packet and the relay it goes to first
#[derive(Debug, Clone)]
pub struct AssembledPacket {
    /// Exactly [`PACKET_SIZE`] bytes
    pub bytes: Vec<u8>,
    /// Entry relay
    pub first_hop: RoutingDescriptor,
}

/// Builds packets over paths drawn from a directory
pub struct MessageAssembler<'a> {
    directory: &'a DescriptorList,
    hops: usize,
    secrets: &'a dyn SecretSource,
}

impl std::fmt::Debug for MessageAssembler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageAssembler")
            .field("relays", &self.directory.len())
            .field("hops", &self.hops)
            .finish_non_exhaustive()
    }
}

impl<'a> MessageAssembler<'a> {
    /// Assembler for `hops`-hop forward paths, with secrets from the OS
    pub fn new(directory: &'a DescriptorList, hops: usize) -> MixResult<Self> {
        if hops < MIN_HOPS {
            return Err(MixError::PathTooShort(hops, MIN_HOPS));
        }
        if hops > 2 * MAX_HOPS {
            return Err(MixError::PathTooLong(hops, 2 * MAX_HOPS));
        }
        Ok(Self { directory, hops, secrets: &OsSecrets })
    }

    /// Draw hop secrets from `secrets`, e.g. a [`crate::KeyPool`]
    pub fn with_secrets(mut self, secrets: &'a dyn SecretSource) -> Self {
        self.secrets = secrets;
        self
    }

    /// Total hops of a forward path
    pub fn hops(&self) -> usize {
        self.hops
    }

    /// Compress `message` into one singleton payload, or erasure-coded
    /// fragments carrying `exit` when it does not fit
    pub fn prepare_payloads(message: &[u8], exit: &ExitInformation) -> MixResult<Vec<Vec<u8>>> {
        let compressed = compress(message)?;
        if fits_singleton(compressed.len()) {
            return Ok(vec![encode_singleton(&compressed)?]);
        }
        let fragments = FragmentEngine::fragment(message, exit)?;
        debug!(len = message.len(), fragments = fragments.len(), "message fragmented");
        Ok(fragments)
    }

    /// Compress, split and assemble `message` for `recipients`
    pub fn assemble_message(&self, message: &[u8], recipients: &[String]) -> MixResult<Vec<AssembledPacket>> {
        let exit = ExitInformation::for_recipients(recipients, None)?;
        let parts = Self::prepare_payloads(message, &exit)?;
        self.assemble_with_exit(&parts, &exit)
    }

    /// Assemble prepared payloads for `recipients`. More than one part
    /// means fragments, all routed to the same reassembling exit.
    pub fn assemble(&self, parts: &[Vec<u8>], recipients: &[String]) -> MixResult<Vec<AssembledPacket>> {
        let exit = ExitInformation::for_recipients(recipients, None)?;
        self.assemble_with_exit(parts, &exit)
    }

    fn assemble_with_exit(&self, parts: &[Vec<u8>], exit: &ExitInformation) -> MixResult<Vec<AssembledPacket>> {
        check_parts(parts)?;

        let packets = if parts.len() == 1 {
            let path = self.directory.random_path_with_exit(self.hops)?;
            vec![self.assemble_forward(&parts[0], &path, exit.clone())?]
        } else {
            let paths = self.directory.random_paths_with_fragments(self.hops, parts.len())?;
            parts
                .iter()
                .zip(&paths)
                .map(|(part, path)| self.assemble_forward(part, path, ExitInformation::Fragmented))
                .collect::<MixResult<Vec<_>>>()?
        };

        info!(packets = packets.len(), hops = self.hops, "assembled message");
        Ok(packets)
    }

    /// One forward packet over `path`, delivering with `exit`
    pub fn assemble_forward(
        &self,
        payload: &[u8],
        path: &[RoutingDescriptor],
        exit: ExitInformation,
    ) -> MixResult<AssembledPacket> {
        if path.len() < MIN_HOPS {
            return Err(MixError::PathTooShort(path.len(), MIN_HOPS));
        }
        let (first_leg, second_leg) = path.split_at(path.len() / 2);

        let first_secrets = self.fresh_secrets(first_leg.len())?;
        let second_secrets = self.fresh_secrets(second_leg.len())?;

        let crossover = RoutingInformation::SwapForwardToHost(second_leg[0].host_route());
        let header1 = HeaderBuilder::new(first_leg, &first_secrets, crossover).build()?;
        let header2 = HeaderBuilder::new(second_leg, &second_secrets, Routing::Exit(exit)).build()?;

        let mut payload = payload.to_vec();
        for secret in second_secrets.iter().rev() {
            payload = sprp_encrypt(&layer_key(secret, PAYLOAD_ENCRYPT), &payload)?;
        }

        self.seal(header1, header2.into_bytes(), payload, &first_secrets, &first_leg[0])
    }

    /// Reply packets, one reply block per part
    pub fn assemble_reply(&self, parts: &[Vec<u8>], blocks: &[ReplyBlock]) -> MixResult<Vec<AssembledPacket>> {
        self.assemble_reply_at(parts, blocks, unix_now())
    }

    fn assemble_reply_at(&self, parts: &[Vec<u8>], blocks: &[ReplyBlock], now: u64) -> MixResult<Vec<AssembledPacket>> {
        check_parts(parts)?;
        if blocks.len() < parts.len() {
            return Err(MixError::NotEnoughReplyBlocks { needed: parts.len(), available: blocks.len() });
        }
        if blocks[..parts.len()].iter().any(|b| b.is_expired(now)) {
            return Err(MixError::ReplyBlockExpired);
        }

        let packets = parts
            .iter()
            .zip(blocks)
            .map(|(part, block)| self.assemble_reply_packet(part, block))
            .collect::<MixResult<Vec<_>>>()?;
        info!(packets = packets.len(), "assembled reply");
        Ok(packets)
    }

    /// Compress, split and assemble a reply to the owner of `blocks`
    pub fn assemble_reply_message(&self, message: &[u8], blocks: &[ReplyBlock]) -> MixResult<Vec<AssembledPacket>> {
        // the decoder ignores the exit carried in fragment metadata
        let exit = ExitInformation::Drop { tag: ExitInformation::random_tag()? };
        let parts = Self::prepare_payloads(message, &exit)?;
        self.assemble_reply(&parts, blocks)
    }

    fn assemble_reply_packet(&self, payload: &[u8], block: &ReplyBlock) -> MixResult<AssembledPacket> {
        let hops = self.hops.min(MAX_HOPS);
        let path = self.directory.random_path(hops)?;
        let secrets = self.fresh_secrets(hops)?;

        let header1 = HeaderBuilder::new(&path, &secrets, block.routing().clone()).build()?;
        let payload = sprp_decrypt(&layer_key(block.shared_secret(), PAYLOAD_ENCRYPT), payload)?;

        self.seal(header1, block.header().as_bytes().to_vec(), payload, &secrets, &path[0])
    }

    /// Hide step plus the first leg's layers
    fn seal(
        &self,
        header1: Header,
        mut header2: Vec<u8>,
        mut payload: Vec<u8>,
        first_secrets: &[[u8; SECRET_LEN]],
        first_hop: &RoutingDescriptor,
    ) -> MixResult<AssembledPacket> {
        header2 = sprp_encrypt(&hide_header_key(&payload), &header2)?;
        payload = sprp_encrypt(&hide_payload_key(&header2), &payload)?;

        for secret in first_secrets.iter().rev() {
            header2 = sprp_encrypt(&layer_key(secret, HEADER_ENCRYPT), &header2)?;
            payload = sprp_encrypt(&layer_key(secret, PAYLOAD_ENCRYPT), &payload)?;
        }

        let mut bytes = header1.into_bytes();
        bytes.extend_from_slice(&header2);
        bytes.extend_from_slice(&payload);
        assert_eq!(bytes.len(), PACKET_SIZE, "assembled packet has the wrong size");

        debug!(first_hop = first_hop.nickname(), "sealed packet");
        Ok(AssembledPacket { bytes, first_hop: first_hop.clone() })
    }

    fn fresh_secrets(&self, count: usize) -> MixResult<Zeroizing<Vec<[u8; SECRET_LEN]>>> {
        let mut secrets = Zeroizing::new(Vec::with_capacity(count));
        for _ in 0..count {
            secrets.push(self.secrets.secret()?);
        }
        Ok(secrets)
    }
}

fn check_parts(parts: &[Vec<u8>]) -> MixResult<()> {
    if parts.is_empty() {
        return Err(MixError::InvalidPayload("nothing to assemble".into()));
    }
    if let Some(part) = parts.iter().find(|p| p.len() != PAYLOAD_LEN) {
        return Err(MixError::InvalidPayload(format!(
            "payload is {} bytes, expected {}",
            part.len(),
            PAYLOAD_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys::relay_key;
    use crate::REPLY_BLOCK_LIFETIME;
    use libmix_crypto::random_vec;

    const NOW: u64 = 1_700_000_000;

    fn directory() -> DescriptorList {
        DescriptorList::from_descriptors((0..4).map(|i| {
            let key = relay_key(i).public_key();
            RoutingDescriptor::new(format!("relay{}", i), format!("mix{}.example.net", i), 48099, key.clone(), Some(key))
                .unwrap()
                .with_exit(true)
                .with_fragmented(true)
        }))
    }

    fn bob() -> Vec<String> {
        vec!["bob@example.org".to_string()]
    }

    #[test]
    fn test_hops_bounds() {
        let dir = directory();
        assert!(matches!(MessageAssembler::new(&dir, 1), Err(MixError::PathTooShort(1, 2))));
        assert!(matches!(MessageAssembler::new(&dir, 33), Err(MixError::PathTooLong(33, 32))));
        assert_eq!(MessageAssembler::new(&dir, 2).unwrap().hops(), 2);
    }

    #[test]
    fn test_single_packet_size_and_fresh_headers() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 3).unwrap();
        let a = assembler.assemble_message(b"hello bob", &bob()).unwrap();
        let b = assembler.assemble_message(b"hello bob", &bob()).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].bytes.len(), PACKET_SIZE);
        assert_ne!(a[0].bytes[..2048], b[0].bytes[..2048]);
    }

    #[test]
    fn test_fragmented_message() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 4).unwrap();
        // random data does not compress into one packet
        let message = random_vec(60_000).unwrap();
        let packets = assembler.assemble_message(&message, &bob()).unwrap();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.bytes.len() == PACKET_SIZE));
    }

    #[test]
    fn test_prepare_payloads() {
        let exit = ExitInformation::for_recipients(&bob(), None).unwrap();
        let parts = MessageAssembler::prepare_payloads(b"short", &exit).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), PAYLOAD_LEN);
    }

    #[test]
    fn test_wrong_part_size_rejected() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 2).unwrap();
        assert!(assembler.assemble(&[vec![0u8; 100]], &bob()).is_err());
        assert!(assembler.assemble(&[], &bob()).is_err());
    }

    #[test]
    fn test_not_enough_reply_blocks() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 2).unwrap();
        let path = dir.random_path(2).unwrap();
        let block = ReplyBlock::build_at("me@example.org", &path, b"user secret", NOW).unwrap();
        let parts = vec![vec![0u8; PAYLOAD_LEN], vec![0u8; PAYLOAD_LEN]];

        let err = assembler.assemble_reply_at(&parts, &[block], NOW).unwrap_err();
        assert!(matches!(err, MixError::NotEnoughReplyBlocks { needed: 2, available: 1 }));
    }

    #[test]
    fn test_expired_reply_block() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 2).unwrap();
        let path = dir.random_path(2).unwrap();
        let block = ReplyBlock::build_at("me@example.org", &path, b"user secret", NOW).unwrap();
        let parts = vec![vec![0u8; PAYLOAD_LEN]];

        assert_eq!(assembler.assemble_reply_at(&parts, &[block.clone()], NOW).unwrap()[0].bytes.len(), PACKET_SIZE);
        let later = NOW + REPLY_BLOCK_LIFETIME + 1;
        assert!(matches!(assembler.assemble_reply_at(&parts, &[block], later), Err(MixError::ReplyBlockExpired)));
    }

    struct CountingSecrets(std::sync::atomic::AtomicUsize);

    impl SecretSource for CountingSecrets {
        fn secret(&self) -> MixResult<[u8; SECRET_LEN]> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            OsSecrets.secret()
        }
    }

    #[test]
    fn test_secret_source_used_per_hop() {
        let dir = directory();
        let source = CountingSecrets(Default::default());
        let assembler = MessageAssembler::new(&dir, 4).unwrap().with_secrets(&source);
        assembler.assemble_message(b"hi", &bob()).unwrap();
        assert_eq!(source.0.load(std::sync::atomic::Ordering::SeqCst), 4);
    }
}
