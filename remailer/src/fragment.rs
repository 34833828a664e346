//! Fragmentation and Reassembly
//!
//! Messages too long for one packet are compressed, prefixed with their exit
//! instruction, whitened and split into chunk groups of `k` source shares.
//! Each group is erasure-coded into `n = ceil(4k/3)` shares, so any `k` of
//! them rebuild the group.
//!
//! # Sizes
//!
//! ```text
//! share body  = 28672 - 47 = 28625 bytes
//! packets     = ceil(len / 28625)
//! k           = min(16, next_pow2(packets))
//! groups      = ceil(packets / k)
//! padding     = groups * k * 28625 - len
//! index       = group * n + share
//! ```
//!
//! # Reassembly
//!
//! A [`FragmentContainer`] per message id counts the shares still needed.
//! Many handlers may add shares at once; the one whose share completes the
//! message sees [`FragmentStatus::Ready`] and reassembly runs at most once.
//! The pool remembers rebuilt ids for a while so the `n - k` shares that
//! arrive afterwards are ignored, and drops containers that never complete.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libmix_crypto::{
    compress, create_prng, decompress, digest_eq, hash, hash_concat, random_bytes, sprp_decrypt,
    sprp_encrypt, FecCode, HASH_LEN, KEY_LEN,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::payload::{FRAGMENT_HEADER_LEN, MAX_MESSAGE_SIZE};
use crate::routing::{ExitInformation, Routing};
use crate::{MixError, MixResult, PAYLOAD_LEN};

/// Body bytes of one fragment
pub const FRAGMENT_BODY_LEN: usize = PAYLOAD_LEN - FRAGMENT_HEADER_LEN;

/// Largest number of source shares per chunk group
pub const MAX_FRAGMENTS_PER_CHUNK: usize = 16;

/// Top bit of the 3-byte flag marks a fragment
const FRAGMENT_FLAG: u32 = 0x80_0000;

/// Message id length
pub const MESSAGE_ID_LEN: usize = HASH_LEN;

/// Whitening key: hash("WHITEN" | "WHITEN")
fn whiten_key() -> [u8; HASH_LEN] {
    hash(b"WHITENWHITEN")
}

/// Code parameters for a whitened message of `len` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentParams {
    /// Source shares per group
    pub k: usize,
    /// Shares per group after encoding
    pub n: usize,
    /// Chunk groups
    pub groups: usize,
    /// Padding appended before splitting
    pub padding: usize,
}

impl FragmentParams {
    /// Parameters for `len` bytes
    pub fn for_len(len: usize) -> Self {
        let packets = ((len + FRAGMENT_BODY_LEN - 1) / FRAGMENT_BODY_LEN).max(1);
        let k = packets.next_power_of_two().min(MAX_FRAGMENTS_PER_CHUNK);
        let n = (4 * k + 2) / 3;
        let groups = (packets + k - 1) / k;
        let padding = groups * k * FRAGMENT_BODY_LEN - len;
        Self { k, n, groups, padding }
    }

    /// Total fragments
    pub fn total_fragments(&self) -> usize {
        self.groups * self.n
    }
}

/// One fragment as carried in a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPacket {
    /// Global fragment index
    pub index: u32,
    /// Message id shared by all fragments
    pub message_id: [u8; MESSAGE_ID_LEN],
    /// Length of the whitened message
    pub total_size: u32,
    /// Share body
    pub body: Vec<u8>,
}

impl FragmentPacket {
    /// Serialize to a full payload
    pub fn encode(&self) -> Vec<u8> {
        let size = self.total_size.to_be_bytes();
        let digest = hash_concat(&[&self.message_id, &size, &self.body]);
        let flag = (FRAGMENT_FLAG + self.index).to_be_bytes();

        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.body.len());
        out.extend_from_slice(&flag[1..]);
        out.extend_from_slice(&digest);
        out.extend_from_slice(&self.message_id);
        out.extend_from_slice(&size);
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse and verify a payload
    pub fn parse(payload: &[u8]) -> MixResult<Self> {
        if payload.len() != PAYLOAD_LEN {
            return Err(MixError::InvalidPayload(format!(
                "fragment payload is {} bytes",
                payload.len()
            )));
        }
        if payload[0] & 0x80 == 0 {
            return Err(MixError::InvalidPayload("fragment flag not set".into()));
        }
        if !digest_eq(&hash(&payload[23..]), &payload[3..23]) {
            return Err(MixError::InvalidPayload("fragment hash does not verify".into()));
        }

        let flag = u32::from_be_bytes([0, payload[0], payload[1], payload[2]]);
        let mut message_id = [0u8; MESSAGE_ID_LEN];
        message_id.copy_from_slice(&payload[23..43]);
        let total_size = u32::from_be_bytes([payload[43], payload[44], payload[45], payload[46]]);
        Ok(Self {
            index: flag - FRAGMENT_FLAG,
            message_id,
            total_size,
            body: payload[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Splits messages into fragment payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentEngine;

impl FragmentEngine {
    /// Compress, whiten and erasure-code `message` for delivery per `exit`.
    ///
    /// Returns one 28672-byte payload per fragment, in index order.
    pub fn fragment(message: &[u8], exit: &ExitInformation) -> MixResult<Vec<Vec<u8>>> {
        let compressed = compress(message)?;
        let content = exit.content();
        let content_len = u16::try_from(content.len())
            .map_err(|_| MixError::InvalidRecipient(format!("exit address of {} bytes", content.len())))?;

        let mut pre = Vec::with_capacity(4 + content.len() + compressed.len());
        pre.extend_from_slice(&(exit.routing_type() as u16).to_be_bytes());
        pre.extend_from_slice(&content_len.to_be_bytes());
        pre.extend_from_slice(&content);
        pre.extend_from_slice(&compressed);

        let whitened = sprp_encrypt(&whiten_key(), &pre)?;
        let total_size = u32::try_from(whitened.len())
            .map_err(|_| MixError::InvalidPayload("message too large to fragment".into()))?;
        let params = FragmentParams::for_len(whitened.len());

        let mut padded = whitened;
        padded.extend(create_prng(&random_bytes::<KEY_LEN>()?, params.padding));

        let message_id = random_bytes::<MESSAGE_ID_LEN>()?;
        let code = FecCode::new(params.k, params.n)?;
        let group_len = params.k * FRAGMENT_BODY_LEN;

        let mut payloads = Vec::with_capacity(params.total_fragments());
        for (g, group) in padded.chunks(group_len).enumerate() {
            let source: Vec<&[u8]> = group.chunks(FRAGMENT_BODY_LEN).collect();
            for (j, body) in code.encode_all(&source)?.into_iter().enumerate() {
                let packet = FragmentPacket {
                    index: (g * params.n + j) as u32,
                    message_id,
                    total_size,
                    body,
                };
                payloads.push(packet.encode());
            }
        }

        debug!(
            message_id = %hex::encode(&message_id[..4]),
            size = total_size,
            k = params.k,
            n = params.n,
            groups = params.groups,
            "fragmented message"
        );
        Ok(payloads)
    }
}

/// Outcome of adding one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    /// Index seen before
    Duplicate,
    /// Group already complete; share not needed
    Redundant,
    /// More shares needed
    Pending {
        /// Shares still missing across all groups
        needed: usize,
    },
    /// This share completed the message
    Ready,
}

/// Result of a reassembly attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// Not enough shares yet
    NotReady {
        /// Shares still missing
        needed: usize,
    },
    /// Rebuilt message
    Complete {
        /// Exit instruction the sender attached
        exit: ExitInformation,
        /// Decompressed message
        body: Vec<u8>,
    },
}

/// Collects the fragments of one message
#[derive(Debug)]
pub struct FragmentContainer {
    message_id: [u8; MESSAGE_ID_LEN],
    total_size: u32,
    params: FragmentParams,
    shares: Mutex<Vec<BTreeMap<usize, Vec<u8>>>>,
    needed: AtomicUsize,
    reassembled: AtomicBool,
    created: Instant,
}

impl FragmentContainer {
    /// Empty container for a message id and whitened size
    pub fn new(message_id: [u8; MESSAGE_ID_LEN], total_size: u32) -> Self {
        let params = FragmentParams::for_len(total_size as usize);
        Self {
            message_id,
            total_size,
            params,
            shares: Mutex::new(vec![BTreeMap::new(); params.groups]),
            needed: AtomicUsize::new(params.groups * params.k),
            reassembled: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    /// When the first share arrived
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Message id
    pub fn message_id(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.message_id
    }

    /// Code parameters
    pub fn params(&self) -> FragmentParams {
        self.params
    }

    /// Shares still missing
    pub fn needed(&self) -> usize {
        self.needed.load(Ordering::Acquire)
    }

    /// Every group has `k` shares
    pub fn is_ready(&self) -> bool {
        self.needed() == 0
    }

    /// Reassembly has run
    pub fn is_reassembled(&self) -> bool {
        self.reassembled.load(Ordering::Acquire)
    }

    /// Record one fragment
    pub fn add_fragment(&self, packet: &FragmentPacket) -> MixResult<FragmentStatus> {
        if packet.message_id != self.message_id || packet.total_size != self.total_size {
            return Err(MixError::InvalidPayload("fragment belongs to another message".into()));
        }
        if packet.body.len() != FRAGMENT_BODY_LEN {
            return Err(MixError::InvalidPayload(format!(
                "fragment body is {} bytes",
                packet.body.len()
            )));
        }
        let index = packet.index as usize;
        if index >= self.params.total_fragments() {
            return Err(MixError::InvalidPayload(format!(
                "fragment index {} out of range",
                index
            )));
        }

        let (group, share) = (index / self.params.n, index % self.params.n);
        let mut shares = self.shares.lock();
        let slot = &mut shares[group];
        if slot.contains_key(&share) {
            return Ok(FragmentStatus::Duplicate);
        }
        if slot.len() >= self.params.k {
            return Ok(FragmentStatus::Redundant);
        }
        slot.insert(share, packet.body.clone());

        let before = self.needed.fetch_sub(1, Ordering::AcqRel);
        if before == 1 {
            Ok(FragmentStatus::Ready)
        } else {
            Ok(FragmentStatus::Pending { needed: before - 1 })
        }
    }

    /// Rebuild the message once all groups are complete
    pub fn reassemble(&self) -> MixResult<Reassembly> {
        let needed = self.needed();
        if needed > 0 {
            return Ok(Reassembly::NotReady { needed });
        }
        if self
            .reassembled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MixError::AlreadyReassembled);
        }

        let code = FecCode::new(self.params.k, self.params.n)?;
        let mut whitened = Vec::with_capacity(self.params.groups * self.params.k * FRAGMENT_BODY_LEN);
        {
            let mut shares = self.shares.lock();
            for group in shares.iter_mut() {
                let indices: Vec<usize> = group.keys().copied().collect();
                let bodies: Vec<&[u8]> = group.values().map(|b| b.as_slice()).collect();
                for source in code.decode(&bodies, &indices)? {
                    whitened.extend_from_slice(&source);
                }
                group.clear();
            }
        }
        whitened.truncate(self.total_size as usize);

        let pre = sprp_decrypt(&whiten_key(), &whitened)?;
        if pre.len() < 4 {
            return Err(MixError::InvalidPayload("reassembled message truncated".into()));
        }
        let exit_type = u16::from_be_bytes([pre[0], pre[1]]);
        let content_len = u16::from_be_bytes([pre[2], pre[3]]) as usize;
        let content = pre
            .get(4..4 + content_len)
            .ok_or_else(|| MixError::InvalidPayload("exit information truncated".into()))?;
        let exit = match Routing::decode(exit_type, content)? {
            Routing::Exit(exit) => exit,
            Routing::Hop(_) => {
                return Err(MixError::InvalidPayload("fragment carries a forwarding routing".into()))
            }
        };
        let body = decompress(&pre[4 + content_len..], MAX_MESSAGE_SIZE)?;

        info!(
            message_id = %hex::encode(&self.message_id[..4]),
            len = body.len(),
            "reassembled fragmented message"
        );
        Ok(Reassembly::Complete { exit, body })
    }
}

/// Containers older than this are dropped, complete or not
pub const DEFAULT_FRAGMENT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Most messages collected at once; the oldest is evicted beyond this
pub const MAX_PENDING_MESSAGES: usize = 1024;

/// Most reassembled message ids remembered for ignoring late shares
pub const MAX_COMPLETED_IDS: usize = 4096;

/// What happened to a fragment offered to a [`FragmentPool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Stored; the message still needs this many shares
    Stored {
        /// Shares still missing
        needed: usize,
    },
    /// Duplicate, redundant, or late for a message already rebuilt
    Ignored,
    /// This share completed the message
    Complete {
        /// Exit instruction the sender attached
        exit: ExitInformation,
        /// Decompressed message
        body: Vec<u8>,
    },
}

/// Reassembled ids in completion order
#[derive(Debug, Default)]
struct CompletedIds {
    order: VecDeque<([u8; MESSAGE_ID_LEN], Instant)>,
    ids: HashSet<[u8; MESSAGE_ID_LEN]>,
}

impl CompletedIds {
    fn insert(&mut self, id: [u8; MESSAGE_ID_LEN], now: Instant) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back((id, now));
        while self.order.len() > MAX_COMPLETED_IDS {
            if let Some((old, _)) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &[u8; MESSAGE_ID_LEN]) -> bool {
        self.ids.contains(id)
    }

    fn expire(&mut self, cutoff: Instant) {
        while let Some(&(id, at)) = self.order.front() {
            if at > cutoff {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&id);
        }
    }
}

/// Fragment containers by message id, shared by packet handlers
#[derive(Debug)]
pub struct FragmentPool {
    containers: RwLock<HashMap<[u8; MESSAGE_ID_LEN], Arc<FragmentContainer>>>,
    completed: Mutex<CompletedIds>,
    max_age: Duration,
}

impl Default for FragmentPool {
    fn default() -> Self {
        Self::with_max_age(DEFAULT_FRAGMENT_LIFETIME)
    }
}

impl FragmentPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty pool dropping containers after `max_age`
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            completed: Mutex::new(CompletedIds::default()),
            max_age,
        }
    }

    /// Container for a message, created on first sight
    pub fn container(&self, message_id: [u8; MESSAGE_ID_LEN], total_size: u32) -> Arc<FragmentContainer> {
        if let Some(existing) = self.containers.read().get(&message_id) {
            return Arc::clone(existing);
        }
        let mut containers = self.containers.write();
        if !containers.contains_key(&message_id) && containers.len() >= MAX_PENDING_MESSAGES {
            let oldest = containers.values().min_by_key(|c| c.created()).map(|c| *c.message_id());
            if let Some(oldest) = oldest {
                warn!(message_id = %hex::encode(&oldest[..4]), "fragment pool full; evicting oldest message");
                containers.remove(&oldest);
            }
        }
        Arc::clone(
            containers
                .entry(message_id)
                .or_insert_with(|| Arc::new(FragmentContainer::new(message_id, total_size))),
        )
    }

    /// Add a fragment to its container. Shares of a message already
    /// rebuilt are [`FragmentStatus::Redundant`] and create nothing.
    pub fn add_fragment(&self, packet: &FragmentPacket) -> MixResult<FragmentStatus> {
        Ok(self.add(packet)?.1)
    }

    fn add(&self, packet: &FragmentPacket) -> MixResult<(Option<Arc<FragmentContainer>>, FragmentStatus)> {
        self.expire(self.max_age);
        if self.completed.lock().contains(&packet.message_id) {
            return Ok((None, FragmentStatus::Redundant));
        }
        let container = self.container(packet.message_id, packet.total_size);
        let status = container.add_fragment(packet)?;
        Ok((Some(container), status))
    }

    /// Add a fragment and, if it completed its message, reassemble it,
    /// forget the container and remember the id
    pub fn accept(&self, packet: &FragmentPacket) -> MixResult<FragmentOutcome> {
        let container = match self.add(packet)? {
            (Some(container), FragmentStatus::Ready) => container,
            (_, FragmentStatus::Pending { needed }) => return Ok(FragmentOutcome::Stored { needed }),
            _ => return Ok(FragmentOutcome::Ignored),
        };
        let result = container.reassemble();
        self.completed.lock().insert(*container.message_id(), Instant::now());
        self.remove(container.message_id());
        match result? {
            Reassembly::Complete { exit, body } => Ok(FragmentOutcome::Complete { exit, body }),
            Reassembly::NotReady { needed } => Ok(FragmentOutcome::Stored { needed }),
        }
    }

    /// [`FragmentPool::accept`], yielding only a completed message
    pub fn add_and_reassemble(&self, packet: &FragmentPacket) -> MixResult<Option<(ExitInformation, Vec<u8>)>> {
        match self.accept(packet)? {
            FragmentOutcome::Complete { exit, body } => Ok(Some((exit, body))),
            FragmentOutcome::Stored { .. } | FragmentOutcome::Ignored => Ok(None),
        }
    }

    /// Drop containers and remembered ids older than `max_age`.
    ///
    /// Returns the number of containers dropped.
    pub fn expire(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let Some(cutoff) = now.checked_sub(max_age) else {
            return 0;
        };
        self.completed.lock().expire(cutoff);

        let stale = self.containers.read().values().any(|c| c.created() <= cutoff);
        if !stale {
            return 0;
        }
        let mut containers = self.containers.write();
        let before = containers.len();
        containers.retain(|_, c| c.created() > cutoff);
        let dropped = before - containers.len();
        if dropped > 0 {
            debug!(dropped, "expired incomplete fragmented messages");
        }
        dropped
    }

    /// Container for a message id
    pub fn get(&self, message_id: &[u8; MESSAGE_ID_LEN]) -> Option<Arc<FragmentContainer>> {
        self.containers.read().get(message_id).cloned()
    }

    /// Drop a container
    pub fn remove(&self, message_id: &[u8; MESSAGE_ID_LEN]) -> Option<Arc<FragmentContainer>> {
        self.containers.write().remove(message_id)
    }

    /// Messages in progress
    pub fn len(&self) -> usize {
        self.containers.read().len()
    }

    /// No messages in progress
    pub fn is_empty(&self) -> bool {
        self.containers.read().is_empty()
    }

    /// The message was rebuilt recently enough that late shares are ignored
    pub fn is_completed(&self, message_id: &[u8; MESSAGE_ID_LEN]) -> bool {
        self.completed.lock().contains(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit() -> ExitInformation {
        ExitInformation::Smtp { tag: [5u8; 20], address: "carol@example.org".into() }
    }

    fn incompressible(len: usize, seed: u8) -> Vec<u8> {
        create_prng(&[seed; KEY_LEN], len)
    }

    #[test]
    fn test_params() {
        let p = FragmentParams::for_len(FRAGMENT_BODY_LEN + 1);
        assert_eq!((p.k, p.n, p.groups), (2, 3, 1));

        let p = FragmentParams::for_len(5 * FRAGMENT_BODY_LEN);
        assert_eq!((p.k, p.n, p.groups), (8, 11, 1));
        assert_eq!(p.padding, 3 * FRAGMENT_BODY_LEN);

        let p = FragmentParams::for_len(17 * FRAGMENT_BODY_LEN);
        assert_eq!((p.k, p.n, p.groups), (16, 22, 2));
    }

    #[test]
    fn test_padding_never_negative() {
        for len in (1..40 * FRAGMENT_BODY_LEN).step_by(7919) {
            let p = FragmentParams::for_len(len);
            let padded = p.groups * p.k * FRAGMENT_BODY_LEN;
            assert!(padded >= len);
            assert_eq!(len + p.padding, padded);
            assert!(p.padding < p.k * FRAGMENT_BODY_LEN);
        }
    }

    #[test]
    fn test_fragment_packet_layout() {
        let packet = FragmentPacket {
            index: 7,
            message_id: [3u8; 20],
            total_size: 60000,
            body: vec![0xAA; FRAGMENT_BODY_LEN],
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), PAYLOAD_LEN);
        assert_eq!(&bytes[..3], &[0x80, 0x00, 0x07]);
        assert_eq!(FragmentPacket::parse(&bytes).unwrap(), packet);

        let mut bad = bytes.clone();
        bad[100] ^= 1;
        assert!(FragmentPacket::parse(&bad).is_err());
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let message = incompressible(40_000, 1);
        let payloads = FragmentEngine::fragment(&message, &exit()).unwrap();
        assert_eq!(payloads.len(), 3);
        assert!(payloads.iter().all(|p| p.len() == PAYLOAD_LEN));

        let pool = FragmentPool::new();
        // drop one share: k = 2 of n = 3
        let mut result = None;
        for payload in &payloads[1..] {
            let packet = FragmentPacket::parse(payload).unwrap();
            if let Some(done) = pool.add_and_reassemble(&packet).unwrap() {
                result = Some(done);
            }
        }
        let (exit_info, body) = result.unwrap();
        assert_eq!(exit_info, exit());
        assert_eq!(body, message);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_duplicate_does_not_count_twice() {
        let message = incompressible(40_000, 2);
        let payloads = FragmentEngine::fragment(&message, &exit()).unwrap();
        let first = FragmentPacket::parse(&payloads[0]).unwrap();

        let container = FragmentContainer::new(first.message_id, first.total_size);
        assert_eq!(container.add_fragment(&first).unwrap(), FragmentStatus::Pending { needed: 1 });
        assert_eq!(container.add_fragment(&first).unwrap(), FragmentStatus::Duplicate);
        assert_eq!(container.needed(), 1);
        assert_eq!(container.reassemble().unwrap(), Reassembly::NotReady { needed: 1 });

        let second = FragmentPacket::parse(&payloads[2]).unwrap();
        assert_eq!(container.add_fragment(&second).unwrap(), FragmentStatus::Ready);

        let third = FragmentPacket::parse(&payloads[1]).unwrap();
        assert_eq!(container.add_fragment(&third).unwrap(), FragmentStatus::Redundant);
    }

    #[test]
    fn test_second_reassembly_fails() {
        let message = incompressible(30_000, 3);
        let payloads = FragmentEngine::fragment(&message, &exit()).unwrap();
        let container = {
            let p = FragmentPacket::parse(&payloads[0]).unwrap();
            FragmentContainer::new(p.message_id, p.total_size)
        };
        for payload in &payloads {
            container.add_fragment(&FragmentPacket::parse(payload).unwrap()).unwrap();
        }
        assert!(matches!(container.reassemble().unwrap(), Reassembly::Complete { .. }));
        assert!(matches!(container.reassemble(), Err(MixError::AlreadyReassembled)));
        assert!(container.is_reassembled());
    }

    #[test]
    fn test_foreign_fragment_rejected() {
        let container = FragmentContainer::new([1u8; 20], 60_000);
        let packet = FragmentPacket {
            index: 0,
            message_id: [2u8; 20],
            total_size: 60_000,
            body: vec![0u8; FRAGMENT_BODY_LEN],
        };
        assert!(container.add_fragment(&packet).is_err());

        let packet = FragmentPacket { message_id: [1u8; 20], index: 99, ..packet };
        assert!(container.add_fragment(&packet).is_err());
    }

    #[test]
    fn test_concurrent_adds_single_ready() {
        let message = incompressible(200_000, 4);
        let payloads = FragmentEngine::fragment(&message, &exit()).unwrap();
        let packets: Vec<FragmentPacket> =
            payloads.iter().map(|p| FragmentPacket::parse(p).unwrap()).collect();
        let pool = Arc::new(FragmentPool::new());

        let handles: Vec<_> = packets
            .chunks(2)
            .map(|chunk| {
                let pool = Arc::clone(&pool);
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    chunk
                        .iter()
                        .filter(|p| pool.add_fragment(p).unwrap() == FragmentStatus::Ready)
                        .count()
                })
            })
            .collect();
        let ready: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(ready, 1);

        let container = pool.get(&packets[0].message_id).unwrap();
        match container.reassemble().unwrap() {
            Reassembly::Complete { body, .. } => assert_eq!(body, message),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_late_shares_ignored_after_reassembly() {
        let message = incompressible(100 * 1024, 5);
        let payloads = FragmentEngine::fragment(&message, &exit()).unwrap();
        let params = FragmentParams::for_len(FragmentPacket::parse(&payloads[0]).unwrap().total_size as usize);
        assert!(params.n > params.k);

        let pool = FragmentPool::new();
        let mut outcomes = Vec::new();
        for payload in &payloads {
            outcomes.push(pool.accept(&FragmentPacket::parse(payload).unwrap()).unwrap());
        }

        let completed = outcomes.iter().filter(|o| matches!(o, FragmentOutcome::Complete { .. })).count();
        let ignored = outcomes.iter().filter(|o| **o == FragmentOutcome::Ignored).count();
        assert_eq!(completed, 1);
        assert_eq!(ignored, params.groups * (params.n - params.k));
        assert!(pool.is_empty());

        let id = FragmentPacket::parse(&payloads[0]).unwrap().message_id;
        assert!(pool.is_completed(&id));
        let late = FragmentPacket::parse(&payloads[payloads.len() - 1]).unwrap();
        assert_eq!(pool.add_fragment(&late).unwrap(), FragmentStatus::Redundant);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_expire_drops_stale_containers() {
        let first = FragmentEngine::fragment(&incompressible(40_000, 6), &exit()).unwrap();
        let second = FragmentEngine::fragment(&incompressible(40_000, 7), &exit()).unwrap();

        let pool = FragmentPool::new();
        pool.add_fragment(&FragmentPacket::parse(&first[0]).unwrap()).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.expire(DEFAULT_FRAGMENT_LIFETIME), 0);
        assert_eq!(pool.expire(Duration::ZERO), 1);
        assert!(pool.is_empty());

        // a pool with no lifetime sweeps the old message on the next add
        let pool = FragmentPool::with_max_age(Duration::ZERO);
        pool.add_fragment(&FragmentPacket::parse(&first[0]).unwrap()).unwrap();
        pool.add_fragment(&FragmentPacket::parse(&second[0]).unwrap()).unwrap();
        assert_eq!(pool.len(), 1);
        let id = FragmentPacket::parse(&second[0]).unwrap().message_id;
        assert!(pool.get(&id).is_some());
    }

    #[test]
    fn test_oversized_exit_address_rejected() {
        let address = format!("{}@example.org", "a".repeat(70_000));
        let exit = ExitInformation::Smtp { tag: [5u8; 20], address };
        let err = FragmentEngine::fragment(b"hello", &exit).unwrap_err();
        assert!(matches!(err, MixError::InvalidRecipient(_)));
    }
}
