//! Remailer Client
//!
//! High-level client for sending anonymous messages and replies.
//!
//! # Usage
//!
//! ```ignore
//! let config = RemailerConfig::with_data_dir("/var/lib/remailer");
//! let mut client = RemailerClient::new(config)?;
//! client.bootstrap("keyring password")?;
//!
//! // Forward message
//! client.send_message(b"hello", &["bob@example.org".into()]).await?;
//!
//! // Reply blocks for others to answer with
//! let blocks = client.generate_reply_blocks(2, "me@example.org")?;
//! client.save_keyring("keyring password")?;
//! ```

use tracing::{info, warn};

use crate::assembler::{AssembledPacket, MessageAssembler};
use crate::config::RemailerConfig;
use crate::decoder::{DecodedReply, ReplyDecoder};
use crate::directory::DescriptorList;
use crate::key_pool::KeyPool;
use crate::keyring::Keyring;
use crate::reply_block::ReplyBlock;
use crate::tls::TlsConfig;
use crate::transport::MmtpClient;
use crate::{unix_now, MixError, MixResult, MAX_HOPS};

/// Remailer client
#[derive(Debug)]
pub struct RemailerClient {
    /// Client configuration
    config: RemailerConfig,
    /// Known relays
    directory: DescriptorList,
    /// Reply decoding, owns the keyring
    decoder: ReplyDecoder,
    /// Pre-generated hop secrets
    key_pool: KeyPool,
    /// Connections to first hops
    transport: MmtpClient,
    /// Client state
    state: ClientState,
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, directory and keyring not loaded
    Initializing,
    /// Ready to send
    Ready,
    /// Shut down
    Stopped,
}

/// Outcome of sending the packets of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendReport {
    /// Packets the first hop acknowledged
    pub accepted: usize,
    /// Packets the first hop refused
    pub rejected: usize,
    /// Packets lost to connection or protocol errors
    pub failed: usize,
}

impl SendReport {
    /// Every packet was accepted
    pub fn is_complete(&self) -> bool {
        self.rejected == 0 && self.failed == 0
    }
}

impl RemailerClient {
    /// Create new client
    pub fn new(config: RemailerConfig) -> MixResult<Self> {
        config.validate()?;

        let tls = TlsConfig::from_settings(&config.transport, &config.tls)?;
        let key_pool = KeyPool::new(config.key_pool_capacity)?;

        Ok(Self {
            config,
            directory: DescriptorList::new(),
            decoder: ReplyDecoder::new(Keyring::new()),
            key_pool,
            transport: MmtpClient::new(tls),
            state: ClientState::Initializing,
        })
    }

    /// Use `directory` instead of the configured directory file
    pub fn with_directory(mut self, directory: DescriptorList) -> Self {
        self.directory = directory;
        self
    }

    /// Get client state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Check if client is ready
    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Ready
    }

    /// Load the directory (unless one was supplied) and the keyring
    pub fn bootstrap(&mut self, password: &str) -> MixResult<()> {
        if self.directory.is_empty() {
            self.directory = DescriptorList::load(&self.config.directory_file)?;
        }
        if self.directory.is_empty() {
            return Err(MixError::NoPath("directory lists no relays".into()));
        }

        let keyring = if self.config.keyring_file.exists() {
            Keyring::load(&self.config.keyring_file, password)?
        } else {
            Keyring::new()
        };
        self.decoder = ReplyDecoder::new(keyring);

        self.state = ClientState::Ready;
        info!(relays = self.directory.len(), secrets = self.decoder.keyring().len(), "client ready");
        Ok(())
    }

    /// Persist the keyring under `password`
    pub fn save_keyring(&self, password: &str) -> MixResult<()> {
        self.decoder.keyring().save(&self.config.keyring_file, password)
    }

    fn ensure_ready(&self) -> MixResult<()> {
        match self.state {
            ClientState::Ready => Ok(()),
            state => Err(MixError::Internal(format!("client is not ready ({:?})", state))),
        }
    }

    fn assembler(&self) -> MixResult<MessageAssembler<'_>> {
        Ok(MessageAssembler::new(&self.directory, self.config.hops)?.with_secrets(&self.key_pool))
    }

    /// Reply blocks delivering to `address`, keyed by the current keyring
    /// secret (a new one when none is valid)
    pub fn generate_reply_blocks(&mut self, count: usize, address: &str) -> MixResult<Vec<ReplyBlock>> {
        self.ensure_ready()?;
        let now = unix_now();
        let keyring = self.decoder.keyring_mut();
        let secret = match keyring.current_secret(now) {
            Some(secret) => *secret,
            None => keyring.new_secret_at(now)?,
        };

        let hops = self.config.hops.min(MAX_HOPS);
        let blocks = (0..count)
            .map(|_| {
                let path = self.directory.random_path_with_exit(hops)?;
                ReplyBlock::build_at(address, &path, &secret, now)
            })
            .collect::<MixResult<Vec<_>>>()?;
        info!(count, hops, "generated reply blocks");
        Ok(blocks)
    }

    /// Packets for `message`, with the configured number of reply blocks
    /// appended to the text
    pub fn build_message(&mut self, message: &[u8], recipients: &[String]) -> MixResult<Vec<AssembledPacket>> {
        self.ensure_ready()?;
        let mut body = message.to_vec();
        if self.config.reply_blocks > 0 {
            let address = self
                .config
                .return_address
                .clone()
                .ok_or_else(|| MixError::MissingConfiguration("return address required for reply blocks".into()))?;
            for block in self.generate_reply_blocks(self.config.reply_blocks, &address)? {
                body.push(b'\n');
                body.extend_from_slice(block.to_armored().as_bytes());
            }
        }
        self.assembler()?.assemble_message(&body, recipients)
    }

    /// Packets answering the sender of `reply_blocks_text`
    pub fn build_reply(&self, message: &[u8], reply_blocks_text: &str) -> MixResult<Vec<AssembledPacket>> {
        self.ensure_ready()?;
        let blocks = ReplyBlock::parse_valid(reply_blocks_text, unix_now())?;
        self.assembler()?.assemble_reply_message(message, &blocks)
    }

    /// Build and send a forward message
    pub async fn send_message(&mut self, message: &[u8], recipients: &[String]) -> MixResult<SendReport> {
        let packets = self.build_message(message, recipients)?;
        Ok(self.send_packets(&packets).await)
    }

    /// Build and send a reply through the blocks in `reply_blocks_text`
    pub async fn send_reply(&self, message: &[u8], reply_blocks_text: &str) -> MixResult<SendReport> {
        let packets = self.build_reply(message, reply_blocks_text)?;
        Ok(self.send_packets(&packets).await)
    }

    /// Send each packet to its first hop
    pub async fn send_packets(&self, packets: &[AssembledPacket]) -> SendReport {
        let mut report = SendReport::default();
        for packet in packets {
            match self.transport.send_assembled(packet).await {
                Ok(true) => report.accepted += 1,
                Ok(false) => report.rejected += 1,
                Err(e) => {
                    warn!(relay = packet.first_hop.nickname(), error = %e, "sending packet failed");
                    report.failed += 1;
                }
            }
        }
        info!(?report, "message sent");
        report
    }

    /// Send a junk packet to a random relay
    pub async fn send_junk(&self) -> MixResult<bool> {
        self.ensure_ready()?;
        let relay = self.directory.random()?;
        self.transport.send_junk(relay.host(), relay.port()).await
    }

    /// Decode an armored reply addressed to one of our reply blocks
    pub fn decode(&self, text: &str) -> MixResult<DecodedReply> {
        self.decoder.decode(text)
    }

    /// Shutdown the client
    pub fn shutdown(&mut self) {
        self.state = ClientState::Stopped;
    }

    /// Known relays
    pub fn directory(&self) -> &DescriptorList {
        &self.directory
    }

    /// Keyring in use
    pub fn keyring(&self) -> &Keyring {
        self.decoder.keyring()
    }

    /// Client configuration
    pub fn config(&self) -> &RemailerConfig {
        &self.config
    }
}
