//! Remailer: Type III anonymous message client
//!
//! A Mixminion-style remailer stack: messages are compressed, split into
//! fixed-size payloads, wrapped in two onion headers and handed to the first
//! relay of a randomly chosen path over MMTP.
//!
//! # Architecture
//!
//! The crate is organised in layers:
//!
//! 1. **Directory** - Relay descriptors parsed from directory text, path selection
//! 2. **Headers** - 2048-byte onion headers, one RSA-sealed sub-header per hop
//! 3. **Payloads** - Singleton payloads and erasure-coded fragments
//! 4. **Replies** - Single-use reply blocks, keyring and reply decoding
//! 5. **Assembly** - Two-leg packets with the swap-point "hide" step
//! 6. **Transport** - MMTP over a TLS 1.0 record and handshake layer
//!
//! # Key Concepts
//!
//! - **Hop**: One relay on a path
//! - **Leg**: Half of a path; the first leg ends at the crossover relay
//! - **Packet**: Fixed 32768 bytes: header 1, header 2, payload
//! - **Reply block**: A pre-built return header with its shared secret
//! - **Decoding handle**: The tag a reply block owner recognises replies by
//!
//! # Example
//!
//! ```ignore
//! use remailer::prelude::*;
//!
//! let config = RemailerConfig::load(path)?;
//! let mut client = RemailerClient::new(config)?;
//! client.bootstrap(password)?;
//!
//! // Build packets for one recipient and hand them to the first hops
//! let report = client.send_message(b"Subject: hi\n\nhello", &["bob@example.org".into()]).await?;
//!
//! // Reply blocks the recipient can answer through
//! let blocks = client.generate_reply_blocks(2, "me@example.org")?;
//! client.save_keyring(password)?;
//! ```

pub mod error;
pub mod config;
pub mod armor;
pub mod routing;
pub mod descriptor;
pub mod directory;
pub mod header;
pub mod relay;
pub mod payload;
pub mod fragment;
pub mod reply_block;
pub mod keyring;
pub mod decoder;
pub mod assembler;
pub mod key_pool;
pub mod guard;
pub mod tls;
pub mod transport;
pub mod client;

pub use error::{MixError, MixResult};
pub use config::RemailerConfig;
pub use client::{RemailerClient, SendReport};
pub use routing::{ExitInformation, HostRoute, Routing, RoutingInformation};
pub use descriptor::RoutingDescriptor;
pub use directory::DescriptorList;
pub use header::{Header, HeaderBuilder, HeaderProcessor};
pub use fragment::{FragmentContainer, FragmentEngine, FragmentOutcome, FragmentPool, FragmentStatus, Reassembly};
pub use reply_block::ReplyBlock;
pub use keyring::Keyring;
pub use decoder::{DecodedReply, ReplyDecoder};
pub use assembler::{AssembledPacket, MessageAssembler};
pub use key_pool::{KeyPool, OsSecrets, SecretSource};
pub use guard::CloseGuard;
pub use transport::{MmtpClient, MmtpConnection, PacketSink};
pub use tls::{TlsConfig, TlsIdentity, TlsStream};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        MixError, MixResult, RemailerConfig, RemailerClient, SendReport,
        ExitInformation, Routing, RoutingInformation,
        RoutingDescriptor, DescriptorList,
        Header, HeaderBuilder, HeaderProcessor,
        FragmentEngine, FragmentPool, FragmentStatus, Reassembly,
        ReplyBlock, Keyring, ReplyDecoder, DecodedReply,
        AssembledPacket, MessageAssembler,
        KeyPool, SecretSource, CloseGuard,
        MmtpClient, PacketSink, TlsConfig,
    };
}

/// Wire packet size
pub const PACKET_SIZE: usize = 32768;

/// Size of one onion header
pub const HEADER_LEN: usize = 2048;

/// Payload size (packet minus two headers)
pub const PAYLOAD_LEN: usize = PACKET_SIZE - 2 * HEADER_LEN;

/// Maximum hops in one header
pub const MAX_HOPS: usize = 16;

/// Minimum total hops of a forward message
pub const MIN_HOPS: usize = 2;

/// Default total hops of a forward message
pub const DEFAULT_HOPS: usize = 4;

/// Per-hop master secret size
pub const SECRET_LEN: usize = 16;

/// Reply blocks stay valid for this long (seconds)
pub const REPLY_BLOCK_LIFETIME: u64 = 90 * 24 * 60 * 60;

/// Current Unix time in seconds
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_keys {
    //! Fixture relay keys shared by the unit tests
    use libmix_crypto::PrivateKey;

    const RELAY_PEMS: [&str; 4] = [
        include_str!("../tests/fixtures/relay1.pem"),
        include_str!("../tests/fixtures/relay2.pem"),
        include_str!("../tests/fixtures/relay3.pem"),
        include_str!("../tests/fixtures/relay4.pem"),
    ];

    pub const TLS_ROOT_PEM: &str = include_str!("../tests/fixtures/tls_root.pem");
    pub const TLS_SERVER_PEM: &str = include_str!("../tests/fixtures/tls_server.pem");

    /// Private key of fixture relay `i` (0..4)
    pub fn relay_key(i: usize) -> PrivateKey {
        PrivateKey::from_pkcs1_pem(RELAY_PEMS[i]).unwrap()
    }

    pub fn tls_root() -> PrivateKey {
        PrivateKey::from_pkcs1_pem(TLS_ROOT_PEM).unwrap()
    }

    pub fn tls_server() -> PrivateKey {
        PrivateKey::from_pkcs1_pem(TLS_SERVER_PEM).unwrap()
    }
}
