//! TLS 1.0 Layer
//!
//! The record and handshake subset relays speak: DHE-RSA key exchange over
//! the Oakley group 2 prime, AES-CBC or 3DES-CBC records with HMAC-SHA1,
//! and X.509 certificates signed with sha1WithRSAEncryption.
//!
//! # Record Format
//!
//! ```text
//! +---------+-------------+------------+----------------------+
//! | Type(1) | Version(2)  | Length(2)  | Payload (Length)     |
//! +---------+-------------+------------+----------------------+
//! ```
//!
//! # Handshake
//!
//! ```text
//! Initiator                                  Responder
//!   ClientHello            -------->
//!                                             ServerHello
//!                                             Certificate
//!                                             ServerKeyExchange
//!                                             CertificateRequest*
//!                          <--------          ServerHelloDone
//!   Certificate*
//!   ClientKeyExchange
//!   CertificateVerify*
//!   [ChangeCipherSpec]
//!   Finished               -------->
//!                                             [ChangeCipherSpec]
//!                          <--------          Finished
//! ```

pub mod alert;
pub mod cert;
pub mod cipher_suite;
pub mod dh;
pub mod handshake;
pub mod messages;
pub mod prf;
pub mod record;

pub use alert::Alert;
pub use cert::{verify_chain, Certificate};
pub use cipher_suite::{CipherState, CipherSuite};
pub use handshake::{HandshakeState, TlsConfig, TlsIdentity, TlsStream};
pub use record::{ContentType, RecordHeader, RecordLayer};

/// TLS 1.0
pub const PROTOCOL_VERSION: [u8; 2] = [0x03, 0x01];

/// Record header size
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext fragment
pub const MAX_PLAINTEXT: usize = 1 << 14;

/// Largest protected fragment
pub const MAX_CIPHERTEXT: usize = MAX_PLAINTEXT + 2048;

/// Hello random size
pub const RANDOM_LEN: usize = 32;

/// Which side of the handshake this end plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends ClientHello
    Initiator,
    /// Answers with ServerHello
    Responder,
}

impl Role {
    /// The other side
    pub fn peer(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}
