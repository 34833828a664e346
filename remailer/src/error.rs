//! Error types for the remailer
//!
//! Parse errors are recoverable by discarding the offending input; protocol
//! errors close the connection they occurred on. A fragment set that is not
//! complete yet is a state, not an error, see [`crate::fragment::FragmentStatus`].

use libmix_crypto::{CompressError, FecError, PkError, RandomError, SprpError};
use thiserror::Error;

/// Result type for remailer operations
pub type MixResult<T> = Result<T, MixError>;

/// Remailer error types
#[derive(Debug, Error)]
pub enum MixError {
    // ========== Parse Errors ==========

    /// Malformed directory record
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Malformed reply block
    #[error("Invalid reply block: {0}")]
    InvalidReplyBlock(String),

    /// Malformed record header or record body
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Header failed to parse or verify
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Payload failed to parse or verify
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Unknown routing type code
    #[error("Unknown routing type: {0:#06x}")]
    UnknownRoutingType(u16),

    /// Malformed keyring
    #[error("Invalid keyring: {0}")]
    InvalidKeyring(String),

    /// Base64 decoding failed
    #[error("Base64 decoding failed: {0}")]
    Base64(String),

    // ========== Crypto Errors ==========

    /// Primitive operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Keyring password did not verify
    #[error("Wrong keyring password")]
    WrongPassword,

    // ========== Path Errors ==========

    /// Path has no hops
    #[error("Empty path")]
    EmptyPath,

    /// Too many hops for one header
    #[error("Path too long: {0} hops (max {1})")]
    PathTooLong(usize, usize),

    /// Fewer hops than the message type needs
    #[error("Path too short: {0} hops (min {1})")]
    PathTooShort(usize, usize),

    /// Secrets and hops out of step
    #[error("Path has {path} hops but {secrets} secrets")]
    SecretCountMismatch {
        /// Hops in the path
        path: usize,
        /// Secrets supplied
        secrets: usize,
    },

    /// A hop cannot be addressed
    #[error("Relay {0} has no packet key")]
    MissingPacketKey(String),

    /// Routing body does not fit the sealed part of a sub-header
    #[error("Routing information too long: {0} bytes (max {1})")]
    RoutingTooLong(usize, usize),

    /// Sub-headers exceed the header
    #[error("Sub-headers need {0} bytes, header holds {1}")]
    HeaderOverflow(usize, usize),

    /// Directory cannot supply the requested path
    #[error("No path available: {0}")]
    NoPath(String),

    // ========== Message Errors ==========

    /// Recipient list unusable
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Not enough reply blocks for the parts of a reply
    #[error("Need {needed} reply blocks, have {available}")]
    NotEnoughReplyBlocks {
        /// Parts to send
        needed: usize,
        /// Blocks supplied
        available: usize,
    },

    /// Reply block is past its expiry
    #[error("Reply block expired")]
    ReplyBlockExpired,

    /// Fragment set already handed out
    #[error("Fragments already reassembled")]
    AlreadyReassembled,

    // ========== Protocol Errors ==========

    /// Handshake or framing violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message arrived out of order
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Peer sent a fatal alert
    #[error("Received alert: level {level}, description {description}")]
    Alert {
        /// Alert level
        level: u8,
        /// Alert description code
        description: u8,
    },

    /// Record MAC or padding did not verify
    #[error("Bad record MAC")]
    BadRecordMac,

    /// Finished message did not verify
    #[error("Finished verification failed")]
    BadFinished,

    /// Certificate chain rejected
    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    /// Signature did not verify
    #[error("Signature verification failed: {0}")]
    BadSignature(String),

    /// Acknowledgement hash did not match
    #[error("Acknowledgement mismatch: {0}")]
    BadAcknowledgement(String),

    // ========== Connection Errors ==========

    /// Operation did not finish in time
    #[error("Operation timed out")]
    Timeout,

    /// Connection closed while an operation was pending
    #[error("Connection closed")]
    ConnectionClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    // ========== Configuration Errors ==========

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Missing configuration
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    // ========== Internal Errors ==========

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Key pool produced nothing in time
    #[error("Key pool exhausted")]
    KeyPoolExhausted,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl MixError {
    /// Bad input that can be dropped without further consequence
    pub fn is_parse_error(&self) -> bool {
        matches!(self,
            MixError::InvalidDescriptor(_) |
            MixError::InvalidReplyBlock(_) |
            MixError::InvalidRecord(_) |
            MixError::InvalidHeader(_) |
            MixError::InvalidPayload(_) |
            MixError::UnknownRoutingType(_) |
            MixError::InvalidKeyring(_) |
            MixError::Base64(_)
        )
    }

    /// Errors after which the connection they happened on must be closed
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self,
            MixError::Protocol(_) |
            MixError::UnexpectedMessage(_) |
            MixError::InvalidRecord(_) |
            MixError::Alert { .. } |
            MixError::BadRecordMac |
            MixError::BadFinished |
            MixError::CertificateRejected(_) |
            MixError::BadSignature(_) |
            MixError::BadAcknowledgement(_) |
            MixError::Timeout |
            MixError::ConnectionClosed |
            MixError::Io(_)
        )
    }
}

impl From<std::io::Error> for MixError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                MixError::ConnectionClosed
            }
            std::io::ErrorKind::TimedOut => MixError::Timeout,
            _ => MixError::Io(e.to_string()),
        }
    }
}

impl From<base64::DecodeError> for MixError {
    fn from(e: base64::DecodeError) -> Self {
        MixError::Base64(e.to_string())
    }
}

impl From<SprpError> for MixError {
    fn from(e: SprpError) -> Self {
        MixError::Crypto(e.to_string())
    }
}

impl From<FecError> for MixError {
    fn from(e: FecError) -> Self {
        MixError::InvalidPayload(e.to_string())
    }
}

impl From<CompressError> for MixError {
    fn from(e: CompressError) -> Self {
        MixError::InvalidPayload(e.to_string())
    }
}

impl From<PkError> for MixError {
    fn from(e: PkError) -> Self {
        match e {
            PkError::BadSignature => MixError::BadSignature(e.to_string()),
            PkError::DecryptionFailed => MixError::InvalidHeader(e.to_string()),
            other => MixError::Crypto(other.to_string()),
        }
    }
}

impl From<RandomError> for MixError {
    fn from(e: RandomError) -> Self {
        MixError::Crypto(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MixError::Protocol("no supported ciphersuite found".into());
        assert_eq!(err.to_string(), "Protocol error: no supported ciphersuite found");

        let err = MixError::PathTooLong(17, 16);
        assert_eq!(err.to_string(), "Path too long: 17 hops (max 16)");
    }

    #[test]
    fn test_is_parse_error() {
        assert!(MixError::InvalidDescriptor("missing Packet-Key".into()).is_parse_error());
        assert!(MixError::UnknownRoutingType(0x0999).is_parse_error());
        assert!(!MixError::Timeout.is_parse_error());
    }

    #[test]
    fn test_is_fatal_to_connection() {
        assert!(MixError::BadRecordMac.is_fatal_to_connection());
        assert!(MixError::Alert { level: 2, description: 40 }.is_fatal_to_connection());
        assert!(!MixError::InvalidReplyBlock("quoted".into()).is_fatal_to_connection());
    }

    #[test]
    fn test_io_conversion() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(MixError::from(eof), MixError::ConnectionClosed));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(MixError::from(other), MixError::Io(_)));
    }

    #[test]
    fn test_crypto_conversion() {
        let err: MixError = PkError::BadSignature.into();
        assert!(matches!(err, MixError::BadSignature(_)));

        let err: MixError = SprpError::BlockTooShort { len: 3 }.into();
        assert!(matches!(err, MixError::Crypto(_)));
    }
}
