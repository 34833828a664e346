//! Alert records

use crate::{MixError, MixResult};

/// Alert level: warning
pub const WARNING: u8 = 1;
/// Alert level: fatal
pub const FATAL: u8 = 2;

/// close_notify
pub const CLOSE_NOTIFY: u8 = 0;
/// unexpected_message
pub const UNEXPECTED_MESSAGE: u8 = 10;
/// bad_record_mac
pub const BAD_RECORD_MAC: u8 = 20;
/// handshake_failure
pub const HANDSHAKE_FAILURE: u8 = 40;
/// bad_certificate
pub const BAD_CERTIFICATE: u8 = 42;
/// illegal_parameter
pub const ILLEGAL_PARAMETER: u8 = 47;
/// decode_error
pub const DECODE_ERROR: u8 = 50;
/// decrypt_error
pub const DECRYPT_ERROR: u8 = 51;
/// internal_error
pub const INTERNAL_ERROR: u8 = 80;

/// An alert record body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    /// [`WARNING`] or [`FATAL`]
    pub level: u8,
    /// Description code
    pub description: u8,
}

impl Alert {
    /// Graceful shutdown notice
    pub fn close_notify() -> Self {
        Self { level: WARNING, description: CLOSE_NOTIFY }
    }

    /// Fatal alert with `description`
    pub fn fatal(description: u8) -> Self {
        Self { level: FATAL, description }
    }

    /// Fatal alert telling the peer why we are giving up
    pub fn for_error(error: &MixError) -> Self {
        let description = match error {
            MixError::UnexpectedMessage(_) => UNEXPECTED_MESSAGE,
            MixError::BadRecordMac => BAD_RECORD_MAC,
            MixError::CertificateRejected(_) => BAD_CERTIFICATE,
            MixError::BadSignature(_) | MixError::BadFinished => DECRYPT_ERROR,
            MixError::InvalidRecord(_) => DECODE_ERROR,
            MixError::Protocol(_) => HANDSHAKE_FAILURE,
            _ => INTERNAL_ERROR,
        };
        Self::fatal(description)
    }

    /// Wire form
    pub fn encode(&self) -> [u8; 2] {
        [self.level, self.description]
    }

    /// Parse an alert record body
    pub fn parse(data: &[u8]) -> MixResult<Self> {
        match data {
            [level, description] => Ok(Self { level: *level, description: *description }),
            _ => Err(MixError::InvalidRecord(format!("alert body is {} bytes", data.len()))),
        }
    }

    /// Warning-level close_notify
    pub fn is_close_notify(&self) -> bool {
        self.level == WARNING && self.description == CLOSE_NOTIFY
    }

    /// Error for an alert that aborts the connection
    pub fn into_error(self) -> MixError {
        MixError::Alert { level: self.level, description: self.description }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_notify() {
        let alert = Alert::parse(&Alert::close_notify().encode()).unwrap();
        assert!(alert.is_close_notify());
        // a fatal close_notify is still fatal
        assert!(!Alert::fatal(CLOSE_NOTIFY).is_close_notify());
        assert!(!Alert { level: WARNING, description: BAD_CERTIFICATE }.is_close_notify());
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(Alert::parse(&[2]).is_err());
        assert!(Alert::parse(&[2, 40, 0]).is_err());
    }

    #[test]
    fn test_for_error() {
        assert_eq!(Alert::for_error(&MixError::BadRecordMac), Alert::fatal(BAD_RECORD_MAC));
        assert_eq!(
            Alert::for_error(&MixError::Protocol("no supported ciphersuite found".into())),
            Alert::fatal(HANDSHAKE_FAILURE)
        );
        assert!(matches!(
            Alert::fatal(HANDSHAKE_FAILURE).into_error(),
            MixError::Alert { level: FATAL, description: HANDSHAKE_FAILURE }
        ));
    }
}
