//! # RSA
//!
//! Packet keys are 2048-bit RSA keys exchanged as PKCS#1 DER. Header layers
//! are sealed with OAEP (SHA-1, MGF1-SHA-1) under a fixed label, which caps
//! each sealed block at [`PK_MAX_DATA`] bytes of plaintext.
//!
//! Signatures are PKCS#1 v1.5: unprefixed over the 36-byte `MD5 | SHA-1`
//! concatenation for TLS handshake messages, and DigestInfo-prefixed SHA-1
//! for certificates.

use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

use crate::hash::{hash, Digest20};

/// Size of one OAEP-sealed block
pub const PK_ENC_LEN: usize = 256;
/// OAEP padding overhead with SHA-1
pub const PK_OVERHEAD: usize = 42;
/// Largest plaintext that fits one sealed block
pub const PK_MAX_DATA: usize = PK_ENC_LEN - PK_OVERHEAD;
/// Packet key modulus size
pub const PK_BITS: usize = 2048;

/// OAEP label shared by every Type III implementation
pub const OAEP_LABEL: &str =
    "He who would make his own liberty secure, must guard even his enemy from oppression.";

/// Error types for public-key operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkError {
    /// Key material could not be parsed or encoded
    InvalidKey(String),
    /// Key is not the expected size
    WrongKeySize {
        /// Modulus size in bits
        bits: usize,
    },
    /// Plaintext too long for the key
    MessageTooLong {
        /// Plaintext length
        len: usize,
    },
    /// OAEP encryption failed
    EncryptionFailed(String),
    /// OAEP decryption or padding check failed
    DecryptionFailed,
    /// Signing failed
    SigningFailed(String),
    /// Signature did not verify
    BadSignature,
}

impl std::fmt::Display for PkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PkError::InvalidKey(msg) => write!(f, "Invalid RSA key: {}", msg),
            PkError::WrongKeySize { bits } => write!(f, "Unexpected RSA key size: {} bits", bits),
            PkError::MessageTooLong { len } => {
                write!(f, "Message of {} bytes too long for RSA key", len)
            }
            PkError::EncryptionFailed(msg) => write!(f, "RSA encryption failed: {}", msg),
            PkError::DecryptionFailed => write!(f, "RSA decryption failed"),
            PkError::SigningFailed(msg) => write!(f, "RSA signing failed: {}", msg),
            PkError::BadSignature => write!(f, "RSA signature verification failed"),
        }
    }
}

impl std::error::Error for PkError {}

fn oaep() -> Oaep {
    Oaep::new_with_label::<Sha1, _>(OAEP_LABEL)
}

/// RSA public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PublicKey {
    /// Parse a PKCS#1 `RSAPublicKey` DER structure
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, PkError> {
        RsaPublicKey::from_pkcs1_der(der)
            .map(|inner| Self { inner })
            .map_err(|e| PkError::InvalidKey(e.to_string()))
    }

    /// Encode as PKCS#1 DER
    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>, PkError> {
        self.inner
            .to_pkcs1_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| PkError::InvalidKey(e.to_string()))
    }

    /// SHA-1 of the DER encoding
    pub fn key_digest(&self) -> Result<Digest20, PkError> {
        Ok(hash(&self.to_pkcs1_der()?))
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.inner.size() * 8
    }

    /// Modulus size in bytes
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// OAEP-encrypt `data` with the Type III label
    pub fn oaep_encrypt(&self, data: &[u8]) -> Result<Vec<u8>, PkError> {
        if data.len() > self.size() - PK_OVERHEAD {
            return Err(PkError::MessageTooLong { len: data.len() });
        }
        self.inner
            .encrypt(&mut OsRng, oaep(), data)
            .map_err(|e| PkError::EncryptionFailed(e.to_string()))
    }

    /// Verify an unprefixed PKCS#1 v1.5 signature over a raw digest
    pub fn verify_raw(&self, digest: &[u8], signature: &[u8]) -> Result<(), PkError> {
        self.inner
            .verify(Pkcs1v15Sign::new_unprefixed(), digest, signature)
            .map_err(|_| PkError::BadSignature)
    }

    /// Verify a SHA-1 PKCS#1 v1.5 signature over `message`
    pub fn verify_sha1(&self, message: &[u8], signature: &[u8]) -> Result<(), PkError> {
        let digest = Sha1::digest(message);
        self.inner
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .map_err(|_| PkError::BadSignature)
    }
}

/// RSA private key
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bits", &(self.inner.size() * 8))
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    /// Generate a fresh key of `bits` bits
    pub fn generate(bits: usize) -> Result<Self, PkError> {
        RsaPrivateKey::new(&mut OsRng, bits)
            .map(|inner| Self { inner })
            .map_err(|e| PkError::InvalidKey(e.to_string()))
    }

    /// Parse a PEM `RSA PRIVATE KEY` block
    pub fn from_pkcs1_pem(pem: &str) -> Result<Self, PkError> {
        RsaPrivateKey::from_pkcs1_pem(pem)
            .map(|inner| Self { inner })
            .map_err(|e| PkError::InvalidKey(e.to_string()))
    }

    /// Parse a PKCS#1 `RSAPrivateKey` DER structure
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, PkError> {
        RsaPrivateKey::from_pkcs1_der(der)
            .map(|inner| Self { inner })
            .map_err(|e| PkError::InvalidKey(e.to_string()))
    }

    /// Encode as PKCS#1 DER; the buffer is wiped on drop
    pub fn to_pkcs1_der(&self) -> Result<Zeroizing<Vec<u8>>, PkError> {
        self.inner
            .to_pkcs1_der()
            .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
            .map_err(|e| PkError::InvalidKey(e.to_string()))
    }

    /// Matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.to_public_key(),
        }
    }

    /// Reverse [`PublicKey::oaep_encrypt`]
    pub fn oaep_decrypt(&self, data: &[u8]) -> Result<Vec<u8>, PkError> {
        self.inner
            .decrypt(oaep(), data)
            .map_err(|_| PkError::DecryptionFailed)
    }

    /// Unprefixed PKCS#1 v1.5 signature over a raw digest
    pub fn sign_raw(&self, digest: &[u8]) -> Result<Vec<u8>, PkError> {
        self.inner
            .sign(Pkcs1v15Sign::new_unprefixed(), digest)
            .map_err(|e| PkError::SigningFailed(e.to_string()))
    }

    /// SHA-1 PKCS#1 v1.5 signature over `message`
    pub fn sign_sha1(&self, message: &[u8]) -> Result<Vec<u8>, PkError> {
        let digest = Sha1::digest(message);
        self.inner
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| PkError::SigningFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = include_str!("../tests/fixtures/rsa2048.pem");

    fn test_key() -> PrivateKey {
        PrivateKey::from_pkcs1_pem(TEST_KEY).unwrap()
    }

    #[test]
    fn test_oaep_roundtrip_max_data() {
        let key = test_key();
        let public = key.public_key();
        assert_eq!(public.bits(), PK_BITS);

        let data = [0x5Au8; PK_MAX_DATA];
        let sealed = public.oaep_encrypt(&data).unwrap();
        assert_eq!(sealed.len(), PK_ENC_LEN);
        assert_eq!(key.oaep_decrypt(&sealed).unwrap(), data);
    }

    #[test]
    fn test_oaep_rejects_oversized() {
        let public = test_key().public_key();
        assert_eq!(
            public.oaep_encrypt(&[0u8; PK_MAX_DATA + 1]),
            Err(PkError::MessageTooLong { len: PK_MAX_DATA + 1 })
        );
    }

    #[test]
    fn test_oaep_tamper_detected() {
        let key = test_key();
        let mut sealed = key.public_key().oaep_encrypt(b"sub-header").unwrap();
        sealed[100] ^= 0x01;
        assert_eq!(key.oaep_decrypt(&sealed), Err(PkError::DecryptionFailed));
    }

    #[test]
    fn test_der_roundtrip_and_digest() {
        let public = test_key().public_key();
        let der = public.to_pkcs1_der().unwrap();
        let parsed = PublicKey::from_pkcs1_der(&der).unwrap();
        assert_eq!(parsed, public);
        assert_eq!(parsed.key_digest().unwrap(), hash(&der));
        assert!(PublicKey::from_pkcs1_der(&der[1..]).is_err());
    }

    #[test]
    fn test_signatures() {
        let key = test_key();
        let public = key.public_key();

        let digest = [0x24u8; 36];
        let sig = key.sign_raw(&digest).unwrap();
        assert!(public.verify_raw(&digest, &sig).is_ok());
        assert_eq!(public.verify_raw(&[0u8; 36], &sig), Err(PkError::BadSignature));

        let sig = key.sign_sha1(b"certificate body").unwrap();
        assert!(public.verify_sha1(b"certificate body", &sig).is_ok());
        assert!(public.verify_sha1(b"other body", &sig).is_err());
    }
}
