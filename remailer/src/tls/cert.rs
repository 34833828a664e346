//! X.509 Certificates
//!
//! Relays present DER certificates binding a common name to an RSA key,
//! signed with sha1WithRSAEncryption (PKCS#1 v1.5 over SHA-1). Only the
//! fields the handshake needs are interpreted: subject and issuer common
//! names, the validity window and the subject key.
//!
//! Chains are ordered leaf first; each certificate must verify under the
//! key of the next, and the last under the trusted root.

use std::time::{Duration, SystemTime};

use libmix_crypto::{random_bytes, PrivateKey, PublicKey};
use tracing::debug;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::der::asn1::{BitString, SetOfVec, UtcTime};
use x509_cert::der::{Any, Decode, Encode, Tag, Tagged};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, ObjectIdentifier, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate as X509Certificate;

use crate::armor;
use crate::{MixError, MixResult};

const PUBLIC_KEY_BEGIN: &str = "-----BEGIN RSA PUBLIC KEY-----";
const PUBLIC_KEY_END: &str = "-----END RSA PUBLIC KEY-----";

const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const SHA1_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");

/// Validity period of certificates we issue
pub const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Clock disagreement tolerated at either end of a validity window
pub const CLOCK_SKEW: Duration = Duration::from_secs(60 * 60);

/// A subject key signed by an issuer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    inner: X509Certificate,
    der: Vec<u8>,
    tbs_der: Vec<u8>,
    subject: String,
    issuer: String,
    public_key: PublicKey,
}

impl Certificate {
    /// Certify `key` for `subject`, signed by `issuer_key`
    pub fn issue(subject: &str, key: &PublicKey, issuer: &str, issuer_key: &PrivateKey) -> MixResult<Self> {
        Self::issue_at(subject, key, issuer, issuer_key, SystemTime::now(), CERTIFICATE_LIFETIME)
    }

    /// Certificate valid from `not_before` for `lifetime`
    pub fn issue_at(
        subject: &str,
        key: &PublicKey,
        issuer: &str,
        issuer_key: &PrivateKey,
        not_before: SystemTime,
        lifetime: Duration,
    ) -> MixResult<Self> {
        let mut serial = random_bytes::<8>()?;
        serial[0] = (serial[0] & 0x7f) | 0x01;

        let not_after = not_before
            .checked_add(lifetime)
            .ok_or_else(|| MixError::Crypto("certificate lifetime out of range".into()))?;
        let validity = Validity { not_before: utc_time(not_before)?, not_after: utc_time(not_after)? };
        let subject_public_key_info = SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned { oid: RSA_ENCRYPTION, parameters: Some(Any::null()) },
            subject_public_key: BitString::from_bytes(&key.to_pkcs1_der()?).map_err(encode_error)?,
        };
        let tbs_certificate = TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&serial).map_err(encode_error)?,
            signature: sha1_with_rsa(),
            issuer: common_name(issuer)?,
            validity,
            subject: common_name(subject)?,
            subject_public_key_info,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
        };

        let tbs_der = tbs_certificate.to_der().map_err(encode_error)?;
        let signature = issuer_key.sign_sha1(&tbs_der)?;
        let inner = X509Certificate {
            tbs_certificate,
            signature_algorithm: sha1_with_rsa(),
            signature: BitString::from_bytes(&signature).map_err(encode_error)?,
        };
        let der = inner.to_der().map_err(encode_error)?;
        Ok(Self {
            inner,
            der,
            tbs_der,
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            public_key: key.clone(),
        })
    }

    /// Certificate signed by its own key
    pub fn self_signed(subject: &str, key: &PrivateKey) -> MixResult<Self> {
        Self::issue(subject, &key.public_key(), subject, key)
    }

    /// Subject common name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer common name
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Certified key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Start of the validity window
    pub fn not_before(&self) -> SystemTime {
        self.inner.tbs_certificate.validity.not_before.to_system_time()
    }

    /// End of the validity window
    pub fn not_after(&self) -> SystemTime {
        self.inner.tbs_certificate.validity.not_after.to_system_time()
    }

    /// Whether `issuer_key` signed this certificate
    pub fn verify_signed_by(&self, issuer_key: &PublicKey) -> MixResult<()> {
        let outer = &self.inner.signature_algorithm.oid;
        if *outer != SHA1_WITH_RSA || self.inner.tbs_certificate.signature.oid != *outer {
            return Err(MixError::CertificateRejected(format!(
                "{} is signed with unsupported algorithm {}",
                self.subject, outer
            )));
        }
        let signature = self
            .inner
            .signature
            .as_bytes()
            .ok_or_else(|| MixError::CertificateRejected(format!("malformed signature on {}", self.subject)))?;
        issuer_key
            .verify_sha1(&self.tbs_der, signature)
            .map_err(|_| MixError::CertificateRejected(format!("bad signature on {}", self.subject)))
    }

    /// Reject a certificate used outside its validity window
    pub fn check_validity(&self, now: SystemTime) -> MixResult<()> {
        if now + CLOCK_SKEW < self.not_before() {
            return Err(MixError::CertificateRejected(format!("{} is not yet valid", self.subject)));
        }
        if self.not_after() + CLOCK_SKEW < now {
            return Err(MixError::CertificateRejected(format!("{} has expired", self.subject)));
        }
        Ok(())
    }

    /// DER encoding
    pub fn encode(&self) -> Vec<u8> {
        self.der.clone()
    }

    /// Parse a DER certificate
    pub fn decode(data: &[u8]) -> MixResult<Self> {
        let inner = X509Certificate::from_der(data).map_err(decode_error)?;
        let tbs = &inner.tbs_certificate;

        let spki = &tbs.subject_public_key_info;
        if spki.algorithm.oid != RSA_ENCRYPTION {
            return Err(MixError::InvalidRecord(format!("certificate key algorithm {} is not RSA", spki.algorithm.oid)));
        }
        let key_der = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| MixError::InvalidRecord("certificate key has unused bits".into()))?;
        let public_key = PublicKey::from_pkcs1_der(key_der)
            .map_err(|e| MixError::InvalidRecord(format!("certificate key: {}", e)))?;

        let subject = name_text(&tbs.subject)?;
        let issuer = name_text(&tbs.issuer)?;
        let tbs_der = tbs.to_der().map_err(decode_error)?;
        Ok(Self { der: data.to_vec(), tbs_der, subject, issuer, public_key, inner })
    }
}

fn utc_time(t: SystemTime) -> MixResult<Time> {
    Ok(Time::UtcTime(UtcTime::from_system_time(t).map_err(encode_error)?))
}

fn sha1_with_rsa() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned { oid: SHA1_WITH_RSA, parameters: Some(Any::null()) }
}

/// Name holding a single UTF-8 common name
fn common_name(text: &str) -> MixResult<Name> {
    let value = Any::new(Tag::Utf8String, text.as_bytes()).map_err(encode_error)?;
    let rdn = SetOfVec::try_from(vec![AttributeTypeAndValue { oid: COMMON_NAME, value }]).map_err(encode_error)?;
    Ok(RdnSequence(vec![RelativeDistinguishedName(rdn)]))
}

/// First common name in `name`
fn name_text(name: &Name) -> MixResult<String> {
    let value = name
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == COMMON_NAME)
        .map(|atv| &atv.value)
        .ok_or_else(|| MixError::InvalidRecord("certificate name has no common name".into()))?;
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String => String::from_utf8(value.value().to_vec())
            .map_err(|_| MixError::InvalidRecord("certificate name is not UTF-8".into())),
        tag => Err(MixError::InvalidRecord(format!("certificate name is a {}", tag))),
    }
}

fn decode_error(e: x509_cert::der::Error) -> MixError {
    MixError::InvalidRecord(format!("certificate: {}", e))
}

fn encode_error(e: x509_cert::der::Error) -> MixError {
    MixError::Crypto(format!("encoding certificate: {}", e))
}

/// Check a leaf-first chain. With `check_root` the last certificate must be
/// signed by `root`; without it only the links inside the chain are checked.
pub fn verify_chain(chain: &[Certificate], root: Option<&PublicKey>, check_root: bool) -> MixResult<()> {
    let last = chain
        .last()
        .ok_or_else(|| MixError::CertificateRejected("empty certificate chain".into()))?;

    let now = SystemTime::now();
    for cert in chain {
        cert.check_validity(now)?;
    }
    for pair in chain.windows(2) {
        pair[0].verify_signed_by(pair[1].public_key())?;
    }

    if check_root {
        let root = root.ok_or_else(|| MixError::CertificateRejected("no trusted root configured".into()))?;
        last.verify_signed_by(root)?;
    }
    debug!(len = chain.len(), subject = chain[0].subject(), check_root, "certificate chain accepted");
    Ok(())
}

/// Read a PKCS#1 public key in PEM armor
pub fn public_key_from_pem(text: &str) -> MixResult<PublicKey> {
    let body = text
        .lines()
        .skip_while(|l| l.trim() != PUBLIC_KEY_BEGIN)
        .skip(1)
        .take_while(|l| l.trim() != PUBLIC_KEY_END);
    let der = armor::decode(body)?;
    if der.is_empty() {
        return Err(MixError::InvalidConfiguration("no RSA public key found".into()));
    }
    Ok(PublicKey::from_pkcs1_der(&der)?)
}

/// PEM armor of a PKCS#1 public key
pub fn public_key_to_pem(key: &PublicKey) -> MixResult<String> {
    Ok(format!("{}\n{}\n{}\n", PUBLIC_KEY_BEGIN, armor::encode(&key.to_pkcs1_der()?), PUBLIC_KEY_END))
}
