//! Handshake State Machine
//!
//! One state machine drives both ends; [`Role`] picks which flight each
//! step sends or expects. Until the handshake completes every read is
//! bounded by the setup timeout, afterwards by the idle timeout.

use std::path::Path;
use std::time::Duration;

use libmix_crypto::{random_bytes, PrivateKey, PublicKey};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::alert::Alert;
use super::cert::{public_key_from_pem, verify_chain, Certificate};
use super::cipher_suite::{negotiate, CipherState, CipherSuite};
use super::dh::DhGroup;
use super::messages::{DhParams, HandshakeMessage, HandshakeReader};
use super::prf::{finished, key_block, master_secret, md5_sha1, KeyBlock, CLIENT_FINISHED, SERVER_FINISHED};
use super::record::{ContentType, RecordLayer};
use super::{Role, RANDOM_LEN};
use crate::config::{TlsSettings, TransportConfig};
use crate::guard::CloseGuard;
use crate::{MixError, MixResult};

const CHANGE_CIPHER_SPEC: [u8; 1] = [1];

/// Subject used for a client certificate when none is configured
const DEFAULT_CLIENT_SUBJECT: &str = "remailer client";

/// Progress of a connection.
///
/// Both roles walk the same states. The responder enters `ClientHelloSent`
/// once the peer's ClientHello has arrived and `ServerHelloReceived` once
/// its own hello flight is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet
    Start,
    /// ClientHello on the wire
    ClientHelloSent,
    /// ServerHello processed, suite chosen
    ServerHelloReceived,
    /// Peer certificate chain accepted
    CertificateVerified,
    /// Premaster secret agreed
    KeyExchanged,
    /// Our Finished sent under the new keys
    ChangeCipherSpecSent,
    /// Both Finished messages checked, application data may flow
    Finished,
    /// Closed, gracefully or not
    Closed,
}

/// Key and certificate chain presented to peers
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// Signing key matching the leaf certificate
    pub key: PrivateKey,
    /// Chain, leaf first
    pub chain: Vec<Certificate>,
}

impl TlsIdentity {
    /// Identity with an issued chain
    pub fn new(key: PrivateKey, chain: Vec<Certificate>) -> MixResult<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| MixError::InvalidConfiguration("identity needs a certificate".into()))?;
        if *leaf.public_key() != key.public_key() {
            return Err(MixError::InvalidConfiguration("leaf certificate does not match the key".into()));
        }
        Ok(Self { key, chain })
    }

    /// Identity with a single self-signed certificate
    pub fn self_signed(subject: &str, key: PrivateKey) -> MixResult<Self> {
        let cert = Certificate::self_signed(subject, &key)?;
        Ok(Self { key, chain: vec![cert] })
    }
}

/// Handshake parameters
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Suites offered or accepted, most preferred first
    pub cipher_suites: Vec<CipherSuite>,
    /// Require the peer chain to end at `trusted_root`
    pub check_root: bool,
    /// Trusted root key
    pub trusted_root: Option<PublicKey>,
    /// Our key and chain; required to accept connections
    pub identity: Option<TlsIdentity>,
    /// Ask initiators for a certificate
    pub request_client_cert: bool,
    /// Deadline for each read during the handshake
    pub setup_timeout: Duration,
    /// Deadline for each read once established
    pub idle_timeout: Duration,
}

impl Default for TlsConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            cipher_suites: vec![
                CipherSuite::DheRsaAes256CbcSha,
                CipherSuite::DheRsaAes128CbcSha,
                CipherSuite::DheRsa3desEdeCbcSha,
            ],
            check_root: false,
            trusted_root: None,
            identity: None,
            request_client_cert: false,
            setup_timeout: transport.setup_timeout,
            idle_timeout: transport.idle_timeout,
        }
    }
}

impl TlsConfig {
    /// Build from the file-based settings, reading any key files they name
    pub fn from_settings(transport: &TransportConfig, tls: &TlsSettings) -> MixResult<Self> {
        let mut cipher_suites = Vec::new();
        for &code in &transport.cipher_suites {
            match CipherSuite::from_code(code) {
                Some(suite) if !cipher_suites.contains(&suite) => cipher_suites.push(suite),
                Some(_) => {}
                None => warn!(code, "ignoring unsupported cipher suite"),
            }
        }
        if cipher_suites.is_empty() {
            return Err(MixError::InvalidConfiguration("no supported cipher suite configured".into()));
        }

        let trusted_root = tls
            .trusted_root
            .as_deref()
            .map(|path| public_key_from_pem(&read_config_file(path)?))
            .transpose()?;

        let identity = match &tls.client_key {
            Some(path) => {
                let key = PrivateKey::from_pkcs1_pem(&read_config_file(path)?)
                    .map_err(|e| MixError::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;
                let subject = tls.client_subject.as_deref().unwrap_or(DEFAULT_CLIENT_SUBJECT);
                Some(TlsIdentity::self_signed(subject, key)?)
            }
            None => None,
        };

        Ok(Self {
            cipher_suites,
            check_root: tls.check_root,
            trusted_root,
            identity,
            request_client_cert: false,
            setup_timeout: transport.setup_timeout,
            idle_timeout: transport.idle_timeout,
        })
    }
}

fn read_config_file(path: &Path) -> MixResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| MixError::InvalidConfiguration(format!("{}: {}", path.display(), e)))
}

fn unexpected(message: &HandshakeMessage, waiting_for: &str) -> MixError {
    MixError::UnexpectedMessage(format!("{:?} while waiting for {}", message.handshake_type(), waiting_for))
}

/// A TLS connection over `S`
#[derive(Debug)]
pub struct TlsStream<S> {
    records: RecordLayer<S>,
    role: Role,
    state: HandshakeState,
    suite: Option<CipherSuite>,
    peer_chain: Vec<Certificate>,
    handshake: HandshakeReader,
    transcript: Vec<u8>,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S> TlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, role: Role, guard: CloseGuard, timeout: Duration) -> Self {
        Self {
            records: RecordLayer::new(stream, guard, timeout),
            role,
            state: HandshakeState::Start,
            suite: None,
            peer_chain: Vec::new(),
            handshake: HandshakeReader::default(),
            transcript: Vec::new(),
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    /// Run the initiator handshake over `stream`
    pub async fn connect(stream: S, config: &TlsConfig, guard: CloseGuard) -> MixResult<Self> {
        if config.check_root && config.trusted_root.is_none() {
            return Err(MixError::CertificateRejected(
                "root checking is enabled but no trusted root is configured".into(),
            ));
        }
        let mut tls = Self::new(stream, Role::Initiator, guard, config.setup_timeout);
        match tls.initiator_handshake(config).await {
            Ok(()) => {
                tls.established(config);
                Ok(tls)
            }
            Err(e) => {
                tls.abort(&e).await;
                Err(e)
            }
        }
    }

    /// Run the responder handshake over `stream`
    pub async fn accept(stream: S, config: &TlsConfig, guard: CloseGuard) -> MixResult<Self> {
        let identity = config
            .identity
            .as_ref()
            .ok_or_else(|| MixError::MissingConfiguration("accepting connections needs a TLS identity".into()))?;
        if config.check_root && config.request_client_cert && config.trusted_root.is_none() {
            return Err(MixError::CertificateRejected(
                "root checking is enabled but no trusted root is configured".into(),
            ));
        }
        let mut tls = Self::new(stream, Role::Responder, guard, config.setup_timeout);
        match tls.responder_handshake(config, identity).await {
            Ok(()) => {
                tls.established(config);
                Ok(tls)
            }
            Err(e) => {
                tls.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn initiator_handshake(&mut self, config: &TlsConfig) -> MixResult<()> {
        let client_random = random_bytes::<RANDOM_LEN>()?;
        let offered = config.cipher_suites.iter().map(|s| s.code()).collect();
        self.send_flight(&[HandshakeMessage::ClientHello { random: client_random, cipher_suites: offered }])
            .await?;
        self.state = HandshakeState::ClientHelloSent;

        let (server_random, suite) = match self.next_handshake().await? {
            HandshakeMessage::ServerHello { random, cipher_suite } => {
                let suite = CipherSuite::from_code(cipher_suite)
                    .filter(|s| config.cipher_suites.contains(s))
                    .ok_or_else(|| MixError::Protocol("no supported ciphersuite found".into()))?;
                (random, suite)
            }
            other => return Err(unexpected(&other, "ServerHello")),
        };
        self.suite = Some(suite);
        self.state = HandshakeState::ServerHelloReceived;

        let chain = match self.next_handshake().await? {
            HandshakeMessage::Certificate(chain) => decode_chain(&chain)?,
            other => return Err(unexpected(&other, "Certificate")),
        };
        verify_chain(&chain, config.trusted_root.as_ref(), config.check_root)?;
        let server_key = chain[0].public_key().clone();
        self.peer_chain = chain;
        self.state = HandshakeState::CertificateVerified;

        let params = match self.next_handshake().await? {
            HandshakeMessage::ServerKeyExchange { params, signature } => {
                let digest = md5_sha1(&[&client_random[..], &server_random[..], &params.encode()].concat());
                server_key
                    .verify_raw(&digest, &signature)
                    .map_err(|_| MixError::BadSignature("ServerKeyExchange signature does not verify".into()))?;
                params
            }
            other => return Err(unexpected(&other, "ServerKeyExchange")),
        };
        let group = DhGroup::from_bytes(&params.p, &params.g)?;

        let mut cert_requested = false;
        loop {
            match self.next_handshake().await? {
                HandshakeMessage::CertificateRequest if !cert_requested => cert_requested = true,
                HandshakeMessage::ServerHelloDone => break,
                other => return Err(unexpected(&other, "ServerHelloDone")),
            }
        }

        let identity = config.identity.as_ref().filter(|_| cert_requested);
        let pair = group.generate();
        let mut flight = Vec::new();
        if cert_requested {
            let chain = identity.map(|id| id.chain.iter().map(Certificate::encode).collect()).unwrap_or_default();
            flight.push(HandshakeMessage::Certificate(chain));
        }
        flight.push(HandshakeMessage::ClientKeyExchange { public: pair.public_bytes() });
        self.send_flight(&flight).await?;

        if let Some(identity) = identity {
            let signature = identity.key.sign_raw(&md5_sha1(&self.transcript))?;
            self.send_flight(&[HandshakeMessage::CertificateVerify { signature }]).await?;
        }

        let pre_master = pair.agree(&params.public)?;
        let master = master_secret(&pre_master, &client_random, &server_random);
        let keys = key_block(&master, &client_random, &server_random, suite);
        self.state = HandshakeState::KeyExchanged;

        self.send_change_cipher_spec(&keys, suite).await?;
        let verify_data = finished(&master, CLIENT_FINISHED, &self.transcript);
        self.send_flight(&[HandshakeMessage::Finished { verify_data }]).await?;
        self.state = HandshakeState::ChangeCipherSpecSent;

        self.expect_change_cipher_spec(&keys, suite).await?;
        let expected = finished(&master, SERVER_FINISHED, &self.transcript);
        self.expect_finished(&expected).await
    }

    async fn responder_handshake(&mut self, config: &TlsConfig, identity: &TlsIdentity) -> MixResult<()> {
        let (client_random, offered) = match self.next_handshake().await? {
            HandshakeMessage::ClientHello { random, cipher_suites } => (random, cipher_suites),
            other => return Err(unexpected(&other, "ClientHello")),
        };
        self.state = HandshakeState::ClientHelloSent;
        let suite = negotiate(&offered, &config.cipher_suites)?;
        self.suite = Some(suite);

        let server_random = random_bytes::<RANDOM_LEN>()?;
        let group = DhGroup::oakley2();
        let pair = group.generate();
        let params = DhParams { p: group.p_bytes(), g: group.g_bytes(), public: pair.public_bytes() };
        let digest = md5_sha1(&[&client_random[..], &server_random[..], &params.encode()].concat());
        let signature = identity.key.sign_raw(&digest)?;

        let mut flight = vec![
            HandshakeMessage::ServerHello { random: server_random, cipher_suite: suite.code() },
            HandshakeMessage::Certificate(identity.chain.iter().map(Certificate::encode).collect()),
            HandshakeMessage::ServerKeyExchange { params, signature },
        ];
        if config.request_client_cert {
            flight.push(HandshakeMessage::CertificateRequest);
        }
        flight.push(HandshakeMessage::ServerHelloDone);
        self.send_flight(&flight).await?;
        self.state = HandshakeState::ServerHelloReceived;

        if config.request_client_cert {
            let chain = match self.next_handshake().await? {
                HandshakeMessage::Certificate(chain) => decode_chain(&chain)?,
                other => return Err(unexpected(&other, "Certificate")),
            };
            if !chain.is_empty() {
                verify_chain(&chain, config.trusted_root.as_ref(), config.check_root)?;
                self.state = HandshakeState::CertificateVerified;
            }
            self.peer_chain = chain;
        }

        let client_public = match self.next_handshake().await? {
            HandshakeMessage::ClientKeyExchange { public } => public,
            other => return Err(unexpected(&other, "ClientKeyExchange")),
        };

        if let Some(leaf) = self.peer_chain.first() {
            let client_key = leaf.public_key().clone();
            let digest = md5_sha1(&self.transcript);
            match self.next_handshake().await? {
                HandshakeMessage::CertificateVerify { signature } => client_key
                    .verify_raw(&digest, &signature)
                    .map_err(|_| MixError::BadSignature("CertificateVerify signature does not verify".into()))?,
                other => return Err(unexpected(&other, "CertificateVerify")),
            }
        }

        let pre_master = pair.agree(&client_public)?;
        let master = master_secret(&pre_master, &client_random, &server_random);
        let keys = key_block(&master, &client_random, &server_random, suite);
        self.state = HandshakeState::KeyExchanged;

        self.expect_change_cipher_spec(&keys, suite).await?;
        let expected = finished(&master, CLIENT_FINISHED, &self.transcript);
        self.expect_finished(&expected).await?;

        self.send_change_cipher_spec(&keys, suite).await?;
        let verify_data = finished(&master, SERVER_FINISHED, &self.transcript);
        self.send_flight(&[HandshakeMessage::Finished { verify_data }]).await?;
        self.state = HandshakeState::ChangeCipherSpecSent;
        Ok(())
    }

    fn established(&mut self, config: &TlsConfig) {
        self.records.set_timeout(config.idle_timeout);
        self.state = HandshakeState::Finished;
        self.transcript.clear();
        info!(
            role = ?self.role,
            suite = self.suite.map(CipherSuite::name).unwrap_or_default(),
            peer = self.peer_chain.first().map(Certificate::subject).unwrap_or("anonymous"),
            "TLS connection established"
        );
    }

    /// Cipher state for the direction `writer` sends in
    fn cipher_state(keys: &KeyBlock, suite: CipherSuite, writer: Role) -> MixResult<CipherState> {
        match writer {
            Role::Initiator => CipherState::new(suite, &keys.client_key, &keys.client_mac, &keys.client_iv),
            Role::Responder => CipherState::new(suite, &keys.server_key, &keys.server_mac, &keys.server_iv),
        }
    }

    async fn send_change_cipher_spec(&mut self, keys: &KeyBlock, suite: CipherSuite) -> MixResult<()> {
        self.records.write_record(ContentType::ChangeCipherSpec, &CHANGE_CIPHER_SPEC).await?;
        self.records.activate_write(Self::cipher_state(keys, suite, self.role)?);
        Ok(())
    }

    async fn expect_change_cipher_spec(&mut self, keys: &KeyBlock, suite: CipherSuite) -> MixResult<()> {
        if self.handshake.has_partial() {
            return Err(MixError::UnexpectedMessage("ChangeCipherSpec inside a handshake message".into()));
        }
        let (content_type, body) = self.records.read_record().await?;
        match content_type {
            ContentType::ChangeCipherSpec if body == CHANGE_CIPHER_SPEC => {
                self.records.activate_read(Self::cipher_state(keys, suite, self.role.peer())?);
                Ok(())
            }
            ContentType::Alert => Err(self.on_alert(&body)),
            other => Err(MixError::UnexpectedMessage(format!("{:?} while waiting for ChangeCipherSpec", other))),
        }
    }

    async fn expect_finished(&mut self, expected: &[u8; 12]) -> MixResult<()> {
        match self.next_handshake().await? {
            HandshakeMessage::Finished { verify_data } => {
                if bool::from(verify_data[..].ct_eq(&expected[..])) {
                    Ok(())
                } else {
                    Err(MixError::BadFinished)
                }
            }
            other => Err(unexpected(&other, "Finished")),
        }
    }

    /// Write handshake messages as one record run and add them to the transcript
    async fn send_flight(&mut self, messages: &[HandshakeMessage]) -> MixResult<()> {
        let mut data = Vec::new();
        for message in messages {
            debug!(role = ?self.role, message = ?message.handshake_type(), "sending handshake message");
            data.extend_from_slice(&message.encode());
        }
        self.transcript.extend_from_slice(&data);
        self.records.write_record(ContentType::Handshake, &data).await
    }

    /// Next handshake message; HelloRequest is skipped and kept out of the transcript
    async fn next_handshake(&mut self) -> MixResult<HandshakeMessage> {
        loop {
            if let Some((message, raw)) = self.handshake.next_message()? {
                if message == HandshakeMessage::HelloRequest {
                    continue;
                }
                debug!(role = ?self.role, message = ?message.handshake_type(), "received handshake message");
                self.transcript.extend_from_slice(&raw);
                return Ok(message);
            }
            let (content_type, body) = self.records.read_record().await?;
            match content_type {
                ContentType::Handshake => self.handshake.push(&body)?,
                ContentType::Alert => return Err(self.on_alert(&body)),
                other => {
                    return Err(MixError::UnexpectedMessage(format!("{:?} record during handshake", other)));
                }
            }
        }
    }

    fn on_alert(&mut self, body: &[u8]) -> MixError {
        match Alert::parse(body) {
            Ok(alert) if alert.is_close_notify() => {
                debug!(role = ?self.role, "peer sent close_notify");
                self.state = HandshakeState::Closed;
                MixError::ConnectionClosed
            }
            Ok(alert) => {
                warn!(role = ?self.role, level = alert.level, description = alert.description, "peer sent alert");
                alert.into_error()
            }
            Err(e) => e,
        }
    }

    /// Send a fatal alert for locally detected errors, then shut down
    async fn abort(&mut self, error: &MixError) {
        if self.state == HandshakeState::Closed {
            return;
        }
        let peer_gone = matches!(
            error,
            MixError::Alert { .. } | MixError::ConnectionClosed | MixError::Timeout | MixError::Io(_)
        );
        if !peer_gone {
            warn!(role = ?self.role, state = ?self.state, error = %error, "aborting TLS connection");
            let alert = Alert::for_error(error);
            let _ = self.records.write_record(ContentType::Alert, &alert.encode()).await;
        }
        self.records.shutdown().await;
        self.state = HandshakeState::Closed;
    }

    fn ensure_established(&self) -> MixResult<()> {
        match self.state {
            HandshakeState::Finished => Ok(()),
            HandshakeState::Closed => Err(MixError::ConnectionClosed),
            state => Err(MixError::Internal(format!("connection not established ({:?})", state))),
        }
    }

    /// Send application data
    pub async fn write_all(&mut self, data: &[u8]) -> MixResult<()> {
        self.ensure_established()?;
        if let Err(e) = self.records.write_record(ContentType::ApplicationData, data).await {
            self.abort(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Fill `buf` with application data
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> MixResult<()> {
        self.ensure_established()?;
        let mut filled = 0;
        while filled < buf.len() {
            if self.read_pos == self.read_buf.len() {
                if let Err(e) = self.fill_read_buf().await {
                    self.abort(&e).await;
                    return Err(e);
                }
                continue;
            }
            let n = (buf.len() - filled).min(self.read_buf.len() - self.read_pos);
            buf[filled..filled + n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            filled += n;
        }
        Ok(())
    }

    async fn fill_read_buf(&mut self) -> MixResult<()> {
        let (content_type, body) = self.records.read_record().await?;
        match content_type {
            ContentType::ApplicationData => {
                self.read_buf = body;
                self.read_pos = 0;
                Ok(())
            }
            ContentType::Alert => Err(self.on_alert(&body)),
            ContentType::Handshake => {
                self.handshake.push(&body)?;
                while let Some((message, _)) = self.handshake.next_message()? {
                    if message != HandshakeMessage::HelloRequest {
                        return Err(unexpected(&message, "application data"));
                    }
                    debug!(role = ?self.role, "ignoring HelloRequest");
                }
                Ok(())
            }
            ContentType::ChangeCipherSpec => {
                Err(MixError::UnexpectedMessage("ChangeCipherSpec after the handshake".into()))
            }
        }
    }

    /// Send close_notify and shut the stream down
    pub async fn close(&mut self) {
        if self.state == HandshakeState::Closed {
            return;
        }
        let _ = self.records.write_record(ContentType::Alert, &Alert::close_notify().encode()).await;
        self.records.shutdown().await;
        self.state = HandshakeState::Closed;
        debug!(role = ?self.role, "TLS connection closed");
    }

    /// Connection state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Which side this end plays
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated suite
    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.suite
    }

    /// Chain the peer presented, leaf first; empty for anonymous initiators
    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_chain
    }

    /// Close signal of this connection
    pub fn guard(&self) -> &CloseGuard {
        self.records.guard()
    }
}

fn decode_chain(encoded: &[Vec<u8>]) -> MixResult<Vec<Certificate>> {
    encoded.iter().map(|c| Certificate::decode(c)).collect()
}
