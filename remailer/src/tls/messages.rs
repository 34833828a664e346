//! Handshake Messages
//!
//! Every message is framed as `type(1) | length(3) | body`. Several may
//! share a record and one may span records; [`HandshakeReader`] reassembles
//! them.

use bytes::{Buf, BufMut, BytesMut};

use super::{PROTOCOL_VERSION, RANDOM_LEN};
use crate::{MixError, MixResult};

/// Message header size
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Largest handshake message accepted
pub const MAX_HANDSHAKE_LEN: usize = 1 << 16;

const NULL_COMPRESSION: u8 = 0;
const RSA_SIGN: u8 = 1;

/// Handshake message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    /// Renegotiation request, ignored
    HelloRequest = 0,
    /// Initiator hello
    ClientHello = 1,
    /// Responder hello
    ServerHello = 2,
    /// Certificate chain
    Certificate = 11,
    /// Signed DH parameters
    ServerKeyExchange = 12,
    /// Ask for a client certificate
    CertificateRequest = 13,
    /// End of the responder's first flight
    ServerHelloDone = 14,
    /// Proof of client key possession
    CertificateVerify = 15,
    /// Client DH value
    ClientKeyExchange = 16,
    /// Transcript MAC
    Finished = 20,
}

impl TryFrom<u8> for HandshakeType {
    type Error = MixError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HandshakeType::HelloRequest),
            1 => Ok(HandshakeType::ClientHello),
            2 => Ok(HandshakeType::ServerHello),
            11 => Ok(HandshakeType::Certificate),
            12 => Ok(HandshakeType::ServerKeyExchange),
            13 => Ok(HandshakeType::CertificateRequest),
            14 => Ok(HandshakeType::ServerHelloDone),
            15 => Ok(HandshakeType::CertificateVerify),
            16 => Ok(HandshakeType::ClientKeyExchange),
            20 => Ok(HandshakeType::Finished),
            _ => Err(MixError::UnexpectedMessage(format!("handshake type {}", value))),
        }
    }
}

/// Server DH parameters as carried in ServerKeyExchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    /// Prime
    pub p: Vec<u8>,
    /// Generator
    pub g: Vec<u8>,
    /// Server public value
    pub public: Vec<u8>,
}

impl DhParams {
    /// `p_len(2) | p | g_len(2) | g | ys_len(2) | ys`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.p.len() + self.g.len() + self.public.len() + 6);
        for field in [&self.p, &self.g, &self.public] {
            buf.put_u16(field.len() as u16);
            buf.put_slice(field);
        }
        buf
    }

    fn decode(data: &mut &[u8]) -> MixResult<Self> {
        Ok(Self {
            p: take_vec16(data)?.to_vec(),
            g: take_vec16(data)?.to_vec(),
            public: take_vec16(data)?.to_vec(),
        })
    }
}

/// A parsed handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Renegotiation request
    HelloRequest,
    /// Offered suites, most preferred first
    ClientHello {
        /// Client random
        random: [u8; RANDOM_LEN],
        /// Cipher suite codes
        cipher_suites: Vec<u16>,
    },
    /// Chosen suite
    ServerHello {
        /// Server random
        random: [u8; RANDOM_LEN],
        /// Cipher suite code
        cipher_suite: u16,
    },
    /// Encoded certificates, leaf first; may be empty from a client
    Certificate(Vec<Vec<u8>>),
    /// Signed DH parameters
    ServerKeyExchange {
        /// Parameters
        params: DhParams,
        /// RSA signature over MD5|SHA-1 of randoms and parameters
        signature: Vec<u8>,
    },
    /// Request for a client certificate
    CertificateRequest,
    /// End of the server flight
    ServerHelloDone,
    /// Client signature over the transcript
    CertificateVerify {
        /// RSA signature over MD5|SHA-1 of the transcript
        signature: Vec<u8>,
    },
    /// Client DH public value
    ClientKeyExchange {
        /// Public value
        public: Vec<u8>,
    },
    /// Transcript MAC
    Finished {
        /// PRF output
        verify_data: [u8; 12],
    },
}

impl HandshakeMessage {
    /// Type code
    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            HandshakeMessage::HelloRequest => HandshakeType::HelloRequest,
            HandshakeMessage::ClientHello { .. } => HandshakeType::ClientHello,
            HandshakeMessage::ServerHello { .. } => HandshakeType::ServerHello,
            HandshakeMessage::Certificate(_) => HandshakeType::Certificate,
            HandshakeMessage::ServerKeyExchange { .. } => HandshakeType::ServerKeyExchange,
            HandshakeMessage::CertificateRequest => HandshakeType::CertificateRequest,
            HandshakeMessage::ServerHelloDone => HandshakeType::ServerHelloDone,
            HandshakeMessage::CertificateVerify { .. } => HandshakeType::CertificateVerify,
            HandshakeMessage::ClientKeyExchange { .. } => HandshakeType::ClientKeyExchange,
            HandshakeMessage::Finished { .. } => HandshakeType::Finished,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            HandshakeMessage::HelloRequest
            | HandshakeMessage::ServerHelloDone => {}
            HandshakeMessage::ClientHello { random, cipher_suites } => {
                buf.put_slice(&PROTOCOL_VERSION);
                buf.put_slice(random);
                buf.put_u8(0);
                buf.put_u16((cipher_suites.len() * 2) as u16);
                for suite in cipher_suites {
                    buf.put_u16(*suite);
                }
                buf.put_u8(1);
                buf.put_u8(NULL_COMPRESSION);
            }
            HandshakeMessage::ServerHello { random, cipher_suite } => {
                buf.put_slice(&PROTOCOL_VERSION);
                buf.put_slice(random);
                buf.put_u8(0);
                buf.put_u16(*cipher_suite);
                buf.put_u8(NULL_COMPRESSION);
            }
            HandshakeMessage::Certificate(chain) => {
                let total: usize = chain.iter().map(|c| c.len() + 3).sum();
                put_u24(buf, total);
                for cert in chain {
                    put_u24(buf, cert.len());
                    buf.put_slice(cert);
                }
            }
            HandshakeMessage::ServerKeyExchange { params, signature } => {
                buf.put_slice(&params.encode());
                buf.put_u16(signature.len() as u16);
                buf.put_slice(signature);
            }
            HandshakeMessage::CertificateRequest => {
                buf.put_u8(1);
                buf.put_u8(RSA_SIGN);
                buf.put_u16(0);
            }
            HandshakeMessage::CertificateVerify { signature } => {
                buf.put_u16(signature.len() as u16);
                buf.put_slice(signature);
            }
            HandshakeMessage::ClientKeyExchange { public } => {
                buf.put_u16(public.len() as u16);
                buf.put_slice(public);
            }
            HandshakeMessage::Finished { verify_data } => buf.put_slice(verify_data),
        }
    }

    /// Framed wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);

        let mut buf = BytesMut::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
        buf.put_u8(self.handshake_type() as u8);
        put_u24(&mut buf, body.len());
        buf.put_slice(&body);
        buf.to_vec()
    }

    /// Parse one message body
    pub fn decode(handshake_type: HandshakeType, body: &[u8]) -> MixResult<Self> {
        let mut data = body;
        let message = match handshake_type {
            HandshakeType::HelloRequest => HandshakeMessage::HelloRequest,
            HandshakeType::ClientHello => {
                check_version(&mut data)?;
                let random = take_random(&mut data)?;
                take_vec8(&mut data)?;
                let suites = take_vec16(&mut data)?;
                if suites.len() % 2 != 0 {
                    return Err(MixError::InvalidRecord("odd cipher suite list".into()));
                }
                let cipher_suites = suites.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
                let compression = take_vec8(&mut data)?;
                if !compression.contains(&NULL_COMPRESSION) {
                    return Err(MixError::Protocol("peer does not offer null compression".into()));
                }
                // extensions are ignored
                data = &[];
                HandshakeMessage::ClientHello { random, cipher_suites }
            }
            HandshakeType::ServerHello => {
                check_version(&mut data)?;
                let random = take_random(&mut data)?;
                take_vec8(&mut data)?;
                let cipher_suite = take_u16(&mut data)?;
                if take_u8(&mut data)? != NULL_COMPRESSION {
                    return Err(MixError::Protocol("compression not supported".into()));
                }
                data = &[];
                HandshakeMessage::ServerHello { random, cipher_suite }
            }
            HandshakeType::Certificate => {
                let mut list = take_vec24(&mut data)?;
                let mut chain = Vec::new();
                while list.has_remaining() {
                    chain.push(take_vec24(&mut list)?.to_vec());
                }
                HandshakeMessage::Certificate(chain)
            }
            HandshakeType::ServerKeyExchange => {
                let params = DhParams::decode(&mut data)?;
                let signature = take_vec16(&mut data)?.to_vec();
                HandshakeMessage::ServerKeyExchange { params, signature }
            }
            HandshakeType::CertificateRequest => {
                take_vec8(&mut data)?;
                take_vec16(&mut data)?;
                HandshakeMessage::CertificateRequest
            }
            HandshakeType::ServerHelloDone => HandshakeMessage::ServerHelloDone,
            HandshakeType::CertificateVerify => HandshakeMessage::CertificateVerify {
                signature: take_vec16(&mut data)?.to_vec(),
            },
            HandshakeType::ClientKeyExchange => HandshakeMessage::ClientKeyExchange {
                public: take_vec16(&mut data)?.to_vec(),
            },
            HandshakeType::Finished => {
                let verify_data = take(&mut data, 12)?
                    .try_into()
                    .map_err(|_| MixError::InvalidRecord("bad Finished length".into()))?;
                HandshakeMessage::Finished { verify_data }
            }
        };
        if data.has_remaining() {
            return Err(MixError::InvalidRecord(format!("{} trailing bytes in {:?}", data.len(), handshake_type)));
        }
        Ok(message)
    }
}

/// Reassembles handshake messages from record bodies
#[derive(Debug, Default)]
pub struct HandshakeReader {
    buffer: Vec<u8>,
}

impl HandshakeReader {
    /// Append a handshake record body
    pub fn push(&mut self, data: &[u8]) -> MixResult<()> {
        if self.buffer.len() + data.len() > MAX_HANDSHAKE_LEN + HANDSHAKE_HEADER_LEN {
            return Err(MixError::Protocol("handshake message too large".into()));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Whether a partial message is buffered
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Next complete message and its raw bytes, if buffered
    pub fn next_message(&mut self) -> MixResult<Option<(HandshakeMessage, Vec<u8>)>> {
        if self.buffer.len() < HANDSHAKE_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([0, self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if len > MAX_HANDSHAKE_LEN {
            return Err(MixError::Protocol(format!("handshake message of {} bytes", len)));
        }
        if self.buffer.len() < HANDSHAKE_HEADER_LEN + len {
            return Ok(None);
        }
        let raw: Vec<u8> = self.buffer.drain(..HANDSHAKE_HEADER_LEN + len).collect();
        let handshake_type = HandshakeType::try_from(raw[0])?;
        let message = HandshakeMessage::decode(handshake_type, &raw[HANDSHAKE_HEADER_LEN..])?;
        Ok(Some((message, raw)))
    }
}

fn put_u24(buf: &mut BytesMut, value: usize) {
    buf.put_uint(value as u64, 3);
}

fn truncated() -> MixError {
    MixError::InvalidRecord("truncated handshake message".into())
}

fn take<'a>(data: &mut &'a [u8], len: usize) -> MixResult<&'a [u8]> {
    if data.len() < len {
        return Err(truncated());
    }
    let slice: &'a [u8] = *data;
    let (head, rest) = slice.split_at(len);
    *data = rest;
    Ok(head)
}

fn take_u8(data: &mut &[u8]) -> MixResult<u8> {
    if data.remaining() < 1 {
        return Err(truncated());
    }
    Ok(data.get_u8())
}

fn take_u16(data: &mut &[u8]) -> MixResult<u16> {
    if data.remaining() < 2 {
        return Err(truncated());
    }
    Ok(data.get_u16())
}

fn take_vec8<'a>(data: &mut &'a [u8]) -> MixResult<&'a [u8]> {
    let len = take_u8(data)? as usize;
    take(data, len)
}

fn take_vec16<'a>(data: &mut &'a [u8]) -> MixResult<&'a [u8]> {
    let len = take_u16(data)? as usize;
    take(data, len)
}

fn take_vec24<'a>(data: &mut &'a [u8]) -> MixResult<&'a [u8]> {
    if data.remaining() < 3 {
        return Err(truncated());
    }
    let len = data.get_uint(3) as usize;
    take(data, len)
}

fn take_random(data: &mut &[u8]) -> MixResult<[u8; RANDOM_LEN]> {
    let mut random = [0u8; RANDOM_LEN];
    random.copy_from_slice(take(data, RANDOM_LEN)?);
    Ok(random)
}

fn check_version(data: &mut &[u8]) -> MixResult<()> {
    let version = take(data, 2)?;
    if version != PROTOCOL_VERSION {
        return Err(MixError::Protocol(format!("unsupported version {}.{}", version[0], version[1])));
    }
    Ok(())
}
