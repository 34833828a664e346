//! MMTP Relay Transport
//!
//! Packets travel to the first hop over TLS using the Mixminion Transport
//! Protocol, version 0.3:
//!
//! ```text
//! Initiator                                  Responder
//!   "MMTP 0.3\r\n"          -------->
//!                           <--------         "MMTP 0.3\r\n"
//!   "SEND\r\n" | "JUNK\r\n"
//!   packet (32 x 1024 bytes)
//!   hash(packet | "SEND")   -------->
//!                           <--------         "RECEIVED\r\n" | "REJECTED\r\n"
//!                                             hash(packet | status)
//! ```
//!
//! The initiator closes the connection after every packet.

use std::sync::Arc;

use libmix_crypto::{digest_eq, hash_concat, random_vec, Digest20, HASH_LEN};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assembler::AssembledPacket;
use crate::guard::CloseGuard;
use crate::tls::{TlsConfig, TlsStream};
use crate::{MixError, MixResult, PACKET_SIZE};

/// Protocol greeting, sent by both ends
pub const PROTOCOL_LINE: &[u8; 10] = b"MMTP 0.3\r\n";

/// Greeting bytes compared; the rest is line ending
const PROTOCOL_MATCH_LEN: usize = 8;

/// Command for a packet to relay
pub const SEND_COMMAND: &[u8; 6] = b"SEND\r\n";

/// Command for cover traffic the relay drops
pub const JUNK_COMMAND: &[u8; 6] = b"JUNK\r\n";

/// Status for an accepted packet
pub const RECEIVED_STATUS: &[u8; 10] = b"RECEIVED\r\n";

/// Status for a refused packet
pub const REJECTED_STATUS: &[u8; 10] = b"REJECTED\r\n";

/// Packets are written in blocks of this size
pub const BLOCK_SIZE: usize = 1024;

const SEND_LABEL: &[u8] = b"SEND";
const JUNK_LABEL: &[u8] = b"JUNK";
const RECEIVED_LABEL: &[u8] = b"RECEIVED";
const RECEIVED_JUNK_LABEL: &[u8] = b"RECEIVED JUNK";
const REJECTED_LABEL: &[u8] = b"REJECTED";

/// Packets buffered between a sink and its consumer
pub const DEFAULT_SINK_CAPACITY: usize = 128;

fn packet_digest(packet: &[u8], label: &[u8]) -> Digest20 {
    hash_concat(&[packet, label])
}

/// An MMTP session on an established TLS connection
#[derive(Debug)]
pub struct MmtpConnection<S> {
    tls: TlsStream<S>,
}

impl<S> MmtpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// TLS handshake and protocol negotiation as initiator
    pub async fn initiate(stream: S, config: &TlsConfig, guard: CloseGuard) -> MixResult<Self> {
        let mut tls = TlsStream::connect(stream, config, guard).await?;
        tls.write_all(PROTOCOL_LINE).await?;

        let mut answer = [0u8; PROTOCOL_LINE.len()];
        tls.read_exact(&mut answer).await?;
        if answer[..PROTOCOL_MATCH_LEN] != PROTOCOL_LINE[..PROTOCOL_MATCH_LEN] {
            tls.close().await;
            return Err(MixError::Protocol(format!(
                "relay answered {:?} to the MMTP greeting",
                String::from_utf8_lossy(&answer).trim_end()
            )));
        }
        debug!("MMTP 0.3 negotiated");
        Ok(Self { tls })
    }

    /// Send one packet; `Ok(false)` when the relay rejected it
    pub async fn send(&mut self, packet: &[u8], junk: bool) -> MixResult<bool> {
        if packet.len() != PACKET_SIZE {
            return Err(MixError::InvalidPayload(format!("packet is {} bytes, not {}", packet.len(), PACKET_SIZE)));
        }
        let (command, label) = if junk { (JUNK_COMMAND, JUNK_LABEL) } else { (SEND_COMMAND, SEND_LABEL) };

        self.tls.write_all(command).await?;
        for block in packet.chunks(BLOCK_SIZE) {
            self.tls.write_all(block).await?;
        }
        self.tls.write_all(&packet_digest(packet, label)).await?;

        let mut status = [0u8; RECEIVED_STATUS.len()];
        let mut ack = [0u8; HASH_LEN];
        self.tls.read_exact(&mut status).await?;
        self.tls.read_exact(&mut ack).await?;

        if &status == RECEIVED_STATUS {
            let expected = packet_digest(packet, if junk { RECEIVED_JUNK_LABEL } else { RECEIVED_LABEL });
            if !digest_eq(&expected, &ack) {
                return Err(MixError::BadAcknowledgement("RECEIVED hash does not match the packet".into()));
            }
            debug!(junk, "packet received by relay");
            Ok(true)
        } else if &status == REJECTED_STATUS {
            if !digest_eq(&packet_digest(packet, REJECTED_LABEL), &ack) {
                return Err(MixError::BadAcknowledgement("REJECTED hash does not match the packet".into()));
            }
            warn!(junk, "packet rejected by relay");
            Ok(false)
        } else {
            Err(MixError::BadAcknowledgement(format!(
                "unknown status {:?}",
                String::from_utf8_lossy(&status).trim_end()
            )))
        }
    }

    /// Close the session and its TLS connection
    pub async fn close(mut self) {
        self.tls.close().await;
    }
}

/// Sends packets to relays, one connection per packet
#[derive(Debug, Clone)]
pub struct MmtpClient {
    config: Arc<TlsConfig>,
}

impl MmtpClient {
    /// Client using `config` for every connection
    pub fn new(config: TlsConfig) -> Self {
        Self { config: Arc::new(config) }
    }

    /// TLS parameters in use
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Deliver an assembled packet to its first hop
    pub async fn send_assembled(&self, packet: &AssembledPacket) -> MixResult<bool> {
        let hop = &packet.first_hop;
        self.send_packet(hop.host(), hop.port(), &packet.bytes).await
    }

    /// Send `packet` to `host:port`
    pub async fn send_packet(&self, host: &str, port: u16, packet: &[u8]) -> MixResult<bool> {
        let stream = self.connect(host, port).await?;
        self.send_over(stream, packet, false).await
    }

    /// Send a random junk packet to `host:port`
    pub async fn send_junk(&self, host: &str, port: u16) -> MixResult<bool> {
        let packet = random_vec(PACKET_SIZE)?;
        let stream = self.connect(host, port).await?;
        self.send_over(stream, &packet, true).await
    }

    async fn connect(&self, host: &str, port: u16) -> MixResult<TcpStream> {
        debug!(host, port, "connecting to relay");
        let stream = tokio::time::timeout(self.config.setup_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| MixError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// One MMTP session over an already connected stream; always closes it
    pub async fn send_over<S>(&self, stream: S, packet: &[u8], junk: bool) -> MixResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut connection = MmtpConnection::initiate(stream, &self.config, CloseGuard::new()).await?;
        let result = connection.send(packet, junk).await;
        connection.close().await;
        result
    }
}

/// Responder side: accepts MMTP connections and hands received packets to
/// a channel
#[derive(Debug, Clone)]
pub struct PacketSink {
    config: Arc<TlsConfig>,
    packets: mpsc::Sender<Vec<u8>>,
}

impl PacketSink {
    /// Sink and the receiving end of its packet channel. `config` must carry
    /// an identity.
    pub fn new(config: TlsConfig, capacity: usize) -> MixResult<(Self, mpsc::Receiver<Vec<u8>>)> {
        if config.identity.is_none() {
            return Err(MixError::MissingConfiguration("packet sink needs a TLS identity".into()));
        }
        if capacity == 0 {
            return Err(MixError::InvalidConfiguration("sink capacity must be positive".into()));
        }
        let (packets, receiver) = mpsc::channel(capacity);
        Ok((Self { config: Arc::new(config), packets }, receiver))
    }

    /// Accept connections until the listener fails
    pub async fn run(&self, listener: TcpListener) -> MixResult<()> {
        info!(addr = ?listener.local_addr().ok(), "packet sink listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let sink = self.clone();
            tokio::spawn(async move {
                match sink.serve(stream).await {
                    Ok(count) => debug!(%peer, count, "MMTP connection finished"),
                    Err(e) => warn!(%peer, error = %e, "MMTP connection failed"),
                }
            });
        }
    }

    /// Serve one connection; returns the number of packets accepted
    pub async fn serve<S>(&self, stream: S) -> MixResult<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let guard = CloseGuard::new();
        let watchdog = guard.arm(self.config.setup_timeout);
        let result = self.negotiate(stream, guard).await;
        watchdog.abort();
        let mut tls = result?;

        let mut accepted = 0;
        let outcome = loop {
            match self.receive(&mut tls).await {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(MixError::ConnectionClosed) => break Ok(accepted),
                Err(e) => break Err(e),
            }
        };
        tls.close().await;
        outcome
    }

    async fn negotiate<S>(&self, stream: S, guard: CloseGuard) -> MixResult<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut tls = TlsStream::accept(stream, &self.config, guard).await?;
        let mut greeting = [0u8; PROTOCOL_LINE.len()];
        tls.read_exact(&mut greeting).await?;
        if greeting[..PROTOCOL_MATCH_LEN] != PROTOCOL_LINE[..PROTOCOL_MATCH_LEN] {
            tls.close().await;
            return Err(MixError::Protocol(format!(
                "unsupported MMTP greeting {:?}",
                String::from_utf8_lossy(&greeting).trim_end()
            )));
        }
        tls.write_all(PROTOCOL_LINE).await?;
        Ok(tls)
    }

    /// One command; `Ok(true)` when a packet was queued
    async fn receive<S>(&self, tls: &mut TlsStream<S>) -> MixResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut command = [0u8; SEND_COMMAND.len()];
        tls.read_exact(&mut command).await?;
        let junk = match &command {
            c if c == SEND_COMMAND => false,
            c if c == JUNK_COMMAND => true,
            _ => {
                return Err(MixError::Protocol(format!(
                    "unknown MMTP command {:?}",
                    String::from_utf8_lossy(&command).trim_end()
                )))
            }
        };

        let mut packet = vec![0u8; PACKET_SIZE];
        tls.read_exact(&mut packet).await?;
        let mut digest = [0u8; HASH_LEN];
        tls.read_exact(&mut digest).await?;

        let label = if junk { JUNK_LABEL } else { SEND_LABEL };
        let intact = digest_eq(&packet_digest(&packet, label), &digest);
        let queued = intact && (junk || self.packets.try_send(packet.clone()).is_ok());

        if queued {
            let ack_label = if junk { RECEIVED_JUNK_LABEL } else { RECEIVED_LABEL };
            tls.write_all(RECEIVED_STATUS).await?;
            tls.write_all(&packet_digest(&packet, ack_label)).await?;
        } else {
            warn!(intact, junk, "rejecting packet");
            tls.write_all(REJECTED_STATUS).await?;
            tls.write_all(&packet_digest(&packet, REJECTED_LABEL)).await?;
        }
        Ok(queued && !junk)
    }
}
