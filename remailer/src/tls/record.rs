//! Record Layer
//!
//! Framing, protection and guarded I/O for TLS records. Read and write
//! protection switch on independently, each after its ChangeCipherSpec.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::cipher_suite::CipherState;
use super::{MAX_CIPHERTEXT, MAX_PLAINTEXT, PROTOCOL_VERSION, RECORD_HEADER_LEN};
use crate::guard::CloseGuard;
use crate::{MixError, MixResult};

/// Record content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// Switch to the negotiated protection
    ChangeCipherSpec = 20,
    /// Alert
    Alert = 21,
    /// Handshake messages
    Handshake = 22,
    /// Application data
    ApplicationData = 23,
}

impl TryFrom<u8> for ContentType {
    type Error = MixError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            _ => Err(MixError::InvalidRecord(format!("unknown content type {}", value))),
        }
    }
}

/// Parsed 5-byte record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Content type
    pub content_type: ContentType,
    /// Body length
    pub length: usize,
}

impl RecordHeader {
    /// Validate a header before its body is read. `max_len` is
    /// [`MAX_PLAINTEXT`] until read protection is on.
    pub fn parse(bytes: &[u8; RECORD_HEADER_LEN], max_len: usize) -> MixResult<Self> {
        let content_type = ContentType::try_from(bytes[0])?;
        if bytes[1..3] != PROTOCOL_VERSION {
            return Err(MixError::InvalidRecord(format!(
                "unsupported version {}.{}",
                bytes[1], bytes[2]
            )));
        }
        let length = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        if length > max_len {
            return Err(MixError::InvalidRecord(format!("record of {} bytes exceeds {}", length, max_len)));
        }
        Ok(Self { content_type, length })
    }

    /// Wire form
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let len = (self.length as u16).to_be_bytes();
        [self.content_type as u8, PROTOCOL_VERSION[0], PROTOCOL_VERSION[1], len[0], len[1]]
    }
}

/// Records over a byte stream
#[derive(Debug)]
pub struct RecordLayer<S> {
    stream: S,
    guard: CloseGuard,
    timeout: Duration,
    read_state: Option<CipherState>,
    write_state: Option<CipherState>,
}

impl<S> RecordLayer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream`; every read and write waits at most `timeout` and
    /// fails once `guard` closes
    pub fn new(stream: S, guard: CloseGuard, timeout: Duration) -> Self {
        Self { stream, guard, timeout, read_state: None, write_state: None }
    }

    /// Close signal of this connection
    pub fn guard(&self) -> &CloseGuard {
        &self.guard
    }

    /// Change the per-operation deadline
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Protect records read from now on
    pub fn activate_read(&mut self, state: CipherState) {
        self.read_state = Some(state);
    }

    /// Protect records written from now on
    pub fn activate_write(&mut self, state: CipherState) {
        self.write_state = Some(state);
    }

    /// Whether reads are protected
    pub fn is_read_protected(&self) -> bool {
        self.read_state.is_some()
    }

    /// Whether writes are protected
    pub fn is_write_protected(&self) -> bool {
        self.write_state.is_some()
    }

    async fn read_guarded(&mut self, buf: &mut [u8]) -> MixResult<()> {
        let stream = &mut self.stream;
        self.guard
            .run_with_timeout(self.timeout, async move {
                stream.read_exact(buf).await?;
                Ok::<_, MixError>(())
            })
            .await
    }

    async fn write_guarded(&mut self, data: &[u8]) -> MixResult<()> {
        let stream = &mut self.stream;
        self.guard
            .run_with_timeout(self.timeout, async move {
                stream.write_all(data).await?;
                stream.flush().await?;
                Ok::<_, MixError>(())
            })
            .await
    }

    /// Next record, unprotected
    pub async fn read_record(&mut self) -> MixResult<(ContentType, Vec<u8>)> {
        let mut head = [0u8; RECORD_HEADER_LEN];
        self.read_guarded(&mut head).await?;

        let max_len = if self.read_state.is_some() { MAX_CIPHERTEXT } else { MAX_PLAINTEXT };
        let header = RecordHeader::parse(&head, max_len)?;

        let mut body = vec![0u8; header.length];
        self.read_guarded(&mut body).await?;

        let body = match self.read_state.as_mut() {
            Some(state) => state.open(header.content_type, &body)?,
            None => body,
        };
        if body.len() > MAX_PLAINTEXT {
            return Err(MixError::InvalidRecord(format!("plaintext of {} bytes", body.len())));
        }
        trace!(content_type = ?header.content_type, len = body.len(), "record read");
        Ok((header.content_type, body))
    }

    /// Write `data` as one or more records of `content_type`
    pub async fn write_record(&mut self, content_type: ContentType, data: &[u8]) -> MixResult<()> {
        let mut out = BytesMut::with_capacity(data.len() + RECORD_HEADER_LEN + 128);
        let mut chunks = data.chunks(MAX_PLAINTEXT).peekable();
        if chunks.peek().is_none() {
            self.frame(&mut out, content_type, &[])?;
        }
        for chunk in chunks {
            self.frame(&mut out, content_type, chunk)?;
        }
        self.write_guarded(&out).await?;
        trace!(content_type = ?content_type, len = data.len(), "record written");
        Ok(())
    }

    fn frame(&mut self, out: &mut BytesMut, content_type: ContentType, chunk: &[u8]) -> MixResult<()> {
        let body = match self.write_state.as_mut() {
            Some(state) => state.seal(content_type, chunk)?,
            None => chunk.to_vec(),
        };
        let header = RecordHeader { content_type, length: body.len() };
        out.put_slice(&header.encode());
        out.put_slice(&body);
        Ok(())
    }

    /// Close the guard and shut the stream down
    pub async fn shutdown(&mut self) {
        self.guard.close();
        let _ = tokio::time::timeout(self.timeout, self.stream.shutdown()).await;
    }
}
