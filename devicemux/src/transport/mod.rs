//! Length-prefixed plist transport.
//!
//! Composes a stream socket, a [`LengthSplitter`] and a plist codec. The
//! muxer speaks little-endian framing with binary payloads; lockdown
//! speaks big-endian framing with XML payloads. Inbound payloads are
//! probed by the `bplist` magic, so either dialect is accepted on any
//! connection. The same object also performs the mid-stream TLS upgrade
//! lockdown negotiates.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::bplist::{self, Value};
use crate::splitter::{Endianness, LengthSplitter};
use crate::tls::{self, TlsUpgrade};
use crate::{DeviceMuxError, ReadWrite};

/// Deadline applied by operations that do not take an explicit one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a declared frame length before the splitter poisons
/// the connection.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// On-the-wire plist dialect used for outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Binary,
    Xml,
}

#[derive(Debug)]
pub struct PlistTransport {
    stream: Option<Box<dyn ReadWrite>>,
    splitter: LengthSplitter,
    endian: Endianness,
    /// Added to the payload length to form the length field; the muxer
    /// field counts its own four bytes plus the envelope.
    length_adjust: i64,
    format: WireFormat,
    max_frame: usize,
}

impl PlistTransport {
    pub fn new(
        stream: Box<dyn ReadWrite>,
        endian: Endianness,
        length_adjust: i64,
        format: WireFormat,
        max_frame: usize,
    ) -> Self {
        Self {
            stream: Some(stream),
            splitter: LengthSplitter::new(endian, 0, 4, -length_adjust, max_frame),
            endian,
            length_adjust,
            format,
            max_frame,
        }
    }

    /// Muxer dialect: little-endian, length field covers the whole
    /// packet, binary payloads.
    pub fn muxer(stream: Box<dyn ReadWrite>) -> Self {
        Self::new(stream, Endianness::Little, 4, WireFormat::Binary, MAX_FRAME)
    }

    /// Lockdown dialect: big-endian, length field counts the payload
    /// only, XML payloads.
    pub fn lockdown(stream: Box<dyn ReadWrite>) -> Self {
        Self::new(stream, Endianness::Big, 0, WireFormat::Xml, MAX_FRAME)
    }

    /// Bytes sitting in the splitter past the last consumed frame.
    pub fn buffered_len(&self) -> usize {
        self.splitter.buffered_len()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Drops the stream; every outstanding read fails from here on.
    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Writes one length-prefixed frame.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), DeviceMuxError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(DeviceMuxError::ConnectionClosed)?;
        let field = (payload.len() as i64 + self.length_adjust) as u32;
        let mut frame = Vec::with_capacity(4 + payload.len());
        match self.endian {
            Endianness::Big => frame.extend_from_slice(&field.to_be_bytes()),
            Endianness::Little => frame.extend_from_slice(&field.to_le_bytes()),
        }
        frame.extend_from_slice(payload);
        stream.write_all(&frame).await?;
        stream.flush().await?;
        trace!("sent frame of {} payload bytes", payload.len());
        Ok(())
    }

    /// Awaits the next complete frame payload.
    pub async fn receive_frame(&mut self, timeout: Duration) -> Result<Bytes, DeviceMuxError> {
        match tokio::time::timeout(timeout, self.receive_frame_inner()).await {
            Ok(result) => result,
            Err(_) => Err(DeviceMuxError::Timeout),
        }
    }

    async fn receive_frame_inner(&mut self) -> Result<Bytes, DeviceMuxError> {
        loop {
            match self.splitter.try_next() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    // Framing errors poison the connection.
                    warn!("inbound framing error, closing transport: {e}");
                    self.stream = None;
                    return Err(e);
                }
            }
            let stream = self
                .stream
                .as_mut()
                .ok_or(DeviceMuxError::ConnectionClosed)?;
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(DeviceMuxError::ConnectionClosed);
            }
            self.splitter.feed(&chunk[..n]);
        }
    }

    /// Encodes and sends one plist message.
    pub async fn send(&mut self, message: &Value) -> Result<(), DeviceMuxError> {
        let payload = match self.format {
            WireFormat::Binary => bplist::encode(message)?,
            WireFormat::Xml => {
                let value = plist::Value::try_from(message)?;
                let mut out = Vec::new();
                value.to_writer_xml(&mut out)?;
                out
            }
        };
        debug!("sending plist message ({} bytes)", payload.len());
        self.send_frame(&payload).await
    }

    /// Awaits and decodes the next plist message, probing the dialect.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Value, DeviceMuxError> {
        let frame = self.receive_frame(timeout).await?;
        decode_payload(&frame)
    }

    /// Strict request/response exchange. Callers must not interleave;
    /// the `&mut` receiver serializes them.
    pub async fn send_and_receive(
        &mut self,
        message: &Value,
        timeout: Duration,
    ) -> Result<Value, DeviceMuxError> {
        self.send(message).await?;
        self.receive(timeout).await
    }

    /// Swaps the underlying socket for a TLS client session.
    ///
    /// Any bytes the splitter buffered past the last consumed frame mean
    /// the peer spoke before the handshake; that is a protocol violation,
    /// not a recovery case.
    pub async fn upgrade_tls(&mut self, upgrade: &TlsUpgrade) -> Result<(), DeviceMuxError> {
        if self.splitter.buffered_len() > 0 {
            return Err(DeviceMuxError::UpgradeBufferDirty);
        }
        let stream = self
            .stream
            .take()
            .ok_or(DeviceMuxError::ConnectionClosed)?;
        let stream = tls::connect(stream, upgrade).await?;
        debug!("transport upgraded to TLS");
        self.stream = Some(stream);
        self.splitter = LengthSplitter::new(self.endian, 0, 4, -self.length_adjust, self.max_frame);
        Ok(())
    }

    /// Tears the transport down and hands ownership of the raw stream to
    /// the caller. Bytes the splitter buffered past the last consumed
    /// frame are replayed ahead of fresh reads.
    pub fn into_stream(self) -> Result<Box<dyn ReadWrite>, DeviceMuxError> {
        let PlistTransport {
            stream, splitter, ..
        } = self;
        let stream = stream.ok_or(DeviceMuxError::ConnectionClosed)?;
        let leftover = splitter.shutdown();
        if leftover.is_empty() {
            Ok(stream)
        } else {
            trace!("replaying {} buffered bytes on handoff", leftover.len());
            Ok(Box::new(RewindStream {
                prefix: leftover.freeze(),
                inner: stream,
            }))
        }
    }
}

pub(crate) fn decode_payload(frame: &[u8]) -> Result<Value, DeviceMuxError> {
    if bplist::is_bplist(frame) {
        bplist::decode(frame)
    } else {
        Value::try_from(plist::from_bytes::<plist::Value>(frame)?)
    }
}

/// Stream wrapper that serves a buffered prefix before reading from the
/// inner stream. Writes pass straight through.
#[derive(Debug)]
struct RewindStream {
    prefix: Bytes,
    inner: Box<dyn ReadWrite>,
}

impl AsyncRead for RewindStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RewindStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bplist::Dictionary;

    fn pair() -> (PlistTransport, PlistTransport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            PlistTransport::lockdown(Box::new(a)),
            PlistTransport::lockdown(Box::new(b)),
        )
    }

    fn message() -> Value {
        let mut dict = Dictionary::new();
        dict.insert("Request", "QueryType");
        dict.insert("Label", "devicemux-tests");
        Value::Dictionary(dict)
    }

    #[tokio::test]
    async fn xml_round_trip() {
        let (mut client, mut server) = pair();
        client.send(&message()).await.unwrap();
        let received = server.receive(DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(received, message());
    }

    #[tokio::test]
    async fn binary_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = PlistTransport::muxer(Box::new(a));
        let mut server = PlistTransport::muxer(Box::new(b));
        client.send(&message()).await.unwrap();
        let received = server.receive(DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(received, message());
    }

    #[tokio::test]
    async fn timeout_leaves_transport_usable() {
        let (mut client, mut server) = pair();
        assert!(matches!(
            client.receive(Duration::from_millis(50)).await,
            Err(DeviceMuxError::Timeout)
        ));
        server.send(&message()).await.unwrap();
        assert_eq!(client.receive(DEFAULT_TIMEOUT).await.unwrap(), message());
    }

    #[tokio::test]
    async fn dirty_buffer_blocks_tls_upgrade() {
        let (mut client, server) = pair();
        let mut raw = server.into_stream().unwrap();

        let mut frame = Vec::new();
        plist::Value::try_from(&message())
            .unwrap()
            .to_writer_xml(&mut frame)
            .unwrap();
        let mut wire = (frame.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&frame);
        wire.extend_from_slice(b"early");
        raw.write_all(&wire).await.unwrap();
        raw.flush().await.unwrap();

        client.receive(DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(client.buffered_len(), 5);
        assert!(matches!(
            client.upgrade_tls(&TlsUpgrade::default()).await,
            Err(DeviceMuxError::UpgradeBufferDirty)
        ));
    }

    #[tokio::test]
    async fn handoff_replays_buffered_bytes() {
        let (mut client, server) = pair();
        let mut raw = server.into_stream().unwrap();

        let mut frame = Vec::new();
        plist::Value::try_from(&message())
            .unwrap()
            .to_writer_xml(&mut frame)
            .unwrap();
        let mut wire = (frame.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&frame);
        wire.extend_from_slice(b"EXTRA");
        raw.write_all(&wire).await.unwrap();

        client.receive(DEFAULT_TIMEOUT).await.unwrap();
        let mut stream = client.into_stream().unwrap();
        let mut replay = [0u8; 5];
        stream.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, b"EXTRA");

        // Later bytes still come off the socket.
        raw.write_all(b"after").await.unwrap();
        let mut tail = [0u8; 5];
        stream.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"after");
    }
}
