//! Message transport over an async byte stream
//!
//! [`MessageReader`] and [`MessageWriter`] bind the chunk codec to the two
//! halves of a connection. They can live in different tasks: a play
//! session reads control messages in a receive task while the session loop
//! writes media.
//!
//! Every socket operation is bounded by a timeout; expiry surfaces as
//! [`Error::Timeout`] and ends the connection.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::chunk::{validate_chunk_size, ChunkDecoder, ChunkEncoder};
use crate::protocol::constants::*;
use crate::protocol::cursor::ByteReader;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{RtmpMessage, SharedMessage};
use crate::protocol::packet::{Packet, TransactionTracker};

const READ_BUFFER_SIZE: usize = 64 * 1024;

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(limit)),
    }
}

/// Run the simple handshake on `stream`.
///
/// Returns whatever the peer sent after its last handshake packet; those
/// bytes already belong to the chunk stream.
pub async fn handshake<S>(stream: &mut S, role: HandshakeRole, limit: Duration) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(role);
    let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);

    if let Some(c0c1) = handshake.start()? {
        with_timeout(limit, stream.write_all(&c0c1)).await?;
    }

    while !handshake.is_done() {
        if let Some(reply) = handshake.process(&mut buf)? {
            with_timeout(limit, stream.write_all(&reply)).await?;
            continue;
        }
        if handshake.is_done() {
            break;
        }
        let n = with_timeout(limit, stream.read_buf(&mut buf)).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
    with_timeout(limit, stream.flush()).await?;

    tracing::trace!(role = ?role, leftover = buf.len(), "Handshake complete");
    Ok(buf)
}

/// Reads and reassembles messages from the inbound half.
///
/// Set Chunk Size and Abort are applied here before the message is handed
/// to the caller, so chunk state never lags behind the peer.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
    decoder: ChunkDecoder,
    tracker: TransactionTracker,
    bytes_read: Arc<AtomicU64>,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, tracker: TransactionTracker, timeout: Duration) -> Self {
        Self::with_buffer(inner, BytesMut::new(), tracker, timeout)
    }

    /// Start with bytes already read from the stream
    pub fn with_buffer(
        inner: R,
        mut buf: BytesMut,
        tracker: TransactionTracker,
        timeout: Duration,
    ) -> Self {
        buf.reserve(READ_BUFFER_SIZE);
        Self {
            inner,
            bytes_read: Arc::new(AtomicU64::new(buf.len() as u64)),
            buf,
            decoder: ChunkDecoder::new(),
            tracker,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn in_chunk_size(&self) -> u32 {
        self.decoder.in_chunk_size()
    }

    /// Total bytes received, shared so acknowledgements can be computed
    /// outside the reading task
    pub fn bytes_read(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_read)
    }

    pub fn tracker(&self) -> &TransactionTracker {
        &self.tracker
    }

    /// Read the next complete message
    pub async fn read_message(&mut self) -> Result<RtmpMessage> {
        loop {
            if let Some(msg) = self.decoder.decode(&mut self.buf)? {
                self.on_message(&msg)?;
                return Ok(msg);
            }

            let n = with_timeout(self.timeout, self.inner.read_buf(&mut self.buf)).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Read the next message and decode it if it is not media
    pub async fn read_packet(&mut self) -> Result<(RtmpMessage, Option<Packet>)> {
        let msg = self.read_message().await?;
        if msg.header.is_audio() || msg.header.is_video() || msg.header.is_aggregate() {
            return Ok((msg, None));
        }
        let packet = Packet::decode(&msg, &self.tracker)?;
        Ok((msg, Some(packet)))
    }

    fn on_message(&mut self, msg: &RtmpMessage) -> Result<()> {
        if msg.header.is_set_chunk_size() {
            let size = ByteReader::new(&msg.payload).read_u32()? & TIMESTAMP_MASK;
            self.decoder.set_in_chunk_size(size)?;
            tracing::debug!(chunk_size = size, "Peer changed chunk size");
        } else if msg.header.is_abort() {
            let csid = ByteReader::new(&msg.payload).read_u32()?;
            self.decoder.abort(csid);
        }
        Ok(())
    }
}

/// Chunks and writes messages to the outbound half
pub struct MessageWriter<W> {
    inner: W,
    buf: BytesMut,
    encoder: ChunkEncoder,
    tracker: TransactionTracker,
    bytes_written: u64,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W, tracker: TransactionTracker, timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            encoder: ChunkEncoder::new(),
            tracker,
            bytes_written: 0,
            timeout,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn out_chunk_size(&self) -> u32 {
        self.encoder.out_chunk_size()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn send_message(&mut self, msg: &SharedMessage) -> Result<()> {
        self.encoder.encode(msg, &mut self.buf)?;
        self.flush_buf().await
    }

    /// Chunk several messages into one write
    pub async fn send_messages(&mut self, msgs: &[SharedMessage]) -> Result<()> {
        for msg in msgs {
            self.encoder.encode(msg, &mut self.buf)?;
        }
        self.flush_buf().await
    }

    /// Send a packet on `stream_id`.
    ///
    /// Requests are recorded for response matching. A Set Chunk Size takes
    /// effect for every message after itself.
    pub async fn send_packet(&mut self, packet: &Packet, stream_id: u32) -> Result<()> {
        if let Packet::SetChunkSize(size) = packet {
            validate_chunk_size(*size)?;
        }
        if let Some((transaction_id, command)) = packet.request() {
            self.tracker.record(transaction_id, command);
        }

        self.send_message(&packet.to_message(0, stream_id)).await?;

        if let Packet::SetChunkSize(size) = packet {
            self.encoder.set_out_chunk_size(*size)?;
        }
        Ok(())
    }

    /// Announce a new outbound chunk size and switch to it
    pub async fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        self.send_packet(&Packet::SetChunkSize(size), 0).await
    }

    async fn flush_buf(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let len = self.buf.len();
        with_timeout(self.timeout, self.inner.write_all(&self.buf)).await?;
        with_timeout(self.timeout, self.inner.flush()).await?;
        self.buf.clear();
        self.bytes_written += len as u64;
        Ok(())
    }
}

/// Acknowledgement window accounting for the inbound direction
#[derive(Debug, Default)]
pub struct AckWindow {
    window: u32,
    acked: u64,
}

impl AckWindow {
    pub fn new(window: u32) -> Self {
        Self { window, acked: 0 }
    }

    /// Peer sent Window Acknowledgement Size
    pub fn set_window(&mut self, window: u32) {
        self.window = window;
    }

    /// Sequence number to acknowledge, if `total` bytes crossed the window
    pub fn check(&mut self, total: u64) -> Option<u32> {
        if self.window == 0 || total.saturating_sub(self.acked) < u64::from(self.window) {
            return None;
        }
        self.acked = total;
        // Sequence numbers wrap at 32 bits
        Some(total as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::AmfValue;
    use bytes::Bytes;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task =
            tokio::spawn(async move { handshake(&mut server, HandshakeRole::Server, LIMIT).await });
        let leftover = handshake(&mut client, HandshakeRole::Client, LIMIT)
            .await
            .unwrap();
        assert!(leftover.is_empty());
        assert!(server_task.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_version_fails() {
        let mut c0c1 = vec![6u8];
        c0c1.extend_from_slice(&[0u8; HANDSHAKE_SIZE]);
        let mut stream = tokio_test::io::Builder::new().read(&c0c1).build();

        let err = handshake(&mut stream, HandshakeRole::Server, LIMIT)
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_packets_roundtrip_and_chunk_size_applies() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let tracker = TransactionTracker::new();
        let mut writer = MessageWriter::new(client, tracker.clone(), LIMIT);
        let mut reader = MessageReader::new(server, TransactionTracker::new(), LIMIT);

        writer.send_packet(&Packet::SetChunkSize(4096), 0).await.unwrap();
        assert_eq!(writer.out_chunk_size(), 4096);

        let payload = Bytes::from(vec![0x27u8; 10_000]);
        writer
            .send_message(&SharedMessage::video(40, payload.clone()))
            .await
            .unwrap();

        let (msg, packet) = reader.read_packet().await.unwrap();
        assert_eq!(packet, Some(Packet::SetChunkSize(4096)));
        assert_eq!(msg.csid, CSID_PROTOCOL_CONTROL);
        assert_eq!(reader.in_chunk_size(), 4096);

        let (msg, packet) = reader.read_packet().await.unwrap();
        assert!(packet.is_none());
        assert_eq!(msg.header.timestamp, 40);
        assert_eq!(msg.payload, payload);

        let total = reader.bytes_read().load(Ordering::Relaxed);
        assert_eq!(total, writer.bytes_written());
    }

    #[tokio::test]
    async fn test_requests_are_tracked() {
        let (client, _server) = tokio::io::duplex(8192);
        let tracker = TransactionTracker::new();
        let mut writer = MessageWriter::new(client, tracker.clone(), LIMIT);

        let connect = Packet::Connect {
            command_object: AmfValue::object().with("app", "live"),
            args: None,
        };
        writer.send_packet(&connect, 0).await.unwrap();
        assert_eq!(tracker.take(1.0).as_deref(), Some("connect"));
    }

    #[tokio::test]
    async fn test_invalid_chunk_size_not_sent() {
        let (client, _server) = tokio::io::duplex(8192);
        let mut writer = MessageWriter::new(client, TransactionTracker::new(), LIMIT);
        assert!(writer.send_packet(&Packet::SetChunkSize(64), 0).await.is_err());
        assert_eq!(writer.bytes_written(), 0);
        assert_eq!(writer.out_chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let stream = tokio_test::io::Builder::new().build();
        let mut reader = MessageReader::new(stream, TransactionTracker::new(), LIMIT);
        assert!(matches!(
            reader.read_message().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader =
            MessageReader::new(server, TransactionTracker::new(), Duration::from_millis(20));
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn test_ack_window() {
        let mut ack = AckWindow::new(1000);
        assert_eq!(ack.check(999), None);
        assert_eq!(ack.check(1000), Some(1000));
        assert_eq!(ack.check(1999), None);
        assert_eq!(ack.check(2500), Some(2500));

        ack.set_window(0);
        assert_eq!(ack.check(1_000_000), None);
    }
}
