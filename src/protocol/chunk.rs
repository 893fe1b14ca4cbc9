//! Chunk stream framing
//!
//! ```text
//! +--------------+----------------+--------------------+--------------+
//! | Basic Header | Message Header | Extended Timestamp |  Chunk Data  |
//! +--------------+----------------+--------------------+--------------+
//!    1-3 bytes     0/3/7/11 bytes       0/4 bytes        <= chunk size
//! ```
//!
//! The decoder keeps one [`ChunkStream`] per chunk stream id and is fed a
//! growing `BytesMut`. A chunk is only consumed once it is completely
//! buffered, so a short read never leaves the decoder half-updated and the
//! caller can simply read more bytes and try again.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use super::cursor::{ByteReader, ByteWriter};
use super::message::{MessageHeader, RtmpMessage, SharedMessage};
use super::quirks;
use crate::error::{OutOfBounds, ProtocolError};

/// Per chunk-stream-id decoding state
#[derive(Debug, Default, Clone)]
struct ChunkStream {
    /// Last header seen, used to resolve fmt1/2/3 deltas
    header: MessageHeader,
    timestamp_delta: u32,
    /// Whether the header that started the current message used 0xFFFFFF
    extended_timestamp: bool,
    /// Payload of the message being reassembled
    partial: Option<BytesMut>,
    /// Chunk headers seen on this id
    msg_count: u64,
}

/// Chunk header resolved against its stream state, not yet committed
struct ParsedChunk {
    csid: u32,
    header_len: usize,
    header: MessageHeader,
    timestamp_delta: u32,
    extended_timestamp: bool,
    payload_len: usize,
}

/// Converts a cursor underflow into "wait for more bytes".
macro_rules! need {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(OutOfBounds { .. }) => return Ok(None),
        }
    };
}

/// Reassembles messages from chunks
#[derive(Debug)]
pub struct ChunkDecoder {
    in_chunk_size: u32,
    /// Pre-allocated state for the low ids nearly every peer uses
    fast: Vec<ChunkStream>,
    others: HashMap<u32, ChunkStream>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            fast: vec![ChunkStream::default(); CHUNK_STREAM_CACHE],
            others: HashMap::new(),
        }
    }

    pub fn in_chunk_size(&self) -> u32 {
        self.in_chunk_size
    }

    /// Apply a peer's SetChunkSize; only affects inbound framing.
    pub fn set_in_chunk_size(&mut self, size: u32) -> Result<(), ProtocolError> {
        validate_chunk_size(size)?;
        tracing::debug!(old = self.in_chunk_size, new = size, "In chunk size changed");
        self.in_chunk_size = size;
        Ok(())
    }

    /// Drop a partially received message (Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(stream) = self.get(csid) {
            if stream.partial.is_some() {
                tracing::debug!(csid = csid, "Aborting partial message");
            }
        }
        self.stream_mut(csid).partial = None;
    }

    fn get(&self, csid: u32) -> Option<&ChunkStream> {
        if (csid as usize) < CHUNK_STREAM_CACHE {
            self.fast.get(csid as usize)
        } else {
            self.others.get(&csid)
        }
    }

    fn stream_mut(&mut self, csid: u32) -> &mut ChunkStream {
        if (csid as usize) < CHUNK_STREAM_CACHE {
            &mut self.fast[csid as usize]
        } else {
            self.others.entry(csid).or_default()
        }
    }

    /// Decode chunks from `buf` until one message completes.
    ///
    /// Consumed bytes are removed from `buf`. Returns `Ok(None)` when more
    /// input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpMessage>, ProtocolError> {
        loop {
            let Some(chunk) = self.parse_chunk(buf)? else {
                return Ok(None);
            };

            let in_chunk_size = self.in_chunk_size;
            let stream = self.stream_mut(chunk.csid);
            stream.header = chunk.header;
            stream.timestamp_delta = chunk.timestamp_delta;
            stream.extended_timestamp = chunk.extended_timestamp;
            stream.msg_count += 1;

            buf.advance(chunk.header_len);
            // Capacity follows received chunks, not the declared length
            let partial = stream.partial.get_or_insert_with(|| {
                BytesMut::with_capacity(chunk.header.payload_length.min(in_chunk_size) as usize)
            });
            partial.put_slice(&buf[..chunk.payload_len]);
            buf.advance(chunk.payload_len);

            tracing::trace!(
                csid = chunk.csid,
                chunk_bytes = chunk.payload_len,
                received = partial.len(),
                total = chunk.header.payload_length,
                chunk_size = in_chunk_size,
                "Chunk read"
            );

            if partial.len() as u32 == chunk.header.payload_length {
                let payload = stream.partial.take().map(BytesMut::freeze).unwrap_or_default();
                return Ok(Some(RtmpMessage::new(chunk.header, chunk.csid, payload)));
            }
        }
    }

    /// Resolve the next chunk without mutating any state.
    fn parse_chunk(&self, buf: &[u8]) -> Result<Option<ParsedChunk>, ProtocolError> {
        let mut r = ByteReader::new(buf);

        // Basic header
        let b0 = need!(r.read_u8());
        let fmt = b0 >> 6;
        let csid = match b0 & 0x3F {
            0 => 64 + need!(r.read_u8()) as u32,
            1 => {
                let b1 = need!(r.read_u8()) as u32;
                let b2 = need!(r.read_u8()) as u32;
                64 + b1 + b2 * 256
            }
            id => id as u32,
        };

        let fresh = ChunkStream::default();
        let stream = self.get(csid).unwrap_or(&fresh);
        let first_chunk_of_msg = stream.partial.is_none();

        if stream.msg_count == 0 && fmt != CHUNK_FMT_0 {
            if quirks::allows_short_first_header(csid, fmt) {
                tracing::warn!(csid = csid, fmt = fmt, "Fresh chunk stream started without fmt0");
            } else {
                return Err(ProtocolError::InvalidFirstChunk { csid, fmt });
            }
        }
        if let Some(partial) = &stream.partial {
            if fmt == CHUNK_FMT_0 {
                return Err(ProtocolError::ChunkInterrupted {
                    csid,
                    partial: partial.len(),
                });
            }
        }

        let mut header = stream.header;
        let mut timestamp_delta = stream.timestamp_delta;
        let mut extended_timestamp = stream.extended_timestamp;

        if fmt <= CHUNK_FMT_2 {
            let ts = need!(r.read_u24());
            extended_timestamp = ts >= EXTENDED_TIMESTAMP;
            timestamp_delta = ts;
            if !extended_timestamp {
                if fmt == CHUNK_FMT_0 {
                    header.timestamp = ts;
                } else {
                    header.timestamp = header.timestamp.wrapping_add(ts);
                }
            }

            if fmt <= CHUNK_FMT_1 {
                let payload_length = need!(r.read_u24());
                if let Some(partial) = &stream.partial {
                    if payload_length != header.payload_length {
                        tracing::debug!(csid = csid, received = partial.len(), "Payload length changed");
                        return Err(ProtocolError::PayloadLengthChanged {
                            csid,
                            expected: header.payload_length,
                            actual: payload_length,
                        });
                    }
                }
                header.payload_length = payload_length;
                header.message_type = need!(r.read_u8());
                if fmt == CHUNK_FMT_0 {
                    header.stream_id = need!(r.read_u32_le());
                }
            }
        } else if first_chunk_of_msg && !extended_timestamp {
            // fmt3 opening a new message repeats the previous delta
            header.timestamp = header.timestamp.wrapping_add(timestamp_delta);
        }

        if extended_timestamp {
            let ts = need!(r.read_u32()) & TIMESTAMP_MASK;
            // A continuation chunk may omit the repeated extended field even
            // though the message started with one; leave those bytes alone.
            if !first_chunk_of_msg && header.timestamp > 0 && header.timestamp != ts {
                tracing::warn!(
                    csid = csid,
                    expected = header.timestamp,
                    found = ts,
                    "Extended timestamp missing on continuation chunk, rewinding"
                );
                need!(r.skip(-4));
            } else {
                header.timestamp = ts;
            }
        }
        header.timestamp &= TIMESTAMP_MASK;

        let received = stream.partial.as_ref().map_or(0, BytesMut::len) as u32;
        let payload_len = (header.payload_length - received).min(self.in_chunk_size) as usize;
        let header_len = r.position();
        if !r.require(payload_len) {
            return Ok(None);
        }

        Ok(Some(ParsedChunk {
            csid,
            header_len,
            header,
            timestamp_delta,
            extended_timestamp,
            payload_len,
        }))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits messages into chunks
#[derive(Debug)]
pub struct ChunkEncoder {
    out_chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            out_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn out_chunk_size(&self) -> u32 {
        self.out_chunk_size
    }

    /// Change outbound chunking; the peer must be told first.
    pub fn set_out_chunk_size(&mut self, size: u32) -> Result<(), ProtocolError> {
        validate_chunk_size(size)?;
        self.out_chunk_size = size;
        Ok(())
    }

    /// Append the chunks of `msg` to `out`.
    ///
    /// The first chunk carries a fmt0 header, the rest fmt3. When the
    /// timestamp needs the extended field it is repeated after every fmt3
    /// header as well.
    pub fn encode(&self, msg: &SharedMessage, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload: &Bytes = msg.payload();
        let chunk_size = self.out_chunk_size as usize;
        let chunks = payload.len().div_ceil(chunk_size).max(1);
        out.reserve(payload.len() + chunks * MAX_CHUNK_HEADER_SIZE);

        let mut header = [0u8; MAX_CHUNK_HEADER_SIZE];
        let mut offset = 0;
        loop {
            let len = if offset == 0 {
                write_c0_header(&mut header, msg)?
            } else {
                write_c3_header(&mut header, msg)?
            };
            out.put_slice(&header[..len]);

            let end = (offset + chunk_size).min(payload.len());
            out.put_slice(&payload[offset..end]);
            offset = end;
            if offset >= payload.len() {
                return Ok(());
            }
        }
    }

    /// Convenience wrapper returning the encoded bytes
    pub fn encode_to_bytes(&self, msg: &SharedMessage) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        self.encode(msg, &mut out)?;
        Ok(out.freeze())
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_chunk_size(size: u32) -> Result<(), ProtocolError> {
    if (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidChunkSize(size))
    }
}

fn write_basic_header(w: &mut ByteWriter<'_>, fmt: u8, csid: u32) -> Result<(), OutOfBounds> {
    let fmt = fmt << 6;
    if csid < 64 {
        w.write_u8(fmt | csid as u8)
    } else if csid < 320 {
        w.write_u8(fmt)?;
        w.write_u8((csid - 64) as u8)
    } else {
        let id = csid.min(MAX_CSID) - 64;
        w.write_u8(fmt | 1)?;
        w.write_u8((id & 0xFF) as u8)?;
        w.write_u8((id >> 8) as u8)
    }
}

fn write_c0_header(buf: &mut [u8], msg: &SharedMessage) -> Result<usize, OutOfBounds> {
    let mut w = ByteWriter::new(buf);
    write_basic_header(&mut w, CHUNK_FMT_0, msg.csid)?;
    w.write_u24(msg.timestamp.min(EXTENDED_TIMESTAMP))?;
    w.write_u24(msg.payload_length())?;
    w.write_u8(msg.message_type)?;
    w.write_u32_le(msg.stream_id)?;
    if msg.timestamp >= EXTENDED_TIMESTAMP {
        w.write_u32(msg.timestamp)?;
    }
    Ok(w.position())
}

fn write_c3_header(buf: &mut [u8], msg: &SharedMessage) -> Result<usize, OutOfBounds> {
    let mut w = ByteWriter::new(buf);
    write_basic_header(&mut w, CHUNK_FMT_3, msg.csid)?;
    if msg.timestamp >= EXTENDED_TIMESTAMP {
        w.write_u32(msg.timestamp)?;
    }
    Ok(w.position())
}
