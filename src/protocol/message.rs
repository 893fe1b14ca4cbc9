//! RTMP messages
//!
//! Two forms exist. [`RtmpMessage`] is what the chunk decoder produces: a
//! uniquely owned message straight off the wire. [`SharedMessage`] is the
//! fan-out form: the payload is reference counted and never mutated again,
//! while `timestamp` and `stream_id` are per-copy fields each consumer may
//! rewrite for itself. Cloning a `SharedMessage` never copies payload bytes.

use bytes::Bytes;

use super::constants::*;

/// Message header as carried by a fmt0 chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Absolute timestamp in milliseconds, 31 bits
    pub timestamp: u32,
    pub payload_length: u32,
    pub message_type: u8,
    pub stream_id: u32,
}

impl MessageHeader {
    pub fn new(message_type: u8, timestamp: u32, stream_id: u32, payload_length: u32) -> Self {
        Self {
            timestamp,
            payload_length,
            message_type,
            stream_id,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.message_type == MSG_AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.message_type == MSG_VIDEO
    }

    pub fn is_aggregate(&self) -> bool {
        self.message_type == MSG_AGGREGATE
    }

    pub fn is_set_chunk_size(&self) -> bool {
        self.message_type == MSG_SET_CHUNK_SIZE
    }

    pub fn is_abort(&self) -> bool {
        self.message_type == MSG_ABORT
    }
}

/// A complete message reassembled from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    pub header: MessageHeader,
    /// Chunk stream the message arrived on
    pub csid: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(header: MessageHeader, csid: u32, payload: Bytes) -> Self {
        Self {
            header,
            csid,
            payload,
        }
    }

    /// Hand the payload over to the shared form; no bytes are copied.
    pub fn into_shared(self) -> SharedMessage {
        SharedMessage {
            timestamp: self.header.timestamp,
            stream_id: self.header.stream_id,
            message_type: self.header.message_type,
            csid: self.csid,
            payload: self.payload,
        }
    }
}

/// Reference-counted message with a per-copy envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMessage {
    /// Per-copy; consumers rewrite it during jitter correction
    pub timestamp: u32,
    /// Per-copy; set to the playing client's stream id before sending
    pub stream_id: u32,
    pub message_type: u8,
    /// Chunk stream to send on
    pub csid: u32,
    payload: Bytes,
}

impl SharedMessage {
    pub fn new(message_type: u8, timestamp: u32, stream_id: u32, csid: u32, payload: Bytes) -> Self {
        Self {
            timestamp,
            stream_id,
            message_type,
            csid,
            payload,
        }
    }

    /// Audio message on the audio chunk stream
    pub fn audio(timestamp: u32, payload: Bytes) -> Self {
        Self::new(MSG_AUDIO, timestamp, 0, CSID_AUDIO, payload)
    }

    /// Video message on the video chunk stream
    pub fn video(timestamp: u32, payload: Bytes) -> Self {
        Self::new(MSG_VIDEO, timestamp, 0, CSID_VIDEO, payload)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader::new(
            self.message_type,
            self.timestamp,
            self.stream_id,
            self.payload_length(),
        )
    }

    pub fn is_audio(&self) -> bool {
        self.message_type == MSG_AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.message_type == MSG_VIDEO
    }

    pub fn is_av(&self) -> bool {
        self.is_audio() || self.is_video()
    }

    /// Script data (onMetaData and friends)
    pub fn is_data(&self) -> bool {
        matches!(self.message_type, MSG_DATA_AMF0 | MSG_DATA_AMF3)
    }
}
