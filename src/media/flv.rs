//! FLV tag classification
//!
//! RTMP audio and video payloads are FLV tag bodies. Only the first one or
//! two bytes matter for routing decisions:
//!
//! ```text
//! video: +-----------+---------+------------------+
//!        | FrameType | CodecID | AVCPacketType .. |
//!        |  4 bits   | 4 bits  | 8 bits           |
//!        +-----------+---------+------------------+
//!
//! audio: +-------------+------+------+------+-----------------+
//!        | SoundFormat | Rate | Size | Type | AACPacketType ..|
//!        |   4 bits    | 2    | 1    | 1    | 8 bits          |
//!        +-------------+------+------+------+-----------------+
//! ```
//!
//! Aggregate messages (type 22) carry a run of complete FLV tags, each with
//! its 11-byte tag header and 4-byte trailing previous-tag-size.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::protocol::constants::{CSID_OVER_CONNECTION2, MSG_AUDIO, MSG_DATA_AMF0, MSG_VIDEO};
use crate::protocol::cursor::ByteReader;
use crate::protocol::message::SharedMessage;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            MSG_AUDIO => Some(FlvTagType::Audio),
            MSG_VIDEO => Some(FlvTagType::Video),
            MSG_DATA_AMF0 => Some(FlvTagType::Script),
            _ => None,
        }
    }

    fn message_type(self) -> u8 {
        match self {
            FlvTagType::Audio => MSG_AUDIO,
            FlvTagType::Video => MSG_VIDEO,
            FlvTagType::Script => MSG_DATA_AMF0,
        }
    }
}

/// One tag pulled out of an aggregate message
#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    pub timestamp: u32,
    pub data: Bytes,
}

impl FlvTag {
    pub fn into_message(self, stream_id: u32) -> SharedMessage {
        match self.tag_type {
            FlvTagType::Audio => {
                let mut msg = SharedMessage::audio(self.timestamp, self.data);
                msg.stream_id = stream_id;
                msg
            }
            FlvTagType::Video => {
                let mut msg = SharedMessage::video(self.timestamp, self.data);
                msg.stream_id = stream_id;
                msg
            }
            FlvTagType::Script => SharedMessage::new(
                self.tag_type.message_type(),
                self.timestamp,
                stream_id,
                CSID_OVER_CONNECTION2,
                self.data,
            ),
        }
    }
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }
}

/// Video codec id (lower 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    Avc = 7,
    Hevc = 12,
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    /// Codecs whose packets carry a packet-type byte with 0 = sequence header
    fn has_sequence_header(self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc | VideoCodec::Av1)
    }
}

/// Audio format (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Opus = 13,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            13 => Some(AudioFormat::Opus),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }
}

/// Key frame, including the sequence header which is flagged as one
pub fn is_video_keyframe(data: &[u8]) -> bool {
    data.first()
        .and_then(|b| VideoFrameType::from_byte(*b))
        .is_some_and(|ft| ft == VideoFrameType::Keyframe)
}

/// AVC/HEVC/AV1 decoder configuration record
pub fn is_video_sequence_header(data: &[u8]) -> bool {
    if data.len() < 2 || !is_video_keyframe(data) {
        return false;
    }
    VideoCodec::from_byte(data[0]).is_some_and(VideoCodec::has_sequence_header) && data[1] == 0
}

/// AAC AudioSpecificConfig
pub fn is_audio_sequence_header(data: &[u8]) -> bool {
    data.len() >= 2 && AudioFormat::from_byte(data[0]) == Some(AudioFormat::Aac) && data[1] == 0
}

/// Whether a video payload has a frame type and codec worth forwarding
pub fn is_video_acceptable(data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };
    VideoFrameType::from_byte(first).is_some() && VideoCodec::from_byte(first).is_some()
}

pub fn is_audio_acceptable(data: &[u8]) -> bool {
    data.first()
        .is_some_and(|b| AudioFormat::from_byte(*b).is_some())
}

/// Split an aggregate message into its tags.
///
/// Tag timestamps are rebased so the first tag lands on the aggregate
/// message's own timestamp.
pub fn split_aggregate(payload: &Bytes, timestamp: u32) -> Result<Vec<FlvTag>, ProtocolError> {
    let mut r = ByteReader::new(payload);
    let mut tags = Vec::new();
    let mut delta: Option<i64> = None;

    while !r.is_empty() {
        let type_byte = r.read_u8()?;
        let size = r.read_u24()? as usize;
        let ts_low = r.read_u24()?;
        let ts_high = r.read_u8()?;
        r.skip(3)?;
        let start = r.position();
        r.skip(size as isize)?;
        r.skip(4)?;

        let tag_ts = i64::from(ts_low | (u32::from(ts_high) << 24));
        let base = *delta.get_or_insert(i64::from(timestamp) - tag_ts);

        let Some(tag_type) = FlvTagType::from_byte(type_byte) else {
            tracing::debug!(tag_type = type_byte, "Skipping unknown tag in aggregate");
            continue;
        };
        tags.push(FlvTag {
            tag_type,
            timestamp: (tag_ts + base).max(0) as u32,
            data: payload.slice(start..start + size),
        });
    }

    Ok(tags)
}
