//! Control and command packets
//!
//! Every message that is not audio or video decodes into one closed
//! [`Packet`] enum. Protocol control messages (types 1-6) have fixed binary
//! layouts; command (20/17) and data (18/15) messages are AMF0 value
//! sequences whose first value names the packet.
//!
//! ```text
//! command:  name(string) transaction_id(number) command_object args...
//! data:     name(string) values...
//! ```
//!
//! `_result` and `_error` do not say what they answer. The sender records
//! each request it makes in a [`TransactionTracker`], and the decoder uses
//! it to pick the response variant.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::amf::{amf0, Amf0Decoder, AmfValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;
use crate::protocol::cursor::ByteReader;
use crate::protocol::message::{RtmpMessage, SharedMessage};
use crate::protocol::quirks;

/// The three commands of the FMLE publish preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmleCommand {
    ReleaseStream,
    FcPublish,
    FcUnpublish,
}

impl FmleCommand {
    pub fn name(self) -> &'static str {
        match self {
            FmleCommand::ReleaseStream => CMD_RELEASE_STREAM,
            FmleCommand::FcPublish => CMD_FC_PUBLISH,
            FmleCommand::FcUnpublish => CMD_FC_UNPUBLISH,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            CMD_RELEASE_STREAM => Some(FmleCommand::ReleaseStream),
            CMD_FC_PUBLISH => Some(FmleCommand::FcPublish),
            CMD_FC_UNPUBLISH => Some(FmleCommand::FcUnpublish),
            _ => None,
        }
    }
}

/// User control event (message type 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: u32 },
}

/// Every non-media message a connection can send or receive
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect {
        command_object: AmfValue,
        args: Option<AmfValue>,
    },
    ConnectResult {
        transaction_id: f64,
        props: AmfValue,
        info: AmfValue,
    },
    CreateStream {
        transaction_id: f64,
    },
    CreateStreamResult {
        transaction_id: f64,
        stream_id: f64,
    },
    FmleStart {
        command: FmleCommand,
        transaction_id: f64,
        stream_name: String,
    },
    FmleStartResult {
        transaction_id: f64,
    },
    Publish {
        transaction_id: f64,
        stream_name: String,
        publish_type: String,
    },
    Play {
        transaction_id: f64,
        stream_name: String,
        start: f64,
        duration: f64,
        reset: bool,
    },
    Pause {
        transaction_id: f64,
        is_pause: bool,
        time_ms: f64,
    },
    CloseStream {
        transaction_id: f64,
    },
    /// `onStatus`, `onFCPublish` or `onFCUnpublish` sent as a command
    OnStatusCall {
        command: String,
        info: AmfValue,
    },
    OnBwDone,
    /// Command with a name this crate does not interpret
    Call {
        command: String,
        transaction_id: f64,
        args: Vec<AmfValue>,
    },
    /// `_result` or `_error` answering a [`Packet::Call`]
    CallResult {
        command: String,
        transaction_id: f64,
        args: Vec<AmfValue>,
    },
    OnStatusData {
        info: AmfValue,
    },
    SampleAccess {
        video: bool,
        audio: bool,
    },
    OnMetaData {
        metadata: AmfValue,
    },
    /// Data message with a name this crate does not interpret
    Data {
        name: String,
        values: Vec<AmfValue>,
    },
    SetChunkSize(u32),
    Abort(u32),
    Acknowledgement(u32),
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth {
        size: u32,
        limit_type: u8,
    },
}

/// Transaction id to request name, for correlating `_result`/`_error`
#[derive(Debug, Clone, Default)]
pub struct TransactionTracker {
    requests: Arc<Mutex<HashMap<u64, String>>>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, transaction_id: f64, command: &str) {
        self.requests
            .lock()
            .insert(transaction_id.to_bits(), command.to_string());
    }

    /// Remove and return the request a response answers
    pub fn take(&self, transaction_id: f64) -> Option<String> {
        self.requests.lock().remove(&transaction_id.to_bits())
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sequential reader over the AMF0 values of one command or data message
struct Values<'a> {
    command: String,
    reader: ByteReader<'a>,
    decoder: Amf0Decoder,
}

impl<'a> Values<'a> {
    fn new(payload: &'a [u8]) -> Result<Self> {
        let mut values = Self {
            command: String::new(),
            reader: ByteReader::new(payload),
            decoder: Amf0Decoder::new(),
        };
        let name = values.next()?;
        match name {
            AmfValue::String(s) => values.command = s,
            _ => return Err(values.malformed("first value is not a string")),
        }
        Ok(values)
    }

    fn has_more(&self) -> bool {
        !self.reader.is_empty()
    }

    fn next(&mut self) -> Result<AmfValue> {
        Ok(self.decoder.decode(&mut self.reader)?)
    }

    fn next_opt(&mut self) -> Result<Option<AmfValue>> {
        if self.has_more() {
            self.next().map(Some)
        } else {
            Ok(None)
        }
    }

    fn number(&mut self, what: &'static str) -> Result<f64> {
        match self.next() {
            Ok(AmfValue::Number(n)) => Ok(n),
            Ok(_) => Err(self.malformed(what)),
            Err(e) => Err(e),
        }
    }

    fn string(&mut self, what: &'static str) -> Result<String> {
        match self.next() {
            Ok(AmfValue::String(s)) => Ok(s),
            Ok(_) => Err(self.malformed(what)),
            Err(e) => Err(e),
        }
    }

    fn rest(&mut self) -> Result<Vec<AmfValue>> {
        Ok(self.decoder.decode_all(&mut self.reader)?)
    }

    fn malformed(&self, reason: &'static str) -> crate::error::Error {
        ProtocolError::MalformedCommand {
            command: self.command.clone(),
            reason,
        }
        .into()
    }
}

impl Packet {
    /// Decode a non-media message.
    ///
    /// Audio, video and aggregate messages are not packets and yield
    /// [`ProtocolError::UnexpectedMessage`].
    pub fn decode(msg: &RtmpMessage, tracker: &TransactionTracker) -> Result<Packet> {
        let payload = &msg.payload[..];
        match msg.header.message_type {
            MSG_SET_CHUNK_SIZE => Ok(Packet::SetChunkSize(read_u32(payload)? & TIMESTAMP_MASK)),
            MSG_ABORT => Ok(Packet::Abort(read_u32(payload)?)),
            MSG_ACKNOWLEDGEMENT => Ok(Packet::Acknowledgement(read_u32(payload)?)),
            MSG_WINDOW_ACK_SIZE => Ok(Packet::WindowAckSize(read_u32(payload)?)),
            MSG_SET_PEER_BANDWIDTH => {
                let mut r = ByteReader::new(payload);
                let size = r.read_u32()?;
                // Some clients omit the limit type
                let limit_type = r.read_u8().unwrap_or(BANDWIDTH_LIMIT_DYNAMIC);
                Ok(Packet::SetPeerBandwidth { size, limit_type })
            }
            MSG_USER_CONTROL => Ok(Packet::UserControl(decode_user_control(payload)?)),
            MSG_COMMAND_AMF0 => decode_command(payload, tracker),
            MSG_COMMAND_AMF3 => decode_command(quirks::skip_amf3_format_byte(payload), tracker),
            MSG_DATA_AMF0 => decode_data(payload),
            MSG_DATA_AMF3 => decode_data(quirks::skip_amf3_format_byte(payload)),
            other => Err(ProtocolError::UnexpectedMessage(other).into()),
        }
    }

    pub fn message_type(&self) -> u8 {
        match self {
            Packet::SetChunkSize(_) => MSG_SET_CHUNK_SIZE,
            Packet::Abort(_) => MSG_ABORT,
            Packet::Acknowledgement(_) => MSG_ACKNOWLEDGEMENT,
            Packet::UserControl(_) => MSG_USER_CONTROL,
            Packet::WindowAckSize(_) => MSG_WINDOW_ACK_SIZE,
            Packet::SetPeerBandwidth { .. } => MSG_SET_PEER_BANDWIDTH,
            Packet::OnStatusData { .. }
            | Packet::SampleAccess { .. }
            | Packet::OnMetaData { .. }
            | Packet::Data { .. } => MSG_DATA_AMF0,
            _ => MSG_COMMAND_AMF0,
        }
    }

    /// Chunk stream id this packet is sent on
    pub fn preferred_csid(&self) -> u32 {
        match self {
            Packet::SetChunkSize(_)
            | Packet::Abort(_)
            | Packet::Acknowledgement(_)
            | Packet::UserControl(_)
            | Packet::WindowAckSize(_)
            | Packet::SetPeerBandwidth { .. } => CSID_PROTOCOL_CONTROL,
            Packet::OnStatusCall { .. }
            | Packet::OnStatusData { .. }
            | Packet::SampleAccess { .. }
            | Packet::Play { .. }
            | Packet::Publish { .. }
            | Packet::Pause { .. } => CSID_OVER_STREAM,
            Packet::OnMetaData { .. } | Packet::Data { .. } => CSID_OVER_CONNECTION2,
            _ => CSID_OVER_CONNECTION,
        }
    }

    /// Request this packet opens, as `(transaction id, command name)`.
    ///
    /// Senders record it so the answer can be matched.
    pub fn request(&self) -> Option<(f64, &str)> {
        match self {
            Packet::Connect { .. } => Some((1.0, CMD_CONNECT)),
            Packet::CreateStream { transaction_id } => Some((*transaction_id, CMD_CREATE_STREAM)),
            Packet::FmleStart {
                command,
                transaction_id,
                ..
            } => Some((*transaction_id, command.name())),
            Packet::Call {
                command,
                transaction_id,
                ..
            } if *transaction_id > 0.0 => Some((*transaction_id, command.as_str())),
            _ => None,
        }
    }

    /// Encode the payload
    pub fn encode(&self) -> Bytes {
        match self {
            Packet::SetChunkSize(v)
            | Packet::Abort(v)
            | Packet::Acknowledgement(v)
            | Packet::WindowAckSize(v) => Bytes::copy_from_slice(&v.to_be_bytes()),
            Packet::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                buf.freeze()
            }
            Packet::UserControl(event) => encode_user_control(event),
            Packet::Connect {
                command_object,
                args,
            } => {
                let mut values = vec![
                    CMD_CONNECT.into(),
                    AmfValue::Number(1.0),
                    command_object.clone(),
                ];
                values.extend(args.iter().cloned());
                amf0::encode_all(&values)
            }
            Packet::ConnectResult {
                transaction_id,
                props,
                info,
            } => amf0::encode_all(&[
                CMD_RESULT.into(),
                (*transaction_id).into(),
                props.clone(),
                info.clone(),
            ]),
            Packet::CreateStream { transaction_id } => amf0::encode_all(&[
                CMD_CREATE_STREAM.into(),
                (*transaction_id).into(),
                AmfValue::Null,
            ]),
            Packet::CreateStreamResult {
                transaction_id,
                stream_id,
            } => amf0::encode_all(&[
                CMD_RESULT.into(),
                (*transaction_id).into(),
                AmfValue::Null,
                (*stream_id).into(),
            ]),
            Packet::FmleStart {
                command,
                transaction_id,
                stream_name,
            } => amf0::encode_all(&[
                command.name().into(),
                (*transaction_id).into(),
                AmfValue::Null,
                stream_name.as_str().into(),
            ]),
            Packet::FmleStartResult { transaction_id } => amf0::encode_all(&[
                CMD_RESULT.into(),
                (*transaction_id).into(),
                AmfValue::Null,
                AmfValue::Undefined,
            ]),
            Packet::Publish {
                transaction_id,
                stream_name,
                publish_type,
            } => amf0::encode_all(&[
                CMD_PUBLISH.into(),
                (*transaction_id).into(),
                AmfValue::Null,
                stream_name.as_str().into(),
                publish_type.as_str().into(),
            ]),
            Packet::Play {
                transaction_id,
                stream_name,
                start,
                duration,
                reset,
            } => amf0::encode_all(&[
                CMD_PLAY.into(),
                (*transaction_id).into(),
                AmfValue::Null,
                stream_name.as_str().into(),
                (*start).into(),
                (*duration).into(),
                (*reset).into(),
            ]),
            Packet::Pause {
                transaction_id,
                is_pause,
                time_ms,
            } => amf0::encode_all(&[
                CMD_PAUSE.into(),
                (*transaction_id).into(),
                AmfValue::Null,
                (*is_pause).into(),
                (*time_ms).into(),
            ]),
            Packet::CloseStream { transaction_id } => amf0::encode_all(&[
                CMD_CLOSE_STREAM.into(),
                (*transaction_id).into(),
                AmfValue::Null,
            ]),
            Packet::OnStatusCall { command, info } => amf0::encode_all(&[
                command.as_str().into(),
                AmfValue::Number(0.0),
                AmfValue::Null,
                info.clone(),
            ]),
            Packet::OnBwDone => {
                amf0::encode_all(&[CMD_ON_BW_DONE.into(), AmfValue::Number(0.0), AmfValue::Null])
            }
            Packet::Call {
                command,
                transaction_id,
                args,
            }
            | Packet::CallResult {
                command,
                transaction_id,
                args,
            } => {
                let mut values = vec![command.as_str().into(), (*transaction_id).into()];
                values.extend(args.iter().cloned());
                amf0::encode_all(&values)
            }
            Packet::OnStatusData { info } => {
                amf0::encode_all(&[CMD_ON_STATUS.into(), info.clone()])
            }
            Packet::SampleAccess { video, audio } => amf0::encode_all(&[
                CMD_SAMPLE_ACCESS.into(),
                (*video).into(),
                (*audio).into(),
            ]),
            Packet::OnMetaData { metadata } => {
                amf0::encode_all(&[CMD_ON_METADATA.into(), metadata.clone()])
            }
            Packet::Data { name, values } => {
                let mut all = vec![name.as_str().into()];
                all.extend(values.iter().cloned());
                amf0::encode_all(&all)
            }
        }
    }

    /// Wrap into a message ready for the chunk encoder
    pub fn to_message(&self, timestamp: u32, stream_id: u32) -> SharedMessage {
        SharedMessage::new(
            self.message_type(),
            timestamp,
            stream_id,
            self.preferred_csid(),
            self.encode(),
        )
    }

    /// `onStatus` command with a standard info object
    pub fn status(level: &str, code: &str, description: &str) -> Self {
        Packet::OnStatusCall {
            command: CMD_ON_STATUS.to_string(),
            info: status_info(level, code, description),
        }
    }

    /// `onStatus` data message with just a code
    pub fn status_data(code: &str) -> Self {
        Packet::OnStatusData {
            info: AmfValue::object().with(STATUS_CODE, code),
        }
    }
}

/// `{level, code, description}` info object
pub fn status_info(level: &str, code: &str, description: &str) -> AmfValue {
    AmfValue::object()
        .with(STATUS_LEVEL, level)
        .with(STATUS_CODE, code)
        .with(STATUS_DESCRIPTION, description)
}

fn read_u32(payload: &[u8]) -> Result<u32> {
    Ok(ByteReader::new(payload).read_u32()?)
}

fn decode_user_control(payload: &[u8]) -> Result<UserControlEvent> {
    let mut r = ByteReader::new(payload);
    let event_type = r.read_u16()?;
    let data = r.read_u32()?;
    Ok(match event_type {
        UC_STREAM_BEGIN => UserControlEvent::StreamBegin(data),
        UC_STREAM_EOF => UserControlEvent::StreamEof(data),
        UC_STREAM_DRY => UserControlEvent::StreamDry(data),
        UC_SET_BUFFER_LENGTH => UserControlEvent::SetBufferLength {
            stream_id: data,
            buffer_ms: r.read_u32()?,
        },
        UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(data),
        UC_PING_REQUEST => UserControlEvent::PingRequest(data),
        UC_PING_RESPONSE => UserControlEvent::PingResponse(data),
        event_type => UserControlEvent::Unknown { event_type, data },
    })
}

fn encode_user_control(event: &UserControlEvent) -> Bytes {
    let (event_type, data, extra) = match *event {
        UserControlEvent::StreamBegin(id) => (UC_STREAM_BEGIN, id, None),
        UserControlEvent::StreamEof(id) => (UC_STREAM_EOF, id, None),
        UserControlEvent::StreamDry(id) => (UC_STREAM_DRY, id, None),
        UserControlEvent::SetBufferLength {
            stream_id,
            buffer_ms,
        } => (UC_SET_BUFFER_LENGTH, stream_id, Some(buffer_ms)),
        UserControlEvent::StreamIsRecorded(id) => (UC_STREAM_IS_RECORDED, id, None),
        UserControlEvent::PingRequest(ts) => (UC_PING_REQUEST, ts, None),
        UserControlEvent::PingResponse(ts) => (UC_PING_RESPONSE, ts, None),
        UserControlEvent::Unknown { event_type, data } => (event_type, data, None),
    };
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u16(event_type);
    buf.put_u32(data);
    if let Some(extra) = extra {
        buf.put_u32(extra);
    }
    buf.freeze()
}

fn decode_command(payload: &[u8], tracker: &TransactionTracker) -> Result<Packet> {
    let mut v = Values::new(payload)?;
    let transaction_id = v.number("transaction id is not a number")?;

    if v.command == CMD_RESULT || v.command == CMD_ERROR {
        return decode_response(v, transaction_id, tracker);
    }

    let packet = match v.command.as_str() {
        CMD_CONNECT => {
            if transaction_id != 1.0 {
                return Err(v.malformed("connect transaction id must be 1"));
            }
            let command_object = v.next()?;
            if command_object.as_object().is_none() {
                return Err(v.malformed("command object is not an object"));
            }
            let args = v.next_opt()?;
            Packet::Connect {
                command_object,
                args,
            }
        }
        CMD_CREATE_STREAM => Packet::CreateStream { transaction_id },
        CMD_RELEASE_STREAM | CMD_FC_PUBLISH | CMD_FC_UNPUBLISH => {
            let command = FmleCommand::from_name(&v.command)
                .ok_or_else(|| v.malformed("unknown fmle command"))?;
            v.next()?;
            let stream_name = v.string("stream name is not a string")?;
            Packet::FmleStart {
                command,
                transaction_id,
                stream_name,
            }
        }
        CMD_PUBLISH => {
            v.next()?;
            let stream_name = v.string("stream name is not a string")?;
            let publish_type = match v.next_opt()? {
                Some(AmfValue::String(s)) => s,
                _ => "live".to_string(),
            };
            Packet::Publish {
                transaction_id,
                stream_name,
                publish_type,
            }
        }
        CMD_PLAY => {
            v.next()?;
            let stream_name = v.string("stream name is not a string")?;
            let start = v.next_opt()?.and_then(|a| a.as_number()).unwrap_or(-2.0);
            let duration = v.next_opt()?.and_then(|a| a.as_number()).unwrap_or(-1.0);
            let reset = match v.next_opt()? {
                Some(AmfValue::Boolean(b)) => b,
                Some(AmfValue::Number(n)) => n != 0.0,
                _ => true,
            };
            Packet::Play {
                transaction_id,
                stream_name,
                start,
                duration,
                reset,
            }
        }
        CMD_PAUSE => {
            v.next()?;
            let is_pause = match v.next()? {
                AmfValue::Boolean(b) => b,
                _ => return Err(v.malformed("pause flag is not a boolean")),
            };
            let time_ms = v.number("pause time is not a number")?;
            Packet::Pause {
                transaction_id,
                is_pause,
                time_ms,
            }
        }
        CMD_CLOSE_STREAM | CMD_DELETE_STREAM => Packet::CloseStream { transaction_id },
        CMD_ON_STATUS | CMD_ON_FC_PUBLISH | CMD_ON_FC_UNPUBLISH => {
            v.next_opt()?;
            let info = v.next_opt()?.unwrap_or_default();
            Packet::OnStatusCall {
                command: v.command.clone(),
                info,
            }
        }
        CMD_ON_BW_DONE => Packet::OnBwDone,
        _ => {
            tracing::debug!(command = %v.command, transaction_id, "Unhandled command");
            let args = v.rest()?;
            Packet::Call {
                command: std::mem::take(&mut v.command),
                transaction_id,
                args,
            }
        }
    };
    Ok(packet)
}

fn decode_response(
    mut v: Values<'_>,
    transaction_id: f64,
    tracker: &TransactionTracker,
) -> Result<Packet> {
    let request = tracker
        .take(transaction_id)
        .ok_or(ProtocolError::UnknownTransaction(transaction_id))?;

    let packet = match request.as_str() {
        CMD_CONNECT => {
            let props = v.next_opt()?.unwrap_or_default();
            let info = v.next_opt()?.unwrap_or_default();
            Packet::ConnectResult {
                transaction_id,
                props,
                info,
            }
        }
        CMD_CREATE_STREAM => {
            v.next()?;
            let stream_id = v.number("stream id is not a number")?;
            Packet::CreateStreamResult {
                transaction_id,
                stream_id,
            }
        }
        CMD_RELEASE_STREAM | CMD_FC_PUBLISH | CMD_FC_UNPUBLISH => {
            Packet::FmleStartResult { transaction_id }
        }
        _ => Packet::CallResult {
            args: v.rest()?,
            command: v.command,
            transaction_id,
        },
    };
    Ok(packet)
}

fn decode_data(payload: &[u8]) -> Result<Packet> {
    let mut v = Values::new(payload)?;

    let packet = match v.command.as_str() {
        CMD_SET_DATA_FRAME | CMD_ON_METADATA => {
            if v.command == CMD_SET_DATA_FRAME {
                let inner = v.string("@setDataFrame without a name")?;
                if inner != CMD_ON_METADATA {
                    return Ok(Packet::Data {
                        name: inner,
                        values: v.rest()?,
                    });
                }
            }
            let metadata = v.next_opt()?.unwrap_or_else(AmfValue::object);
            Packet::OnMetaData { metadata }
        }
        CMD_ON_STATUS => Packet::OnStatusData {
            info: v.next_opt()?.unwrap_or_default(),
        },
        CMD_SAMPLE_ACCESS => {
            let video = v.next_opt()?.and_then(|a| a.as_bool()).unwrap_or(false);
            let audio = v.next_opt()?.and_then(|a| a.as_bool()).unwrap_or(false);
            Packet::SampleAccess { video, audio }
        }
        _ => Packet::Data {
            values: v.rest()?,
            name: v.command,
        },
    };
    Ok(packet)
}
