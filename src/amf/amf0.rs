//! AMF0 encoder and decoder
//!
//! Reference: AMF0 File Format Specification (amf0-file-format-specification.pdf)
//!
//! Supported type markers:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (count hint + key-value pairs until 0x000009)
//! 0x09 - Object End (only inside objects)
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + timezone)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! ```
//!
//! Any other marker fails the decode of the whole message.

use bytes::Bytes;

use super::value::{AmfObject, AmfValue};
use crate::error::AmfError;
use crate::protocol::cursor::{ByteReader, ByteWriter};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

const OBJECT_END: [u8; 3] = [0x00, 0x00, MARKER_OBJECT_END];

/// Maximum nesting depth for objects/arrays (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// Strict AMF0 decoder
#[derive(Debug, Default)]
pub struct Amf0Decoder {
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a single value
    pub fn decode(&mut self, r: &mut ByteReader<'_>) -> Result<AmfValue, AmfError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let result = r
            .read_u8()
            .map_err(AmfError::from)
            .and_then(|marker| self.decode_value(marker, r));
        self.depth -= 1;
        result
    }

    /// Decode values until the reader is exhausted
    pub fn decode_all(&mut self, r: &mut ByteReader<'_>) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while !r.is_empty() {
            values.push(self.decode(r)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, r: &mut ByteReader<'_>) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => Ok(AmfValue::Number(r.read_f64()?)),
            MARKER_BOOLEAN => Ok(AmfValue::Boolean(r.read_u8()? != 0)),
            MARKER_STRING => Ok(AmfValue::String(read_utf8(r)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(r)?)),
            MARKER_OBJECT => Ok(AmfValue::Object(self.decode_properties(r)?)),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_ECMA_ARRAY => {
                // Count is advisory; encoders disagree on what it means.
                let _count = r.read_u32()?;
                Ok(AmfValue::EcmaArray(self.decode_properties(r)?))
            }
            MARKER_STRICT_ARRAY => {
                let count = r.read_u32()? as usize;
                // Every element is at least one byte
                if !r.require(count) {
                    return Err(AmfError::UnexpectedEof);
                }
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(r)?);
                }
                Ok(AmfValue::StrictArray(elements))
            }
            MARKER_DATE => {
                let millis = r.read_f64()?;
                let timezone = r.read_i16()?;
                Ok(AmfValue::Date { millis, timezone })
            }
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    fn decode_properties(&mut self, r: &mut ByteReader<'_>) -> Result<AmfObject, AmfError> {
        let mut properties = AmfObject::new();
        loop {
            if is_object_end(r) {
                r.skip(OBJECT_END.len() as isize)?;
                return Ok(properties);
            }
            let key = read_utf8(r)?;
            let value = self.decode(r)?;
            properties.insert(key, value);
        }
    }
}

fn is_object_end(r: &ByteReader<'_>) -> bool {
    let mut peek = r.clone();
    matches!(peek.read_bytes(OBJECT_END.len()), Ok(b) if b == OBJECT_END)
}

fn read_utf8(r: &mut ByteReader<'_>) -> Result<String, AmfError> {
    let len = r.read_u16()? as usize;
    let bytes = r.read_bytes(len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| AmfError::InvalidUtf8)
}

fn read_utf8_long(r: &mut ByteReader<'_>) -> Result<String, AmfError> {
    let len = r.read_u32()? as usize;
    let bytes = r.read_bytes(len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder writing into a fixed buffer sized by
/// [`AmfValue::encoded_size`]
pub struct Amf0Encoder<'a, 'b> {
    w: &'a mut ByteWriter<'b>,
}

impl<'a, 'b> Amf0Encoder<'a, 'b> {
    pub fn new(w: &'a mut ByteWriter<'b>) -> Self {
        Self { w }
    }

    pub fn encode(&mut self, value: &AmfValue) -> Result<(), AmfError> {
        let w = &mut *self.w;
        match value {
            AmfValue::Number(n) => {
                w.write_u8(MARKER_NUMBER)?;
                w.write_f64(*n)?;
            }
            AmfValue::Boolean(b) => {
                w.write_u8(MARKER_BOOLEAN)?;
                w.write_u8(u8::from(*b))?;
            }
            AmfValue::String(s) => {
                if s.len() > u16::MAX as usize {
                    w.write_u8(MARKER_LONG_STRING)?;
                    w.write_u32(s.len() as u32)?;
                } else {
                    w.write_u8(MARKER_STRING)?;
                    w.write_u16(s.len() as u16)?;
                }
                w.write_string(s)?;
            }
            AmfValue::Object(props) => {
                w.write_u8(MARKER_OBJECT)?;
                self.encode_properties(props)?;
            }
            AmfValue::Null => w.write_u8(MARKER_NULL)?,
            AmfValue::Undefined => w.write_u8(MARKER_UNDEFINED)?,
            AmfValue::EcmaArray(props) => {
                w.write_u8(MARKER_ECMA_ARRAY)?;
                w.write_u32(props.len() as u32)?;
                self.encode_properties(props)?;
            }
            AmfValue::StrictArray(elements) => {
                w.write_u8(MARKER_STRICT_ARRAY)?;
                w.write_u32(elements.len() as u32)?;
                for elem in elements {
                    self.encode(elem)?;
                }
            }
            AmfValue::Date { millis, timezone } => {
                w.write_u8(MARKER_DATE)?;
                w.write_f64(*millis)?;
                w.write_i16(*timezone)?;
            }
        }
        Ok(())
    }

    fn encode_properties(&mut self, props: &AmfObject) -> Result<(), AmfError> {
        for (key, val) in props {
            let key = &key.as_bytes()[..key.len().min(u16::MAX as usize)];
            self.w.write_u16(key.len() as u16)?;
            self.w.write_bytes(key)?;
            self.encode(val)?;
        }
        self.w.write_bytes(&OBJECT_END)?;
        Ok(())
    }
}

/// Encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    encode_all(std::slice::from_ref(value))
}

/// Encode a sequence of values back to back
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let size = values.iter().map(AmfValue::encoded_size).sum();
    let mut buf = vec![0u8; size];
    let mut w = ByteWriter::new(&mut buf);
    let mut encoder = Amf0Encoder::new(&mut w);
    for value in values {
        // encoded_size is exact, so the buffer cannot run short
        if encoder.encode(value).is_err() {
            tracing::error!("amf0 encoded size mismatch");
            break;
        }
    }
    let written = w.position();
    buf.truncate(written);
    Bytes::from(buf)
}

/// Decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    Amf0Decoder::new().decode(&mut ByteReader::new(data))
}

/// Decode all values in `data`
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    Amf0Decoder::new().decode_all(&mut ByteReader::new(data))
}
