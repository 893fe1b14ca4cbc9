//! AMF0 command value model
//!
//! Command (type 20) and data (type 18) messages are sequences of AMF0
//! values. AMF3 variants of those messages (types 17 and 15) carry a
//! leading format byte followed by AMF0, so no AMF3 codec is needed.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfObject, AmfValue};
