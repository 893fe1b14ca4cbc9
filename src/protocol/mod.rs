//! RTMP wire protocol
//!
//! Layered bottom-up: [`cursor`] for bounds-checked byte access, [`chunk`]
//! for framing, [`handshake`] for the connection preamble, [`packet`] for
//! control and command messages and [`transport`] to drive all of it over
//! an async stream.

pub mod chunk;
pub mod constants;
pub mod cursor;
pub mod handshake;
pub mod message;
pub mod packet;
pub mod quirks;
pub mod request;
pub mod transport;

pub use chunk::{ChunkDecoder, ChunkEncoder};
pub use handshake::{Handshake, HandshakeRole};
pub use message::{MessageHeader, RtmpMessage, SharedMessage};
pub use packet::{FmleCommand, Packet, TransactionTracker, UserControlEvent};
pub use request::Request;
pub use transport::{AckWindow, MessageReader, MessageWriter};
