//! RTMP simple handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! Only the plaintext variant is spoken. A C0 other than 3 (the encrypted
//! handshakes use 6 and 8) fails the connection. The HMAC digest ("complex")
//! variant is not implemented; clients fall back to the simple exchange.
//!
//! The state machine is I/O free: feed it buffered bytes with
//! [`Handshake::process`] and write whatever it returns.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::HandshakeError;
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Nothing sent or received yet
    Initial,
    /// Server: waiting for C0C1. Client: waiting for S0S1S2.
    WaitingForPeerPacket,
    /// Server: waiting for C2
    WaitingForPeerResponse,
    Done,
}

/// Handshake state machine
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes that must be buffered before [`process`](Self::process) can
    /// make progress
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                1 + HANDSHAKE_SIZE * 2
            }
            (HandshakeState::WaitingForPeerResponse, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Start the exchange.
    ///
    /// Returns C0C1 for a client. A server has nothing to say until C0C1
    /// arrives.
    pub fn start(&mut self) -> Result<Option<Bytes>, HandshakeError> {
        if self.state != HandshakeState::Initial {
            return Err(HandshakeError::InvalidState);
        }
        self.state = HandshakeState::WaitingForPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                let c1 = generate_packet();
                let mut out = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                out.extend_from_slice(&[RTMP_VERSION]);
                out.extend_from_slice(&c1);
                Ok(Some(out.freeze()))
            }
            HandshakeRole::Server => Ok(None),
        }
    }

    /// Consume peer bytes from `data` and return the reply, if any.
    ///
    /// Leaves `data` untouched and returns `Ok(None)` while fewer than
    /// [`bytes_needed`](Self::bytes_needed) bytes are buffered.
    pub fn process(&mut self, data: &mut BytesMut) -> Result<Option<Bytes>, HandshakeError> {
        let needed = self.bytes_needed();
        if needed == 0 {
            return Err(HandshakeError::InvalidState);
        }
        if data.len() < needed {
            return Ok(None);
        }

        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => {
                let version = data.get_u8();
                if version != RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version));
                }
                let c1 = take_packet(data);

                let s1 = generate_packet();
                let mut out = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                out.extend_from_slice(&[RTMP_VERSION]);
                out.extend_from_slice(&s1);
                out.extend_from_slice(&generate_echo(&c1));

                self.state = HandshakeState::WaitingForPeerResponse;
                Ok(Some(out.freeze()))
            }
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                let version = data.get_u8();
                if version != RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version));
                }
                let s1 = take_packet(data);
                // S2 is an echo of our C1; servers disagree on its exact
                // contents, so it is read and dropped.
                data.advance(HANDSHAKE_SIZE);

                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&generate_echo(&s1))))
            }
            (HandshakeState::WaitingForPeerResponse, _) => {
                // C2 echoes S1; like S2 it is not verified.
                data.advance(HANDSHAKE_SIZE);
                self.state = HandshakeState::Done;
                Ok(None)
            }
            _ => Err(HandshakeError::InvalidState),
        }
    }
}

fn take_packet(data: &mut BytesMut) -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    data.copy_to_slice(&mut packet);
    packet
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// C1/S1: time (4) + zero (4) + 1528 random bytes
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    let time = now_millis();
    packet[0..4].copy_from_slice(&time.to_be_bytes());

    // Random bytes only need to differ between sessions, not be secret.
    let mut seed = u64::from(time) | 1;
    for word in packet[8..].chunks_exact_mut(8) {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        word.copy_from_slice(&seed.to_be_bytes());
    }
    packet
}

/// C2/S2: peer's time (4) + our time (4) + peer's random bytes
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}
