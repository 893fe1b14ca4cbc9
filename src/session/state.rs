//! Session state machine
//!
//! Tracks the overall state of an RTMP session from connection to disconnection.

use std::net::SocketAddr;
use std::time::Instant;

use crate::protocol::quirks::EncoderType;
use crate::protocol::request::Request;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// TCP connected, handshake not started
    Connected,
    /// Handshake in progress
    Handshaking,
    /// Handshake complete, waiting for connect command
    WaitingConnect,
    /// Connected, working out whether the client publishes or plays
    Identifying,
    /// Publishing or playing
    Streaming,
    /// Session is closing
    Closing,
    /// Session closed
    Closed,
}

/// What the client turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    /// releaseStream / FCPublish / createStream / publish
    FmlePublish,
    /// createStream / publish
    FlashPublish,
    Play,
}

impl ClientType {
    pub fn is_publish(self) -> bool {
        matches!(self, ClientType::FmlePublish | ClientType::FlashPublish)
    }
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session ID
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Time when handshake completed
    pub handshake_completed_at: Option<Instant>,

    /// Stream identity, from connect and then publish/play
    pub request: Option<Request>,

    /// Detected encoder type
    pub encoder_type: EncoderType,

    /// Set once publish or play arrives
    pub client_type: Option<ClientType>,
}

impl SessionState {
    /// Create a new session state
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Connected,
            connected_at: Instant::now(),
            handshake_completed_at: None,
            request: None,
            encoder_type: EncoderType::Unknown,
            client_type: None,
        }
    }

    /// Transition to handshaking phase
    pub fn start_handshake(&mut self) {
        if self.phase == SessionPhase::Connected {
            self.phase = SessionPhase::Handshaking;
        }
    }

    /// Complete handshake
    pub fn complete_handshake(&mut self) {
        if self.phase == SessionPhase::Handshaking {
            self.phase = SessionPhase::WaitingConnect;
            self.handshake_completed_at = Some(Instant::now());
        }
    }

    /// Handle connect command
    pub fn on_connect(&mut self, request: Request, encoder_type: EncoderType) {
        self.request = Some(request);
        self.encoder_type = encoder_type;
        self.phase = SessionPhase::Identifying;
    }

    /// Client identified itself with publish or play
    pub fn start_streaming(&mut self, client_type: ClientType) {
        self.client_type = Some(client_type);
        self.phase = SessionPhase::Streaming;
    }

    /// Republish: a publisher unpublished and may publish again
    pub fn reidentify(&mut self) {
        if self.phase == SessionPhase::Streaming {
            self.client_type = None;
            self.phase = SessionPhase::Identifying;
        }
    }

    /// Get session duration
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Check if session is publishing or playing
    pub fn is_streaming(&self) -> bool {
        self.phase == SessionPhase::Streaming
    }

    /// Start closing the session
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closing;
    }

    /// Session fully torn down
    pub fn closed(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    /// Get the application name
    pub fn app(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.app.as_str())
    }
}
