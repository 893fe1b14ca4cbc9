//! Server configuration
//!
//! Server-wide settings live on [`ServerConfig`]. Everything that shapes
//! how a stream is delivered is per virtual host in [`VhostConfig`], so
//! different vhosts on one server can, say, run with and without a GOP
//! cache.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::media::gop::DEFAULT_MAX_FRAMES;
use crate::protocol::constants::*;
use crate::registry::RegistryConfig;
use crate::source::JitterAlgorithm;

/// Name of the vhost used when a client's host matches no configured vhost
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// Per-vhost stream delivery settings
#[derive(Debug, Clone)]
pub struct VhostConfig {
    pub name: String,

    /// Outbound chunk size announced after connect
    pub chunk_size: u32,

    /// Media duration a consumer may buffer before old messages are dropped
    pub queue_length: Duration,

    /// Keep the last GOP for late joiners
    pub gop_cache: bool,

    /// Safety bound on messages in the GOP cache
    pub gop_cache_max_frames: usize,

    /// Timestamp correction applied per consumer
    pub jitter: JitterAlgorithm,

    /// Absolute time: pass publisher timestamps through untouched
    pub atc: bool,

    /// Reorder interleaved audio and video by timestamp
    pub mix_correct: bool,

    /// Drop sequence headers and metadata identical to the previous ones
    pub reduce_sequence_header: bool,

    /// How long a new publisher may take to send its first message
    pub publish_first_packet_timeout: Duration,

    /// How long an established publisher may go silent
    pub publish_normal_timeout: Duration,

    /// Enable TCP_NODELAY on play connections
    pub tcp_nodelay: bool,

    /// Media a play connection collects before writing, as duration
    pub merged_write_latency: Duration,

    /// Messages a play connection collects before writing
    pub merged_write_messages: usize,
}

impl VhostConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    pub fn queue_length(mut self, length: Duration) -> Self {
        self.queue_length = length;
        self
    }

    pub fn gop_cache(mut self, enabled: bool) -> Self {
        self.gop_cache = enabled;
        self
    }

    pub fn jitter(mut self, algorithm: JitterAlgorithm) -> Self {
        self.jitter = algorithm;
        self
    }

    pub fn atc(mut self, enabled: bool) -> Self {
        self.atc = enabled;
        self
    }

    pub fn mix_correct(mut self, enabled: bool) -> Self {
        self.mix_correct = enabled;
        self
    }

    pub fn reduce_sequence_header(mut self, enabled: bool) -> Self {
        self.reduce_sequence_header = enabled;
        self
    }

    pub fn publish_timeouts(mut self, first_packet: Duration, normal: Duration) -> Self {
        self.publish_first_packet_timeout = first_packet;
        self.publish_normal_timeout = normal;
        self
    }

    pub fn merged_write(mut self, latency: Duration, messages: usize) -> Self {
        self.merged_write_latency = latency;
        self.merged_write_messages = messages;
        self
    }
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_VHOST.to_string(),
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            queue_length: Duration::from_secs(30),
            gop_cache: true,
            gop_cache_max_frames: DEFAULT_MAX_FRAMES,
            jitter: JitterAlgorithm::Full,
            atc: false,
            mix_correct: false,
            reduce_sequence_header: false,
            publish_first_packet_timeout: Duration::from_secs(20),
            publish_normal_timeout: Duration::from_secs(5),
            tcp_nodelay: false,
            merged_write_latency: Duration::from_millis(350),
            merged_write_messages: 8,
        }
    }
}

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Window acknowledgement size
    pub window_ack_size: u32,

    /// Peer bandwidth limit
    pub peer_bandwidth: u32,

    /// Socket write timeout
    pub send_timeout: Duration,

    /// Socket read timeout
    pub recv_timeout: Duration,

    /// Handshake must complete within this time
    pub handshake_timeout: Duration,

    /// Source registry sweep settings
    pub registry: RegistryConfig,

    /// Named vhosts
    pub vhosts: HashMap<String, VhostConfig>,

    /// Used for any host not in `vhosts`
    pub default_vhost: VhostConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], RTMP_PORT)),
            max_connections: 0, // Unlimited
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            send_timeout: Duration::from_secs(30),
            recv_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            registry: RegistryConfig::default(),
            vhosts: HashMap::new(),
            default_vhost: VhostConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set send and receive timeouts
    pub fn io_timeouts(mut self, send: Duration, recv: Duration) -> Self {
        self.send_timeout = send;
        self.recv_timeout = recv;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.registry.cleanup_interval = interval;
        self
    }

    pub fn source_cleanup_delay(mut self, delay: Duration) -> Self {
        self.registry.source_cleanup_delay = delay;
        self
    }

    /// Add or replace a named vhost
    pub fn vhost_config(mut self, vhost: VhostConfig) -> Self {
        self.vhosts.insert(vhost.name.clone(), vhost);
        self
    }

    /// Replace the fallback vhost
    pub fn default_vhost(mut self, vhost: VhostConfig) -> Self {
        self.default_vhost = vhost;
        self
    }

    /// Settings for `name`, or the default vhost if it is not configured
    pub fn vhost(&self, name: &str) -> &VhostConfig {
        self.vhosts.get(name).unwrap_or(&self.default_vhost)
    }
}
