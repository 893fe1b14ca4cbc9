//! RTMP server: listener, per-connection sessions and configuration

pub mod config;
pub mod connection;
pub mod listener;

pub use config::{ServerConfig, VhostConfig, DEFAULT_VHOST};
pub use connection::{Connection, RtmpStream};
pub use listener::RtmpServer;
