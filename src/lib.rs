//! rtmp-hub: RTMP ingest and live stream distribution
//!
//! This library provides:
//! - Server mode for receiving streams from OBS, ffmpeg, FMLE and Flash
//! - One shared source per `(vhost, app, stream)` with fan-out to players
//! - Late-joiner start from cached metadata, sequence headers and last GOP
//! - Per-player timestamp correction and bounded queues
//! - Lenient parsing for known encoder quirks
//!
//! # Example: Simple Server
//!
//! ```no_run
//! use rtmp_hub::{RtmpServer, ServerConfig, VhostConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default()
//!         .default_vhost(VhostConfig::default().reduce_sequence_header(true));
//!     let server = RtmpServer::new(config);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod source;

// Re-export main types for convenience
pub use amf::AmfValue;
pub use error::{Error, Result};
pub use protocol::message::SharedMessage;
pub use protocol::request::Request;
pub use registry::{SourceRegistry, StreamKey};
pub use server::config::{ServerConfig, VhostConfig};
pub use server::listener::RtmpServer;
pub use source::{Consumer, JitterAlgorithm, MediaSink, Source};
