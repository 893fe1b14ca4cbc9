//! Minimal live server
//!
//! Run with: cargo run --example simple_server [BIND_ADDR]
//!
//! Publish:
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test_key
//!
//! Play:
//!   ffplay rtmp://localhost/live/test_key
//!
//! Set `RUST_LOG=rtmp_hub=debug` for per-session logs.

use std::net::SocketAddr;
use std::time::Duration;

use rtmp_hub::source::JitterAlgorithm;
use rtmp_hub::{RtmpServer, ServerConfig, VhostConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtmp_hub=info")),
        )
        .init();

    let addr: SocketAddr = match std::env::args().nth(1) {
        Some(arg) if arg == "localhost" => "127.0.0.1:1935".parse()?,
        Some(arg) => arg.parse()?,
        None => "0.0.0.0:1935".parse()?,
    };

    let config = ServerConfig::with_addr(addr)
        .source_cleanup_delay(Duration::from_secs(10))
        .default_vhost(
            VhostConfig::default()
                .jitter(JitterAlgorithm::Full)
                .reduce_sequence_header(true)
                .merged_write(Duration::from_millis(350), 8),
        );

    let server = RtmpServer::new(config);
    println!("Listening on rtmp://{addr}/live");

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    println!("Stopped");
    Ok(())
}
