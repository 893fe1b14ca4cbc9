//! RTMP server listener
//!
//! Accept loop; every connection runs in its own task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::registry::SourceRegistry;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;

/// RTMP server
pub struct RtmpServer {
    config: Arc<ServerConfig>,
    registry: Arc<SourceRegistry>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl RtmpServer {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };
        let registry = Arc::new(SourceRegistry::with_config(config.registry.clone()));

        Self {
            config: Arc::new(config),
            registry,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Get a reference to the source registry
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "RTMP server listening");

        self.serve(listener, shutdown).await
    }

    /// Accept on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let cleanup_handle = self.registry.spawn_cleanup_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        // Stop cleanup task on shutdown
        cleanup_handle.abort();

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let _permit = permit;
            let connection = Connection::new(session_id, socket, peer_addr, config, registry);

            match connection.run().await {
                Ok(()) => {}
                Err(e) if e.is_transport() => {
                    tracing::debug!(session_id = session_id, error = %e, "Connection error");
                }
                Err(e) => {
                    tracing::warn!(session_id = session_id, error = %e, "Session failed");
                }
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::amf::AmfValue;
    use crate::protocol::handshake::HandshakeRole;
    use crate::protocol::packet::{Packet, TransactionTracker};
    use crate::protocol::transport::{self, MessageReader, MessageWriter};

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_serve_accepts_and_shuts_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RtmpServer::new(ServerConfig::with_addr(addr)));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .serve(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let mut socket = TcpStream::connect(addr).await.unwrap();
        let leftover = transport::handshake(&mut socket, HandshakeRole::Client, LIMIT)
            .await
            .unwrap();
        let (r, w) = socket.into_split();
        let tracker = TransactionTracker::new();
        let mut reader = MessageReader::with_buffer(r, leftover, tracker.clone(), LIMIT);
        let mut writer = MessageWriter::new(w, tracker, LIMIT);

        writer
            .send_packet(
                &Packet::Connect {
                    command_object: AmfValue::object()
                        .with("app", "live")
                        .with("tcUrl", format!("rtmp://{addr}/live")),
                    args: None,
                },
                0,
            )
            .await
            .unwrap();

        let connected = loop {
            if let (_, Some(Packet::ConnectResult { .. })) = reader.read_packet().await.unwrap() {
                break true;
            }
        };
        assert!(connected);

        stop_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_registry_uses_configured_limits() {
        let config = ServerConfig::default().source_cleanup_delay(Duration::from_secs(7));
        let server = RtmpServer::new(config);

        assert_eq!(
            server.registry().config().source_cleanup_delay,
            Duration::from_secs(7)
        );
        assert_eq!(server.bind_addr().port(), 1935);
    }
}
