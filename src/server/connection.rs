//! Per-connection session
//!
//! Drives one client through the RTMP exchange:
//!
//! ```text
//!   handshake ──► connect ──► identify ──┬─► publish ──► (FCUnpublish) ──► identify
//!                                        └─► play ──► (closeStream / disconnect)
//! ```
//!
//! Once connect is answered, a receive task owns the read half and forwards
//! decoded messages over a channel. The session loop applies its own
//! timeouts on that channel and, while playing, selects between inbound
//! control messages and consumer wake-ups.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::amf::AmfValue;
use crate::error::{Error, ProtocolError, Result, SourceError};
use crate::protocol::constants::*;
use crate::protocol::handshake::HandshakeRole;
use crate::protocol::message::RtmpMessage;
use crate::protocol::packet::{status_info, FmleCommand, Packet, TransactionTracker, UserControlEvent};
use crate::protocol::quirks::EncoderType;
use crate::protocol::request::Request;
use crate::protocol::transport::{self, AckWindow, MessageReader, MessageWriter};
use crate::registry::SourceRegistry;
use crate::server::config::{ServerConfig, VhostConfig};
use crate::session::{ClientType, SessionState};
use crate::source::{Consumer, Source};

/// Messages taken from a consumer per write
const MAX_DUMP_MESSAGES: usize = 128;

/// Read timeout of the receive task; the session applies its own
const RECV_TASK_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 3600);

type Inbound = (RtmpMessage, Option<Packet>);

/// A byte stream a connection can run on
pub trait RtmpStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    type Read: AsyncRead + Send + Unpin + 'static;
    type Write: AsyncWrite + Send + Unpin + 'static;

    fn split(self) -> (Self::Read, Self::Write);

    /// Applied once the vhost of a play session is known
    fn set_nodelay(_write: &Self::Write, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }
}

impl RtmpStream for TcpStream {
    type Read = OwnedReadHalf;
    type Write = OwnedWriteHalf;

    fn split(self) -> (Self::Read, Self::Write) {
        self.into_split()
    }

    fn set_nodelay(write: &Self::Write, nodelay: bool) -> io::Result<()> {
        write.as_ref().set_nodelay(nodelay)
    }
}

impl RtmpStream for DuplexStream {
    type Read = ReadHalf<DuplexStream>;
    type Write = WriteHalf<DuplexStream>;

    fn split(self) -> (Self::Read, Self::Write) {
        tokio::io::split(self)
    }
}

/// Reader side running in its own task, aborted on drop
struct RecvTask {
    handle: JoinHandle<()>,
}

impl RecvTask {
    fn spawn<R>(mut reader: MessageReader<R>) -> (Self, mpsc::Receiver<Result<Inbound>>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(128);
        reader.set_timeout(RECV_TASK_TIMEOUT);

        let handle = tokio::spawn(async move {
            loop {
                let item = reader.read_packet().await;
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        (Self { handle }, rx)
    }
}

impl Drop for RecvTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// What the client asked to do after connect
#[derive(Debug)]
enum Identity {
    Publish {
        client_type: ClientType,
        stream_name: String,
        stream_id: u32,
    },
    Play {
        stream_name: String,
        duration: f64,
        stream_id: u32,
    },
}

/// One accepted client connection
pub struct Connection<S: RtmpStream> {
    state: SessionState,
    stream: S,
    config: Arc<ServerConfig>,
    registry: Arc<SourceRegistry>,
}

impl<S: RtmpStream> Connection<S> {
    pub fn new(
        session_id: u64,
        stream: S,
        peer_addr: SocketAddr,
        config: Arc<ServerConfig>,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            state: SessionState::new(session_id, peer_addr),
            stream,
            config,
            registry,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.state.id
    }

    /// Serve the connection until the client leaves or an error occurs
    pub async fn run(self) -> Result<()> {
        let Connection {
            mut state,
            mut stream,
            config,
            registry,
        } = self;

        state.start_handshake();
        let leftover =
            transport::handshake(&mut stream, HandshakeRole::Server, config.handshake_timeout)
                .await?;
        state.complete_handshake();
        tracing::debug!(session_id = state.id, peer = %state.peer_addr, "Handshake complete");

        let (read_half, write_half) = RtmpStream::split(stream);
        let tracker = TransactionTracker::new();
        let mut reader =
            MessageReader::with_buffer(read_half, leftover, tracker.clone(), config.recv_timeout);
        let writer = MessageWriter::new(write_half, tracker, config.send_timeout);

        let (command_object, args) = expect_connect(&mut reader).await?;
        let bytes_read = reader.bytes_read();
        let (recv_task, inbound) = RecvTask::spawn(reader);

        let mut session = Session::<S> {
            vhost: config.default_vhost.clone(),
            state,
            config,
            registry,
            writer,
            inbound,
            bytes_read,
            ack: AckWindow::new(0),
            _recv_task: recv_task,
        };

        let result = session.serve(command_object, args).await;
        session.state.closed();
        tracing::debug!(
            session_id = session.state.id,
            duration_ms = session.state.duration().as_millis() as u64,
            "Session ended"
        );
        result
    }
}

async fn expect_connect<R: AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
) -> Result<(AmfValue, Option<AmfValue>)> {
    loop {
        match reader.read_packet().await? {
            (_, Some(Packet::Connect {
                command_object,
                args,
            })) => return Ok((command_object, args)),
            (msg, _) => {
                tracing::debug!(
                    message_type = msg.header.message_type,
                    "Ignoring message before connect"
                );
            }
        }
    }
}

struct Session<S: RtmpStream> {
    state: SessionState,
    config: Arc<ServerConfig>,
    vhost: VhostConfig,
    registry: Arc<SourceRegistry>,
    writer: MessageWriter<S::Write>,
    inbound: mpsc::Receiver<Result<Inbound>>,
    bytes_read: Arc<AtomicU64>,
    ack: AckWindow,
    _recv_task: RecvTask,
}

impl<S: RtmpStream> Session<S> {
    async fn serve(&mut self, command_object: AmfValue, args: Option<AmfValue>) -> Result<()> {
        self.on_connect(command_object, args).await?;

        loop {
            match self.identify().await? {
                Identity::Publish {
                    client_type,
                    stream_name,
                    stream_id,
                } => {
                    self.state.start_streaming(client_type);
                    self.publish(client_type, &stream_name, stream_id).await?;
                    tracing::debug!(session_id = self.state.id, "Waiting for republish");
                    self.state.reidentify();
                }
                Identity::Play {
                    stream_name,
                    duration,
                    stream_id,
                } => {
                    self.state.start_streaming(ClientType::Play);
                    return self.play(&stream_name, duration, stream_id).await;
                }
            }
        }
    }

    async fn on_connect(&mut self, command_object: AmfValue, args: Option<AmfValue>) -> Result<()> {
        let tc_url = command_object.get_string("tcUrl").unwrap_or_default();
        let mut request = Request::from_tc_url(tc_url)?;
        request.page_url = command_object.get_string("pageUrl").unwrap_or_default().to_string();
        request.swf_url = command_object.get_string("swfUrl").unwrap_or_default().to_string();
        request.object_encoding = command_object.get_number("objectEncoding").unwrap_or(0.0);
        self.resolve_vhost(&mut request);

        let encoder =
            EncoderType::from_flash_ver(command_object.get_string("flashVer").unwrap_or_default());
        tracing::debug!(
            session_id = self.state.id,
            tc_url = %request.tc_url,
            vhost = %request.vhost,
            app = %request.app,
            encoder = ?encoder,
            has_args = args.is_some(),
            "Client connect"
        );

        let object_encoding = request.object_encoding;
        self.state.on_connect(request, encoder);

        self.send(Packet::WindowAckSize(self.config.window_ack_size), 0).await?;
        self.send(
            Packet::SetPeerBandwidth {
                size: self.config.peer_bandwidth,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
            0,
        )
        .await?;
        self.writer.set_chunk_size(self.vhost.chunk_size).await?;
        self.send(connect_result(object_encoding), 0).await?;
        self.send(Packet::OnBwDone, 0).await
    }

    /// Pick the vhost settings for `request` and name it by its vhost
    fn resolve_vhost(&mut self, request: &mut Request) {
        self.vhost = self.config.vhost(&request.vhost).clone();
        request.vhost = self.vhost.name.clone();
    }

    /// Handle commands until the client publishes or plays
    async fn identify(&mut self) -> Result<Identity> {
        let mut fmle = false;
        let mut create_stream_depth = 0;

        loop {
            let (msg, packet) = self.recv(self.config.recv_timeout).await?;
            let Some(packet) = packet else {
                tracing::debug!(session_id = self.state.id, "Ignoring media before publish");
                continue;
            };
            let stream_id = msg.header.stream_id;

            match packet {
                Packet::FmleStart {
                    command: FmleCommand::ReleaseStream | FmleCommand::FcPublish,
                    transaction_id,
                    stream_name,
                    ..
                } => {
                    tracing::debug!(session_id = self.state.id, stream = %stream_name, "FMLE start");
                    fmle = true;
                    self.send(Packet::FmleStartResult { transaction_id }, stream_id).await?;
                }
                Packet::CreateStream { transaction_id } => {
                    create_stream_depth += 1;
                    if create_stream_depth > MAX_CREATE_STREAM_DEPTH {
                        return Err(ProtocolError::InvalidRequest(
                            "too many createStream calls".into(),
                        )
                        .into());
                    }
                    self.send(
                        Packet::CreateStreamResult {
                            transaction_id,
                            stream_id: f64::from(DEFAULT_STREAM_ID),
                        },
                        stream_id,
                    )
                    .await?;
                }
                Packet::Publish { stream_name, .. } => {
                    let client_type = if fmle {
                        ClientType::FmlePublish
                    } else {
                        ClientType::FlashPublish
                    };
                    return Ok(Identity::Publish {
                        client_type,
                        stream_name,
                        stream_id,
                    });
                }
                Packet::Play {
                    stream_name,
                    duration,
                    ..
                } => {
                    return Ok(Identity::Play {
                        stream_name,
                        duration,
                        stream_id,
                    });
                }
                Packet::Call {
                    command,
                    transaction_id,
                    ..
                } => {
                    if transaction_id > 0.0 {
                        tracing::debug!(session_id = self.state.id, command = %command, "Answering call");
                        self.send(call_result(transaction_id), stream_id).await?;
                    }
                }
                other => self.on_control(other).await?,
            }
        }
    }

    async fn publish(&mut self, client_type: ClientType, stream_name: &str, stream_id: u32) -> Result<()> {
        let source = self.fetch_source(stream_name).await?;
        let request = self.request()?.clone();

        let _guard = match source.acquire_publish(self.state.id, &request) {
            Ok(guard) => guard,
            Err(e @ SourceError::StreamBusy(_)) => {
                tracing::warn!(session_id = self.state.id, stream = %request, "Stream is busy");
                self.send(
                    Packet::status(STATUS_LEVEL_ERROR, NS_PUBLISH_BAD_NAME, "Stream is busy"),
                    stream_id,
                )
                .await?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if client_type == ClientType::FmlePublish {
            self.send(
                Packet::OnStatusCall {
                    command: CMD_ON_FC_PUBLISH.to_string(),
                    info: status_info(STATUS_LEVEL_STATUS, NS_PUBLISH_START, "Started publishing stream."),
                },
                stream_id,
            )
            .await?;
        }
        self.send(
            Packet::status(STATUS_LEVEL_STATUS, NS_PUBLISH_START, "Started publishing stream."),
            stream_id,
        )
        .await?;

        let mut timeout = self.vhost.publish_first_packet_timeout;
        loop {
            let (msg, packet) = self.recv(timeout).await?;

            let Some(packet) = packet else {
                timeout = self.vhost.publish_normal_timeout;
                let aggregate = msg.header.is_aggregate();
                let is_video = msg.header.is_video();
                let msg = msg.into_shared();
                if aggregate {
                    source.on_aggregate(&msg)?;
                } else if is_video {
                    source.on_video(msg)?;
                } else {
                    source.on_audio(msg)?;
                }
                continue;
            };

            match packet {
                Packet::OnMetaData { metadata } => {
                    source.on_metadata(metadata, msg.header.timestamp)?;
                }
                Packet::FmleStart {
                    command: FmleCommand::FcUnpublish,
                    transaction_id,
                    ..
                } => {
                    self.send(Packet::FmleStartResult { transaction_id }, msg.header.stream_id)
                        .await?;
                    self.send(
                        Packet::OnStatusCall {
                            command: CMD_ON_FC_UNPUBLISH.to_string(),
                            info: status_info(
                                STATUS_LEVEL_STATUS,
                                NS_UNPUBLISH_SUCCESS,
                                "Stop publishing stream.",
                            ),
                        },
                        stream_id,
                    )
                    .await?;
                    self.send(
                        Packet::status(
                            STATUS_LEVEL_STATUS,
                            NS_UNPUBLISH_SUCCESS,
                            "Stream is now unpublished",
                        ),
                        stream_id,
                    )
                    .await?;
                    return Ok(());
                }
                Packet::CloseStream { .. } => {
                    tracing::debug!(session_id = self.state.id, "Publisher closed stream");
                    return Ok(());
                }
                Packet::Call {
                    transaction_id,
                    ..
                } if transaction_id > 0.0 => {
                    self.send(call_result(transaction_id), msg.header.stream_id).await?;
                }
                other => self.on_control(other).await?,
            }
        }
    }

    async fn play(&mut self, stream_name: &str, duration: f64, stream_id: u32) -> Result<()> {
        let source = self.fetch_source(stream_name).await?;
        if let Some(request) = self.state.request.as_mut() {
            request.duration = duration;
        }

        if self.vhost.tcp_nodelay {
            S::set_nodelay(self.writer.get_ref(), true)?;
        }

        self.send(Packet::UserControl(UserControlEvent::StreamBegin(stream_id)), 0)
            .await?;
        self.send(
            Packet::status(STATUS_LEVEL_STATUS, NS_PLAY_RESET, "Playing and resetting stream."),
            stream_id,
        )
        .await?;
        self.send(
            Packet::status(STATUS_LEVEL_STATUS, NS_PLAY_START, "Started playing stream."),
            stream_id,
        )
        .await?;
        self.send(
            Packet::SampleAccess {
                video: true,
                audio: true,
            },
            stream_id,
        )
        .await?;
        self.send(Packet::status_data(NS_DATA_START), stream_id).await?;

        let consumer = source.create_consumer();
        tracing::debug!(
            session_id = self.state.id,
            consumer_id = consumer.id(),
            stream = %source.key(),
            "Play started"
        );
        self.play_loop(&consumer, &source, stream_id).await
    }

    async fn play_loop(&mut self, consumer: &Consumer, source: &Arc<Source>, stream_id: u32) -> Result<()> {
        let latency = self.vhost.merged_write_latency;
        let min_msgs = self.vhost.merged_write_messages;

        loop {
            tokio::select! {
                inbound = self.inbound.recv() => {
                    let (msg, packet) = self.on_inbound(inbound).await?;
                    match packet {
                        Some(Packet::Pause { is_pause: true, .. }) => {
                            consumer.pause();
                            self.send(
                                Packet::status(STATUS_LEVEL_STATUS, NS_PAUSE_NOTIFY, "Paused stream."),
                                stream_id,
                            )
                            .await?;
                        }
                        Some(Packet::Pause { is_pause: false, .. }) => {
                            consumer.resume();
                            self.send(
                                Packet::status(STATUS_LEVEL_STATUS, NS_UNPAUSE_NOTIFY, "Unpaused stream."),
                                stream_id,
                            )
                            .await?;
                        }
                        Some(Packet::CloseStream { .. }) => {
                            tracing::debug!(session_id = self.state.id, "Player closed stream");
                            return Ok(());
                        }
                        Some(Packet::Call { transaction_id, .. }) if transaction_id > 0.0 => {
                            self.send(call_result(transaction_id), msg.header.stream_id).await?;
                        }
                        Some(other) => self.on_control(other).await?,
                        None => {}
                    }
                }
                _ = tokio::time::timeout(latency, consumer.wait(min_msgs, latency)), if !consumer.is_paused() => {
                    if consumer.should_update_source_id() {
                        tracing::info!(
                            session_id = self.state.id,
                            stream = %source.key(),
                            generation = source.generation(),
                            "Source has a new publisher"
                        );
                    }

                    let mut msgs = consumer.dump_packets(MAX_DUMP_MESSAGES);
                    if msgs.is_empty() {
                        continue;
                    }
                    for msg in &mut msgs {
                        msg.stream_id = stream_id;
                    }
                    self.writer.send_messages(&msgs).await?;
                }
            }
        }
    }

    async fn fetch_source(&mut self, stream_name: &str) -> Result<Arc<Source>> {
        let mut request = self.request()?.clone();
        request.set_stream(stream_name)?;
        self.resolve_vhost(&mut request);

        let source = self.registry.fetch_or_create(&request, &self.vhost).await?;
        self.state.request = Some(request);
        Ok(source)
    }

    fn request(&self) -> Result<&Request> {
        self.state
            .request
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidRequest("no connect request".into()).into())
    }

    async fn send(&mut self, packet: Packet, stream_id: u32) -> Result<()> {
        self.writer.send_packet(&packet, stream_id).await
    }

    /// Next inbound message within `limit`
    async fn recv(&mut self, limit: Duration) -> Result<Inbound> {
        let inbound = match tokio::time::timeout(limit, self.inbound.recv()).await {
            Ok(inbound) => inbound,
            Err(_) => return Err(Error::Timeout(limit)),
        };
        self.on_inbound(inbound).await
    }

    async fn on_inbound(&mut self, inbound: Option<Result<Inbound>>) -> Result<Inbound> {
        let item = inbound.ok_or(Error::ConnectionClosed)??;

        if let Some(sequence) = self.ack.check(self.bytes_read.load(Ordering::Relaxed)) {
            self.send(Packet::Acknowledgement(sequence), 0).await?;
        }
        Ok(item)
    }

    /// Protocol control and anything else no phase cares about
    async fn on_control(&mut self, packet: Packet) -> Result<()> {
        match packet {
            Packet::WindowAckSize(size) => {
                tracing::debug!(session_id = self.state.id, window = size, "Peer window ack size");
                self.ack.set_window(size);
            }
            Packet::UserControl(UserControlEvent::PingRequest(timestamp)) => {
                self.send(
                    Packet::UserControl(UserControlEvent::PingResponse(timestamp)),
                    0,
                )
                .await?;
            }
            Packet::SetChunkSize(_) | Packet::Abort(_) | Packet::Acknowledgement(_) => {}
            other => {
                tracing::debug!(session_id = self.state.id, packet = ?other, "Ignoring packet");
            }
        }
        Ok(())
    }
}

fn connect_result(object_encoding: f64) -> Packet {
    let data = AmfValue::ecma_array()
        .with("version", FMS_VERSION)
        .with("server", SERVER_NAME);

    Packet::ConnectResult {
        transaction_id: 1.0,
        props: AmfValue::object()
            .with("fmsVer", FMS_VERSION)
            .with("capabilities", FMS_CAPABILITIES)
            .with("mode", FMS_MODE),
        info: status_info(STATUS_LEVEL_STATUS, NC_CONNECT_SUCCESS, "Connection succeeded")
            .with("objectEncoding", object_encoding)
            .with("data", data),
    }
}

fn call_result(transaction_id: f64) -> Packet {
    Packet::CallResult {
        command: CMD_RESULT.to_string(),
        transaction_id,
        args: vec![AmfValue::Null, AmfValue::Null],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::flv;
    use crate::protocol::message::SharedMessage;
    use crate::registry::StreamKey;
    use crate::server::config::DEFAULT_VHOST;
    use bytes::Bytes;

    const LIMIT: Duration = Duration::from_secs(5);

    type ClientReader = MessageReader<ReadHalf<DuplexStream>>;
    type ClientWriter = MessageWriter<WriteHalf<DuplexStream>>;

    struct TestClient {
        reader: ClientReader,
        writer: ClientWriter,
    }

    impl TestClient {
        async fn connect(
            session_id: u64,
            config: Arc<ServerConfig>,
            registry: Arc<SourceRegistry>,
        ) -> (Self, JoinHandle<Result<()>>) {
            let (mut client_io, server_io) = tokio::io::duplex(1 << 20);
            let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
            let server = tokio::spawn(
                Connection::new(session_id, server_io, peer, config, registry).run(),
            );

            let leftover = transport::handshake(&mut client_io, HandshakeRole::Client, LIMIT)
                .await
                .unwrap();
            let (r, w) = tokio::io::split(client_io);
            let tracker = TransactionTracker::new();
            let mut client = Self {
                reader: MessageReader::with_buffer(r, leftover, tracker.clone(), LIMIT),
                writer: MessageWriter::new(w, tracker, LIMIT),
            };

            client
                .send(
                    Packet::Connect {
                        command_object: AmfValue::object()
                            .with("app", "live")
                            .with("flashVer", "FMLE/3.0 (compatible; FMSc/1.0)")
                            .with("tcUrl", "rtmp://127.0.0.1/live"),
                        args: None,
                    },
                    0,
                )
                .await;

            assert_eq!(client.next_packet().await, Packet::WindowAckSize(DEFAULT_WINDOW_ACK_SIZE));
            assert!(matches!(client.next_packet().await, Packet::SetPeerBandwidth { .. }));
            assert_eq!(client.next_packet().await, Packet::SetChunkSize(RECOMMENDED_CHUNK_SIZE));
            match client.next_packet().await {
                Packet::ConnectResult { info, .. } => {
                    assert_eq!(info.get_string(STATUS_CODE), Some(NC_CONNECT_SUCCESS));
                }
                other => panic!("expected connect result, got {other:?}"),
            }
            assert_eq!(client.next_packet().await, Packet::OnBwDone);

            (client, server)
        }

        async fn send(&mut self, packet: Packet, stream_id: u32) {
            self.writer.send_packet(&packet, stream_id).await.unwrap();
        }

        async fn send_media(&mut self, msg: SharedMessage) {
            let mut msg = msg;
            msg.stream_id = DEFAULT_STREAM_ID;
            self.writer.send_message(&msg).await.unwrap();
        }

        async fn next_packet(&mut self) -> Packet {
            loop {
                let (_, packet) = self.reader.read_packet().await.unwrap();
                if let Some(packet) = packet {
                    return packet;
                }
            }
        }

        async fn next_media(&mut self) -> RtmpMessage {
            loop {
                let (msg, packet) = self.reader.read_packet().await.unwrap();
                if packet.is_none() {
                    return msg;
                }
            }
        }

        async fn create_stream(&mut self, transaction_id: f64) {
            self.send(Packet::CreateStream { transaction_id }, 0).await;
            assert_eq!(
                self.next_packet().await,
                Packet::CreateStreamResult {
                    transaction_id,
                    stream_id: f64::from(DEFAULT_STREAM_ID),
                }
            );
        }

        async fn fmle_publish(&mut self, stream: &str) {
            for (command, transaction_id) in [
                (FmleCommand::ReleaseStream, 2.0),
                (FmleCommand::FcPublish, 3.0),
            ] {
                self.send(
                    Packet::FmleStart {
                        command,
                        transaction_id,
                        stream_name: stream.to_string(),
                    },
                    0,
                )
                .await;
                assert_eq!(self.next_packet().await, Packet::FmleStartResult { transaction_id });
            }
            self.create_stream(4.0).await;
            self.send(
                Packet::Publish {
                    transaction_id: 5.0,
                    stream_name: stream.to_string(),
                    publish_type: "live".to_string(),
                },
                DEFAULT_STREAM_ID,
            )
            .await;
        }

        async fn expect_status(&mut self, command: &str, code: &str) {
            match self.next_packet().await {
                Packet::OnStatusCall { command: c, info } => {
                    assert_eq!(c, command);
                    assert_eq!(info.get_string(STATUS_CODE), Some(code));
                }
                other => panic!("expected {command} {code}, got {other:?}"),
            }
        }
    }

    fn setup() -> (Arc<ServerConfig>, Arc<SourceRegistry>) {
        (
            Arc::new(ServerConfig::default()),
            Arc::new(SourceRegistry::new()),
        )
    }

    fn video_sh() -> SharedMessage {
        SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 0x01, 0x64, 0x00, 0x1F]))
    }

    fn audio_sh() -> SharedMessage {
        SharedMessage::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
    }

    fn frame(ts: u32, keyframe: bool, n: u8) -> SharedMessage {
        let first = if keyframe { 0x17 } else { 0x27 };
        SharedMessage::video(ts, Bytes::from(vec![first, 0x01, 0, 0, 0, n]))
    }

    #[tokio::test]
    async fn test_fmle_publish_and_mid_gop_join_play() {
        let (config, registry) = setup();

        let (mut publisher, _pub_task) =
            TestClient::connect(1, Arc::clone(&config), Arc::clone(&registry)).await;
        publisher.fmle_publish("cam1").await;
        publisher.expect_status(CMD_ON_FC_PUBLISH, NS_PUBLISH_START).await;
        publisher.expect_status(CMD_ON_STATUS, NS_PUBLISH_START).await;

        publisher
            .send(
                Packet::OnMetaData {
                    metadata: AmfValue::object().with("width", 1280.0),
                },
                DEFAULT_STREAM_ID,
            )
            .await;
        publisher.send_media(audio_sh()).await;
        publisher.send_media(video_sh()).await;
        publisher.send_media(frame(0, true, 0)).await;
        for n in 1..=3u8 {
            publisher.send_media(frame(u32::from(n) * 40, false, n)).await;
        }

        // Join in the middle of the GOP, after frame 3
        let key = StreamKey::new(DEFAULT_VHOST, "live", "cam1");
        let source = loop {
            if let Some(source) = registry.get(&key).await {
                if source.gop_len() == 4 {
                    break source;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(source.is_publishing());

        let (mut player, _play_task) =
            TestClient::connect(2, Arc::clone(&config), Arc::clone(&registry)).await;
        player.create_stream(2.0).await;
        player
            .send(
                Packet::Play {
                    transaction_id: 3.0,
                    stream_name: "cam1".to_string(),
                    start: -2.0,
                    duration: -1.0,
                    reset: true,
                },
                DEFAULT_STREAM_ID,
            )
            .await;

        assert_eq!(
            player.next_packet().await,
            Packet::UserControl(UserControlEvent::StreamBegin(DEFAULT_STREAM_ID))
        );
        player.expect_status(CMD_ON_STATUS, NS_PLAY_RESET).await;
        player.expect_status(CMD_ON_STATUS, NS_PLAY_START).await;
        assert_eq!(
            player.next_packet().await,
            Packet::SampleAccess {
                video: true,
                audio: true
            }
        );
        match player.next_packet().await {
            Packet::OnStatusData { info } => {
                assert_eq!(info.get_string(STATUS_CODE), Some(NS_DATA_START));
            }
            other => panic!("expected data start, got {other:?}"),
        }

        match player.next_packet().await {
            Packet::OnMetaData { metadata } => {
                assert_eq!(metadata.get_string("server"), Some(SERVER_NAME));
            }
            other => panic!("expected metadata, got {other:?}"),
        }

        let msg = player.next_media().await;
        assert!(flv::is_audio_sequence_header(&msg.payload));
        let msg = player.next_media().await;
        assert!(flv::is_video_sequence_header(&msg.payload));
        // Decoding starts from the cached keyframe, not from frame 3
        let msg = player.next_media().await;
        assert!(flv::is_video_keyframe(&msg.payload));
        assert_eq!(msg.payload.last(), Some(&0));
        for n in 1..=3u8 {
            let msg = player.next_media().await;
            assert!(!flv::is_video_keyframe(&msg.payload));
            assert_eq!(msg.payload.last(), Some(&n));
            assert_eq!(msg.header.stream_id, DEFAULT_STREAM_ID);
        }

        // The rest of the GOP arrives live
        for n in 4..=5u8 {
            publisher.send_media(frame(u32::from(n) * 40, false, n)).await;
        }
        for n in 4..=5u8 {
            let msg = player.next_media().await;
            assert_eq!(msg.payload.last(), Some(&n));
        }
        assert_eq!(source.gop_len(), 6);
    }

    #[tokio::test]
    async fn test_second_publisher_rejected() {
        let (config, registry) = setup();

        let (mut first, _first_task) =
            TestClient::connect(1, Arc::clone(&config), Arc::clone(&registry)).await;
        first.fmle_publish("cam1").await;
        first.expect_status(CMD_ON_FC_PUBLISH, NS_PUBLISH_START).await;
        first.expect_status(CMD_ON_STATUS, NS_PUBLISH_START).await;

        let (mut second, second_task) =
            TestClient::connect(2, Arc::clone(&config), Arc::clone(&registry)).await;
        second.create_stream(2.0).await;
        second
            .send(
                Packet::Publish {
                    transaction_id: 3.0,
                    stream_name: "cam1".to_string(),
                    publish_type: "live".to_string(),
                },
                DEFAULT_STREAM_ID,
            )
            .await;
        second.expect_status(CMD_ON_STATUS, NS_PUBLISH_BAD_NAME).await;

        let result = second_task.await.unwrap();
        assert!(matches!(result, Err(Error::Source(SourceError::StreamBusy(_)))));
    }

    #[tokio::test]
    async fn test_flash_publish_and_republish() {
        let (config, registry) = setup();

        let (mut client, _task) =
            TestClient::connect(1, Arc::clone(&config), Arc::clone(&registry)).await;
        client.create_stream(2.0).await;
        client
            .send(
                Packet::Publish {
                    transaction_id: 3.0,
                    stream_name: "cam1".to_string(),
                    publish_type: "live".to_string(),
                },
                DEFAULT_STREAM_ID,
            )
            .await;
        // Flash publishers get no onFCPublish
        client.expect_status(CMD_ON_STATUS, NS_PUBLISH_START).await;

        client
            .send(Packet::CloseStream { transaction_id: 0.0 }, DEFAULT_STREAM_ID)
            .await;

        // The same connection can publish again
        client.fmle_publish("cam1").await;
        client.expect_status(CMD_ON_FC_PUBLISH, NS_PUBLISH_START).await;
        client.expect_status(CMD_ON_STATUS, NS_PUBLISH_START).await;
    }

    #[tokio::test]
    async fn test_play_pause_and_resume() {
        let (config, registry) = setup();
        let (mut player, _task) =
            TestClient::connect(1, Arc::clone(&config), Arc::clone(&registry)).await;
        player.create_stream(2.0).await;
        player
            .send(
                Packet::Play {
                    transaction_id: 3.0,
                    stream_name: "idle".to_string(),
                    start: -2.0,
                    duration: -1.0,
                    reset: true,
                },
                DEFAULT_STREAM_ID,
            )
            .await;

        assert!(matches!(
            player.next_packet().await,
            Packet::UserControl(UserControlEvent::StreamBegin(_))
        ));
        player.expect_status(CMD_ON_STATUS, NS_PLAY_RESET).await;
        player.expect_status(CMD_ON_STATUS, NS_PLAY_START).await;
        assert!(matches!(player.next_packet().await, Packet::SampleAccess { .. }));
        assert!(matches!(player.next_packet().await, Packet::OnStatusData { .. }));

        for (is_pause, code) in [(true, NS_PAUSE_NOTIFY), (false, NS_UNPAUSE_NOTIFY)] {
            player
                .send(
                    Packet::Pause {
                        transaction_id: 0.0,
                        is_pause,
                        time_ms: 0.0,
                    },
                    DEFAULT_STREAM_ID,
                )
                .await;
            player.expect_status(CMD_ON_STATUS, code).await;
        }

        let key = StreamKey::new(DEFAULT_VHOST, "live", "idle");
        let source = registry.get(&key).await.unwrap();
        assert_eq!(source.consumer_count(), 1);
        assert!(!source.is_publishing());
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let (config, registry) = setup();
        let (mut client, _task) = TestClient::connect(1, config, registry).await;

        client
            .send(Packet::UserControl(UserControlEvent::PingRequest(1234)), 0)
            .await;
        assert_eq!(
            client.next_packet().await,
            Packet::UserControl(UserControlEvent::PingResponse(1234))
        );
    }

    #[tokio::test]
    async fn test_create_stream_depth_limited() {
        let (config, registry) = setup();
        let (mut client, task) = TestClient::connect(1, config, registry).await;

        for n in 0..MAX_CREATE_STREAM_DEPTH {
            client.create_stream(f64::from(n + 2)).await;
        }
        client.send(Packet::CreateStream { transaction_id: 9.0 }, 0).await;

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::InvalidRequest(_)))
        ));
    }
}
