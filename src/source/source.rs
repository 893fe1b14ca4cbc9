//! Live source: one publisher, many consumers
//!
//! A source is created the first time anyone asks for its [`StreamKey`],
//! whether a publisher or a player, and lives in the registry until it has
//! been idle longer than the cleanup delay.
//!
//! ```text
//!   publisher ──► on_audio / on_video / on_metadata
//!                      │
//!                      ├─► sequence header + metadata caches
//!                      ├─► consumers (enqueue, in attach order)
//!                      ├─► GOP cache
//!                      └─► sinks (after the lock is released)
//! ```
//!
//! Lock order is `state` then `consumers`. Neither lock is held across an
//! await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::consumer::{Consumer, ConsumerInner};
use super::mix_queue::MixQueue;
use super::sink::MediaSink;
use crate::amf::AmfValue;
use crate::error::SourceError;
use crate::media::flv::{self, FlvTagType};
use crate::media::gop::GopCache;
use crate::protocol::constants::SERVER_NAME;
use crate::protocol::message::SharedMessage;
use crate::protocol::packet::Packet;
use crate::protocol::request::Request;
use crate::registry::StreamKey;
use crate::server::config::VhostConfig;

#[derive(Debug)]
struct SourceState {
    /// Session id of the current publisher
    publisher: Option<u64>,
    request: Option<Request>,
    metadata: Option<SharedMessage>,
    video_sh: Option<SharedMessage>,
    audio_sh: Option<SharedMessage>,
    /// Last sequence headers seen, kept across republish
    prev_video_sh: Option<Bytes>,
    prev_audio_sh: Option<Bytes>,
    gop: GopCache,
    mix: MixQueue,
    /// Set when the source became idle
    die_at: Option<Instant>,
}

pub struct Source {
    key: StreamKey,
    config: VhostConfig,
    state: Mutex<SourceState>,
    consumers: Mutex<Vec<Arc<ConsumerInner>>>,
    generation: AtomicU64,
    next_consumer_id: AtomicU64,
    sinks: Mutex<Vec<Arc<dyn MediaSink>>>,
}

impl Source {
    pub fn new(key: StreamKey, config: VhostConfig) -> Self {
        let mut gop = GopCache::new(config.gop_cache_max_frames);
        gop.set_enabled(config.gop_cache);

        Self {
            key,
            config,
            state: Mutex::new(SourceState {
                publisher: None,
                request: None,
                metadata: None,
                video_sh: None,
                audio_sh: None,
                prev_video_sh: None,
                prev_audio_sh: None,
                gop,
                mix: MixQueue::new(),
                die_at: Some(Instant::now()),
            }),
            consumers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            next_consumer_id: AtomicU64::new(1),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn config(&self) -> &VhostConfig {
        &self.config
    }

    /// Incremented every time a publisher takes the source
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_publishing(&self) -> bool {
        self.state.lock().publisher.is_some()
    }

    /// Request of the current publisher
    pub fn request(&self) -> Option<Request> {
        self.state.lock().request.clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn gop_len(&self) -> usize {
        self.state.lock().gop.len()
    }

    pub fn add_sink(&self, sink: Arc<dyn MediaSink>) {
        self.sinks.lock().push(sink);
    }

    /// Take the publish slot for `session_id`.
    ///
    /// The slot is released when the returned guard drops.
    pub fn acquire_publish(
        self: &Arc<Self>,
        session_id: u64,
        request: &Request,
    ) -> Result<PublishGuard, SourceError> {
        {
            let mut state = self.state.lock();
            if state.publisher.is_some() {
                return Err(SourceError::StreamBusy(self.key.to_string()));
            }

            state.publisher = Some(session_id);
            state.request = Some(request.clone());
            state.metadata = None;
            state.video_sh = None;
            state.audio_sh = None;
            state.mix.clear();
            state.die_at = None;

            self.generation.fetch_add(1, Ordering::AcqRel);
            for consumer in self.consumers.lock().iter() {
                consumer.mark_source_changed();
            }
        }

        tracing::info!(
            stream = %self.key,
            session_id = session_id,
            generation = self.generation(),
            consumers = self.consumer_count(),
            "Publish started"
        );

        for sink in self.sinks() {
            if let Err(e) = sink.on_publish(request) {
                tracing::warn!(stream = %self.key, error = %e, "Sink rejected publish");
            }
        }

        Ok(PublishGuard {
            source: Arc::clone(self),
            session_id,
        })
    }

    fn unpublish(&self, session_id: u64) {
        {
            let mut state = self.state.lock();
            if state.publisher != Some(session_id) {
                return;
            }
            state.publisher = None;
            state.request = None;
            state.gop.clear();
            state.mix.clear();
            if self.consumers.lock().is_empty() {
                state.die_at = Some(Instant::now());
            }
        }

        for sink in self.sinks() {
            sink.on_unpublish();
        }

        tracing::info!(stream = %self.key, session_id = session_id, "Publish stopped");
    }

    pub fn on_audio(&self, msg: SharedMessage) -> Result<(), SourceError> {
        let is_sh = flv::is_audio_sequence_header(msg.payload());
        self.on_media(msg, is_sh)
    }

    pub fn on_video(&self, msg: SharedMessage) -> Result<(), SourceError> {
        if !flv::is_video_acceptable(msg.payload()) {
            let first = msg.payload().first().copied().unwrap_or(0);
            tracing::warn!(
                stream = %self.key,
                codec_byte = first,
                size = msg.payload().len(),
                "Dropping video with unsupported codec"
            );
            return Ok(());
        }
        let is_sh = flv::is_video_sequence_header(msg.payload());
        self.on_media(msg, is_sh)
    }

    fn on_media(&self, msg: SharedMessage, is_sh: bool) -> Result<(), SourceError> {
        let delivered = {
            let mut state = self.state.lock();
            if state.publisher.is_none() {
                return Err(SourceError::NotPublishing(self.key.to_string()));
            }

            let next = if self.config.mix_correct && !is_sh {
                state.mix.push(msg);
                state.mix.pop()
            } else {
                Some(msg)
            };

            next.map(|msg| self.process(&mut *state, msg))
        };

        if let Some(msg) = delivered {
            self.notify_sinks(&msg);
        }
        Ok(())
    }

    /// Cache and fan out one message. Returns it for the sinks, which also
    /// see duplicate sequence headers.
    fn process(&self, state: &mut SourceState, msg: SharedMessage) -> SharedMessage {
        let payload = msg.payload();
        let is_video = msg.is_video();
        let is_sh = if is_video {
            flv::is_video_sequence_header(payload)
        } else {
            flv::is_audio_sequence_header(payload)
        };

        if is_sh {
            let prev = if is_video {
                &mut state.prev_video_sh
            } else {
                &mut state.prev_audio_sh
            };
            let duplicate =
                self.config.reduce_sequence_header && prev.as_ref() == Some(payload);
            *prev = Some(payload.clone());

            if is_video {
                state.video_sh = Some(msg.clone());
            } else {
                state.audio_sh = Some(msg.clone());
            }

            if duplicate {
                tracing::warn!(
                    stream = %self.key,
                    video = is_video,
                    "Ignoring duplicated sequence header"
                );
                return msg;
            }
        }

        for consumer in self.consumers.lock().iter() {
            if consumer.enqueue(&msg) {
                tracing::trace!(
                    stream = %self.key,
                    consumer_id = consumer.id(),
                    overflows = consumer.overflow_count(),
                    "Consumer queue overflow"
                );
            }
        }

        if !is_sh {
            state.gop.cache(&msg);
        }

        msg
    }

    /// Cache and fan out stream metadata.
    ///
    /// The object is re-encoded as a plain `onMetaData` call tagged with
    /// this server's name.
    pub fn on_metadata(&self, mut metadata: AmfValue, timestamp: u32) -> Result<(), SourceError> {
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("server".to_string(), SERVER_NAME.into());
        }
        let msg = Packet::OnMetaData { metadata }.to_message(timestamp, 0);

        {
            let mut state = self.state.lock();
            if state.publisher.is_none() {
                return Err(SourceError::NotPublishing(self.key.to_string()));
            }

            let had_metadata = state.metadata.is_some();
            state.metadata = Some(msg.clone());

            if self.config.reduce_sequence_header && had_metadata {
                tracing::debug!(stream = %self.key, "Metadata updated, not resent");
            } else {
                for consumer in self.consumers.lock().iter() {
                    consumer.enqueue(&msg);
                }
            }
        }

        for sink in self.sinks() {
            if let Err(e) = sink.on_metadata(&msg) {
                tracing::warn!(stream = %self.key, error = %e, "Sink failed on metadata");
            }
        }
        Ok(())
    }

    /// Split an aggregate message and process each audio/video tag in it
    pub fn on_aggregate(&self, msg: &SharedMessage) -> crate::error::Result<()> {
        let tags = flv::split_aggregate(msg.payload(), msg.timestamp)?;
        for tag in tags {
            match tag.tag_type {
                FlvTagType::Audio => self.on_audio(tag.into_message(msg.stream_id))?,
                FlvTagType::Video => self.on_video(tag.into_message(msg.stream_id))?,
                FlvTagType::Script => {
                    tracing::debug!(stream = %self.key, "Skipping script tag in aggregate");
                }
            }
        }
        Ok(())
    }

    /// Attach a new consumer, primed with metadata, sequence headers and
    /// the cached GOP.
    pub fn create_consumer(self: &Arc<Self>) -> Consumer {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ConsumerInner::new(
            id,
            self.config.queue_length,
            self.config.jitter,
            self.config.atc,
        ));

        let (gop_len, publishing) = {
            let mut state = self.state.lock();
            for msg in [&state.metadata, &state.audio_sh, &state.video_sh]
                .into_iter()
                .flatten()
            {
                inner.enqueue(msg);
            }
            for msg in state.gop.messages() {
                inner.enqueue(msg);
            }

            self.consumers.lock().push(Arc::clone(&inner));
            state.die_at = None;
            (state.gop.len(), state.publisher.is_some())
        };

        tracing::info!(
            stream = %self.key,
            consumer_id = id,
            gop_messages = gop_len,
            publishing = publishing,
            "Consumer attached"
        );

        Consumer::new(inner, Arc::clone(self))
    }

    pub(crate) fn detach(&self, consumer_id: u64) {
        let remaining = {
            let mut state = self.state.lock();
            let mut consumers = self.consumers.lock();
            consumers.retain(|c| c.id() != consumer_id);
            if consumers.is_empty() && state.publisher.is_none() {
                state.die_at = Some(Instant::now());
            }
            consumers.len()
        };

        tracing::info!(
            stream = %self.key,
            consumer_id = consumer_id,
            remaining = remaining,
            "Consumer detached"
        );
    }

    /// Idle for at least `delay`: no publisher and no consumers
    pub fn is_expired(&self, delay: Duration) -> bool {
        let state = self.state.lock();
        if state.publisher.is_some() || !self.consumers.lock().is_empty() {
            return false;
        }
        state.die_at.is_some_and(|at| at.elapsed() >= delay)
    }

    fn sinks(&self) -> Vec<Arc<dyn MediaSink>> {
        self.sinks.lock().clone()
    }

    fn notify_sinks(&self, msg: &SharedMessage) {
        for sink in self.sinks() {
            let result = if msg.is_video() {
                sink.on_video(msg)
            } else {
                sink.on_audio(msg)
            };
            if let Err(e) = result {
                tracing::warn!(stream = %self.key, error = %e, "Sink failed on media");
            }
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("key", &self.key)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Publish slot held by a publishing connection
#[derive(Debug)]
pub struct PublishGuard {
    source: Arc<Source>,
    session_id: u64,
}

impl PublishGuard {
    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        self.source.unpublish(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn source_with(config: VhostConfig) -> Arc<Source> {
        Arc::new(Source::new(StreamKey::new("localhost", "live", "test"), config))
    }

    fn source() -> Arc<Source> {
        source_with(VhostConfig::default())
    }

    fn request() -> Request {
        let mut req = Request::from_tc_url("rtmp://localhost/live").unwrap();
        req.set_stream("test").unwrap();
        req
    }

    fn video_sh() -> SharedMessage {
        SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 0x01, 0x64]))
    }

    fn audio_sh() -> SharedMessage {
        SharedMessage::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
    }

    fn keyframe(ts: u32) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 0xAA]))
    }

    fn interframe(ts: u32) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 0xBB]))
    }

    fn audio(ts: u32) -> SharedMessage {
        SharedMessage::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x21]))
    }

    #[test]
    fn test_single_publisher() {
        let source = source();
        let guard = source.acquire_publish(1, &request()).unwrap();
        assert!(source.is_publishing());

        let second = source.acquire_publish(2, &request());
        assert!(matches!(second, Err(SourceError::StreamBusy(_))));

        drop(guard);
        assert!(!source.is_publishing());
        assert!(source.acquire_publish(2, &request()).is_ok());
    }

    #[test]
    fn test_concurrent_publish_has_one_winner() {
        let source = source();
        let handles: Vec<_> = (0..8u64)
            .map(|id| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || {
                    // Hold the guard until the thread returns a verdict
                    source.acquire_publish(id, &request()).map(std::mem::forget).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_media_requires_publisher() {
        let source = source();
        assert!(matches!(
            source.on_video(keyframe(0)),
            Err(SourceError::NotPublishing(_))
        ));
        assert!(matches!(
            source.on_metadata(AmfValue::object(), 0),
            Err(SourceError::NotPublishing(_))
        ));
    }

    #[test]
    fn test_late_join_receives_headers_then_gop() {
        let source = source();
        let _guard = source.acquire_publish(1, &request()).unwrap();

        source.on_metadata(AmfValue::object().with("width", 1280.0), 0).unwrap();
        source.on_video(video_sh()).unwrap();
        source.on_audio(audio_sh()).unwrap();
        source.on_video(keyframe(0)).unwrap();
        source.on_audio(audio(10)).unwrap();
        source.on_video(interframe(40)).unwrap();

        let consumer = source.create_consumer();
        let msgs = consumer.dump_packets(0);
        assert_eq!(msgs.len(), 6);
        assert!(msgs[0].is_data());
        assert!(flv::is_audio_sequence_header(msgs[1].payload()));
        assert!(flv::is_video_sequence_header(msgs[2].payload()));
        assert!(flv::is_video_keyframe(msgs[3].payload()));
        assert!(msgs[4].is_audio());
        assert_eq!(msgs[5].payload(), interframe(40).payload());
    }

    #[test]
    fn test_metadata_tagged_with_server() {
        let source = source();
        let _guard = source.acquire_publish(1, &request()).unwrap();
        source.on_metadata(AmfValue::object().with("width", 1280.0), 0).unwrap();

        let consumer = source.create_consumer();
        let msgs = consumer.dump_packets(0);
        let values = crate::amf::amf0::decode_all(msgs[0].payload()).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));
        assert_eq!(values[1].get_string("server"), Some(SERVER_NAME));
        assert_eq!(values[1].get_number("width"), Some(1280.0));
    }

    #[test]
    fn test_live_fan_out_in_order() {
        let source = source();
        let _guard = source.acquire_publish(1, &request()).unwrap();
        let first = source.create_consumer();
        let second = source.create_consumer();

        source.on_video(keyframe(0)).unwrap();
        source.on_audio(audio(20)).unwrap();

        for consumer in [&first, &second] {
            let msgs = consumer.dump_packets(0);
            assert_eq!(msgs.len(), 2);
            assert!(msgs[0].is_video());
            assert!(msgs[1].is_audio());
        }
    }

    #[test]
    fn test_duplicate_sequence_header_reduced() {
        let config = VhostConfig {
            reduce_sequence_header: true,
            ..VhostConfig::default()
        };
        let source = source_with(config);
        let _guard = source.acquire_publish(1, &request()).unwrap();
        let consumer = source.create_consumer();

        source.on_video(video_sh()).unwrap();
        source.on_video(video_sh()).unwrap();
        assert_eq!(consumer.dump_packets(0).len(), 1);

        // A changed header goes through
        source
            .on_video(SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 0x02])))
            .unwrap();
        assert_eq!(consumer.dump_packets(0).len(), 1);
    }

    #[test]
    fn test_duplicate_sequence_header_kept_by_default() {
        let source = source();
        let _guard = source.acquire_publish(1, &request()).unwrap();
        let consumer = source.create_consumer();
        source.on_video(video_sh()).unwrap();
        source.on_video(video_sh()).unwrap();
        assert_eq!(consumer.dump_packets(0).len(), 2);
    }

    #[test]
    fn test_duplicate_suppressed_across_republish() {
        let config = VhostConfig {
            reduce_sequence_header: true,
            ..VhostConfig::default()
        };
        let source = source_with(config);
        let consumer = source.create_consumer();

        let guard = source.acquire_publish(1, &request()).unwrap();
        source.on_video(video_sh()).unwrap();
        drop(guard);

        let _guard = source.acquire_publish(2, &request()).unwrap();
        source.on_video(video_sh()).unwrap();
        assert_eq!(consumer.dump_packets(0).len(), 1);
        assert!(consumer.should_update_source_id());
        assert!(!consumer.should_update_source_id());
    }

    #[test]
    fn test_unacceptable_video_dropped() {
        let source = source();
        let _guard = source.acquire_publish(1, &request()).unwrap();
        let consumer = source.create_consumer();
        source
            .on_video(SharedMessage::video(0, Bytes::from_static(&[0x1F, 0x01])))
            .unwrap();
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_mix_correct_reorders() {
        let config = VhostConfig {
            mix_correct: true,
            jitter: crate::source::JitterAlgorithm::Off,
            ..VhostConfig::default()
        };
        let source = source_with(config);
        let _guard = source.acquire_publish(1, &request()).unwrap();
        let consumer = source.create_consumer();

        source.on_video(keyframe(0)).unwrap();
        source.on_video(interframe(40)).unwrap();
        source.on_audio(audio(20)).unwrap();
        source.on_audio(audio(60)).unwrap();

        let ts: Vec<u32> = consumer.dump_packets(0).iter().map(|m| m.timestamp).collect();
        assert_eq!(ts, vec![0, 20]);
    }

    #[test]
    fn test_unpublish_clears_gop_and_sets_expiry() {
        let source = source();
        let guard = source.acquire_publish(1, &request()).unwrap();
        source.on_video(keyframe(0)).unwrap();
        assert_eq!(source.gop_len(), 1);
        assert!(!source.is_expired(Duration::ZERO));

        drop(guard);
        assert_eq!(source.gop_len(), 0);
        assert!(source.is_expired(Duration::ZERO));
        assert!(!source.is_expired(Duration::from_secs(3600)));
    }

    #[test]
    fn test_consumer_detaches_on_drop() {
        let source = source();
        let consumer = source.create_consumer();
        assert_eq!(source.consumer_count(), 1);
        assert!(!source.is_expired(Duration::ZERO));

        drop(consumer);
        assert_eq!(source.consumer_count(), 0);
        assert!(source.is_expired(Duration::ZERO));
    }

    #[test]
    fn test_aggregate_split() {
        let source = source();
        let _guard = source.acquire_publish(1, &request()).unwrap();
        let consumer = source.create_consumer();

        let mut agg = Vec::new();
        for (tag_type, ts, data) in [(9u8, 1000u32, &[0x17u8, 0x01, 0, 0, 0][..]), (8, 1020, &[0xAF, 0x01][..])] {
            agg.push(tag_type);
            agg.extend_from_slice(&(data.len() as u32).to_be_bytes()[1..]);
            agg.extend_from_slice(&ts.to_be_bytes()[1..]);
            agg.push((ts >> 24) as u8);
            agg.extend_from_slice(&[0, 0, 0]);
            agg.extend_from_slice(data);
            agg.extend_from_slice(&(11 + data.len() as u32).to_be_bytes());
        }
        let msg = SharedMessage::new(22, 5000, 1, 6, Bytes::from(agg));
        source.on_aggregate(&msg).unwrap();

        let msgs = consumer.dump_packets(0);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].is_video());
        assert!(msgs[1].is_audio());
    }

    #[derive(Default)]
    struct CountingSink {
        published: parking_lot::Mutex<u32>,
        videos: parking_lot::Mutex<u32>,
    }

    impl MediaSink for CountingSink {
        fn on_publish(&self, _request: &Request) -> Result<()> {
            *self.published.lock() += 1;
            Ok(())
        }

        fn on_video(&self, _msg: &SharedMessage) -> Result<()> {
            *self.videos.lock() += 1;
            Err(crate::error::Error::ConnectionClosed)
        }
    }

    #[test]
    fn test_sinks_see_duplicates_and_errors_are_ignored() {
        let config = VhostConfig {
            reduce_sequence_header: true,
            ..VhostConfig::default()
        };
        let source = source_with(config);
        let sink = Arc::new(CountingSink::default());
        source.add_sink(sink.clone());

        let _guard = source.acquire_publish(1, &request()).unwrap();
        source.on_video(video_sh()).unwrap();
        source.on_video(video_sh()).unwrap();
        source.on_video(keyframe(0)).unwrap();

        assert_eq!(*sink.published.lock(), 1);
        assert_eq!(*sink.videos.lock(), 3);
    }
}
