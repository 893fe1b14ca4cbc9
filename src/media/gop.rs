//! GOP (Group of Pictures) cache for late joiners
//!
//! A player that joins mid-stream cannot decode anything until the next
//! key frame. The cache holds everything since the most recent key frame
//! so a new consumer can start from it immediately:
//!
//! 1. A key frame clears the cache and starts a new GOP.
//! 2. Nothing is cached until the first acceptable video frame arrives.
//! 3. More than [`PURE_AUDIO_GUESS_COUNT`] audio messages without video
//!    means the stream has gone audio only; the cache is dropped.
//! 4. Sequence headers are never cached; the source keeps those itself.

use crate::media::flv;
use crate::protocol::message::SharedMessage;

/// Audio messages after the last video before the stream counts as pure audio
pub const PURE_AUDIO_GUESS_COUNT: usize = 115;

/// Default safety bound on cached messages
pub const DEFAULT_MAX_FRAMES: usize = 2500;

#[derive(Debug)]
pub struct GopCache {
    enabled: bool,
    /// Upper bound on cached messages, 0 for none
    max_frames: usize,
    /// Video frames in the current GOP
    cached_video_count: usize,
    audio_after_last_video_count: usize,
    msgs: Vec<SharedMessage>,
}

impl GopCache {
    pub fn new(max_frames: usize) -> Self {
        Self {
            enabled: true,
            max_frames,
            cached_video_count: 0,
            audio_after_last_video_count: 0,
            msgs: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling drops whatever is cached
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    /// Offer a message to the cache
    pub fn cache(&mut self, msg: &SharedMessage) {
        if !self.enabled {
            return;
        }

        let payload = msg.payload();
        if msg.is_video() {
            if !flv::is_video_acceptable(payload) || flv::is_video_sequence_header(payload) {
                return;
            }
            self.cached_video_count += 1;
            self.audio_after_last_video_count = 0;
        }

        // Wait for the first video before caching audio
        if self.cached_video_count == 0 {
            return;
        }

        if msg.is_audio() {
            if flv::is_audio_sequence_header(payload) {
                return;
            }
            self.audio_after_last_video_count += 1;
        }

        if self.audio_after_last_video_count > PURE_AUDIO_GUESS_COUNT {
            tracing::warn!(
                audio_count = self.audio_after_last_video_count,
                "Clearing GOP cache, stream looks audio only"
            );
            self.clear();
            return;
        }

        if msg.is_video() && flv::is_video_keyframe(payload) {
            self.msgs.clear();
            self.cached_video_count = 1;
        }

        if self.max_frames > 0 && self.msgs.len() >= self.max_frames {
            tracing::warn!(
                max_frames = self.max_frames,
                "GOP cache full, clearing"
            );
            self.clear();
            return;
        }

        self.msgs.push(msg.clone());
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.cached_video_count = 0;
        self.audio_after_last_video_count = 0;
    }

    pub fn messages(&self) -> &[SharedMessage] {
        &self.msgs
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// No video has been seen since the cache was last cleared
    pub fn pure_audio(&self) -> bool {
        self.cached_video_count == 0
    }

    /// Timestamp of the first cached audio or video message
    pub fn start_time(&self) -> Option<u32> {
        self.msgs.iter().find(|m| m.is_av()).map(|m| m.timestamp)
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES)
    }
}
