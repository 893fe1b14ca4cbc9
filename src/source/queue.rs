//! Per-consumer outbound queue
//!
//! Bounded by the media duration it holds rather than message count. When
//! a slow player falls behind, the oldest messages are evicted, but the
//! most recent sequence headers among them are put back at the head so the
//! player can still decode what remains.

use std::collections::VecDeque;
use std::time::Duration;

use crate::media::flv;
use crate::protocol::message::SharedMessage;

#[derive(Debug)]
pub struct MessageQueue {
    msgs: VecDeque<SharedMessage>,
    max_duration_ms: i64,
    /// Timestamp of the oldest queued audio/video message
    av_start: Option<i64>,
    /// Timestamp of the newest queued audio/video message
    av_end: Option<i64>,
}

impl MessageQueue {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            msgs: VecDeque::new(),
            max_duration_ms: duration_ms(max_duration),
            av_start: None,
            av_end: None,
        }
    }

    /// Queue a message, evicting from the head if the window overflows.
    ///
    /// Returns true when anything was evicted.
    pub fn enqueue(&mut self, msg: SharedMessage) -> bool {
        if msg.is_av() {
            let ts = i64::from(msg.timestamp);
            if self.av_start.is_none() {
                self.av_start = Some(ts);
            }
            self.av_end = Some(ts);
        }
        self.msgs.push_back(msg);

        if self.max_duration_ms <= 0 || self.duration_ms() <= self.max_duration_ms {
            return false;
        }
        self.shrink();
        true
    }

    fn shrink(&mut self) {
        let before = self.msgs.len();
        let mut video_sh = None;
        let mut audio_sh = None;

        while self.duration_ms() > self.max_duration_ms {
            let Some(msg) = self.msgs.pop_front() else {
                break;
            };
            if msg.is_video() && flv::is_video_sequence_header(msg.payload()) {
                video_sh = Some(msg);
            } else if msg.is_audio() && flv::is_audio_sequence_header(msg.payload()) {
                audio_sh = Some(msg);
            }
            self.av_start = self
                .msgs
                .iter()
                .find(|m| m.is_av())
                .map(|m| i64::from(m.timestamp));
            if self.av_start.is_none() {
                self.av_end = None;
            }
        }

        let base = self.av_start;
        for mut sh in [audio_sh, video_sh].into_iter().flatten() {
            if let Some(base) = base {
                sh.timestamp = base as u32;
            }
            self.msgs.push_front(sh);
        }
        if self.av_start.is_none() {
            // Only reinserted headers remain
            self.av_start = self.msgs.front().map(|m| i64::from(m.timestamp));
            self.av_end = self.msgs.back().map(|m| i64::from(m.timestamp));
        }

        tracing::warn!(
            evicted = before.saturating_sub(self.msgs.len()),
            remaining = self.msgs.len(),
            max_ms = self.max_duration_ms,
            "Consumer queue overflow, dropped oldest messages"
        );
    }

    /// Take up to `max` messages from the head, all of them if `max` is 0
    pub fn dump_packets(&mut self, max: usize) -> Vec<SharedMessage> {
        let count = if max == 0 {
            self.msgs.len()
        } else {
            max.min(self.msgs.len())
        };
        let out: Vec<SharedMessage> = self.msgs.drain(..count).collect();

        self.av_start = self
            .msgs
            .iter()
            .find(|m| m.is_av())
            .map(|m| i64::from(m.timestamp));
        if self.av_start.is_none() {
            self.av_end = None;
        }
        out
    }

    /// Span of queued audio/video in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match (self.av_start, self.av_end) {
            (Some(start), Some(end)) => end - start,
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.av_start = None;
        self.av_end = None;
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(ts: u32) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x27, 0x01, 0, 0, 0]))
    }

    fn video_sh(ts: u32) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x17, 0x00, 0, 0, 0]))
    }

    fn audio_sh(ts: u32) -> SharedMessage {
        SharedMessage::audio(ts, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
    }

    #[test]
    fn test_within_window() {
        let mut queue = MessageQueue::new(Duration::from_secs(1));
        for ts in (0..=1000).step_by(100) {
            assert!(!queue.enqueue(video(ts)));
        }
        assert_eq!(queue.len(), 11);
        assert_eq!(queue.duration_ms(), 1000);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut queue = MessageQueue::new(Duration::from_millis(500));
        for ts in (0..=500).step_by(100) {
            assert!(!queue.enqueue(video(ts)));
        }
        assert!(queue.enqueue(video(600)));
        assert!(queue.duration_ms() <= 500);

        let msgs = queue.dump_packets(0);
        assert_eq!(msgs.first().map(|m| m.timestamp), Some(100));
        assert_eq!(msgs.last().map(|m| m.timestamp), Some(600));
    }

    #[test]
    fn test_overflow_keeps_sequence_headers() {
        let mut queue = MessageQueue::new(Duration::from_millis(200));
        queue.enqueue(video_sh(0));
        queue.enqueue(audio_sh(0));
        for ts in (0..=300).step_by(100) {
            queue.enqueue(video(ts));
        }

        let msgs = queue.dump_packets(0);
        assert!(flv::is_video_sequence_header(msgs[0].payload()));
        assert!(flv::is_audio_sequence_header(msgs[1].payload()));
        // Headers are restamped to the new head of the window
        assert_eq!(msgs[0].timestamp, 100);
        assert_eq!(msgs[1].timestamp, 100);
        assert_eq!(msgs[2].timestamp, 100);
        assert_eq!(msgs.len(), 5);
    }

    #[test]
    fn test_dump_partial() {
        let mut queue = MessageQueue::new(Duration::from_secs(30));
        for ts in [0, 40, 80] {
            queue.enqueue(video(ts));
        }
        let first = queue.dump_packets(2);
        assert_eq!(first.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.duration_ms(), 0);

        queue.enqueue(video(120));
        assert_eq!(queue.duration_ms(), 40);
    }

    #[test]
    fn test_non_media_does_not_extend_window() {
        let mut queue = MessageQueue::new(Duration::from_millis(100));
        queue.enqueue(SharedMessage::new(
            crate::protocol::constants::MSG_DATA_AMF0,
            5000,
            1,
            4,
            Bytes::new(),
        ));
        queue.enqueue(video(0));
        queue.enqueue(video(50));
        assert_eq!(queue.duration_ms(), 50);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_clear() {
        let mut queue = MessageQueue::new(Duration::from_secs(1));
        queue.enqueue(video(0));
        queue.enqueue(video(10));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.duration_ms(), 0);
    }
}
