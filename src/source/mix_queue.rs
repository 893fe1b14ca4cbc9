//! Audio/video interleaving
//!
//! Some encoders send audio and video in bursts, each in order but far
//! apart from each other. With mix correction on, the source reorders
//! media by timestamp before fan-out. A message is released only once the
//! other media type has caught up, or once enough messages of one type
//! piled up that the stream is clearly single-media.

use std::collections::BTreeMap;

use crate::protocol::message::SharedMessage;

/// Messages of one type, with none of the other, before the queue gives up
/// waiting and treats the stream as pure audio or pure video
pub const MIX_CORRECT_PURE_AV: usize = 10;

#[derive(Debug, Default)]
pub struct MixQueue {
    nb_videos: usize,
    nb_audios: usize,
    next_seq: u64,
    /// Keyed by (timestamp, arrival) so equal timestamps keep arrival order
    msgs: BTreeMap<(u32, u64), SharedMessage>,
}

impl MixQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: SharedMessage) {
        if msg.is_video() {
            self.nb_videos += 1;
        } else {
            self.nb_audios += 1;
        }
        self.msgs.insert((msg.timestamp, self.next_seq), msg);
        self.next_seq += 1;
    }

    /// Oldest message, once the queue is allowed to release one
    pub fn pop(&mut self) -> Option<SharedMessage> {
        let pure_video = self.nb_videos >= MIX_CORRECT_PURE_AV && self.nb_audios == 0;
        let pure_audio = self.nb_audios >= MIX_CORRECT_PURE_AV && self.nb_videos == 0;
        let mixed = self.nb_videos >= 1 && self.nb_audios >= 1;
        if !(pure_video || pure_audio || mixed) {
            return None;
        }

        let (_, msg) = self.msgs.pop_first()?;
        if msg.is_video() {
            self.nb_videos -= 1;
        } else {
            self.nb_audios -= 1;
        }
        Some(msg)
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.nb_videos = 0;
        self.nb_audios = 0;
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(ts: u32) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x27, 0x01]))
    }

    fn audio(ts: u32) -> SharedMessage {
        SharedMessage::audio(ts, Bytes::from_static(&[0xAF, 0x01]))
    }

    fn drain(queue: &mut MixQueue) -> Vec<(bool, u32)> {
        std::iter::from_fn(|| queue.pop())
            .map(|m| (m.is_video(), m.timestamp))
            .collect()
    }

    #[test]
    fn test_waits_for_both_types() {
        let mut queue = MixQueue::new();
        queue.push(video(0));
        queue.push(video(33));
        assert!(queue.pop().is_none());

        queue.push(audio(10));
        // Released in timestamp order while both types remain
        assert_eq!(queue.pop().map(|m| m.timestamp), Some(0));
        assert_eq!(queue.pop().map(|m| m.timestamp), Some(10));
        // Only video left
        assert!(queue.pop().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reorders_bursts() {
        let mut queue = MixQueue::new();
        for ts in [0, 40, 80] {
            queue.push(video(ts));
        }
        for ts in [20, 60, 100] {
            queue.push(audio(ts));
        }
        assert_eq!(
            drain(&mut queue),
            vec![(true, 0), (false, 20), (true, 40), (false, 60), (true, 80)]
        );
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut queue = MixQueue::new();
        queue.push(audio(100));
        queue.push(video(100));
        queue.push(audio(100));
        queue.push(video(200));
        assert_eq!(drain(&mut queue), vec![(false, 100), (true, 100), (false, 100)]);
    }

    #[test]
    fn test_pure_audio_released_after_threshold() {
        let mut queue = MixQueue::new();
        for i in 0..MIX_CORRECT_PURE_AV as u32 - 1 {
            queue.push(audio(i * 23));
            assert!(queue.pop().is_none());
        }
        queue.push(audio(999));
        assert_eq!(queue.pop().map(|m| m.timestamp), Some(0));
    }

    #[test]
    fn test_clear() {
        let mut queue = MixQueue::new();
        queue.push(audio(0));
        queue.push(video(0));
        queue.clear();
        assert!(queue.is_empty());
        queue.push(video(5));
        assert!(queue.pop().is_none());
    }
}
