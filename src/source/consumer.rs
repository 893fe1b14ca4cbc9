//! Subscriber side of a source
//!
//! The source pushes into each consumer through [`ConsumerInner::enqueue`].
//! The play connection owns the [`Consumer`] handle and drains it with
//! [`Consumer::wait`] and [`Consumer::dump_packets`]. Dropping the handle
//! detaches it from the source.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::jitter::{Jitter, JitterAlgorithm};
use super::queue::MessageQueue;
use super::source::Source;
use crate::protocol::message::SharedMessage;

#[derive(Debug)]
struct ConsumerState {
    queue: MessageQueue,
    jitter: Jitter,
    paused: bool,
    /// Registered wait condition: (min messages, min duration in ms)
    wait: Option<(usize, i64)>,
}

impl ConsumerState {
    fn ready(&self, min_msgs: usize, min_duration_ms: i64) -> bool {
        !self.queue.is_empty()
            && (self.queue.len() >= min_msgs || self.queue.duration_ms() >= min_duration_ms)
    }
}

/// State shared between the source's consumer list and the handle
#[derive(Debug)]
pub(crate) struct ConsumerInner {
    id: u64,
    state: Mutex<ConsumerState>,
    notify: Notify,
    update_source_id: AtomicBool,
    /// Enqueues that evicted old messages
    overflows: AtomicU64,
    algorithm: JitterAlgorithm,
    atc: bool,
}

impl ConsumerInner {
    pub(crate) fn new(
        id: u64,
        queue_length: Duration,
        algorithm: JitterAlgorithm,
        atc: bool,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(ConsumerState {
                queue: MessageQueue::new(queue_length),
                jitter: Jitter::new(),
                paused: false,
                wait: None,
            }),
            notify: Notify::new(),
            update_source_id: AtomicBool::new(false),
            overflows: AtomicU64::new(0),
            algorithm,
            atc,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Correct timestamps and queue a copy of `msg`.
    ///
    /// Returns true when the queue overflowed and dropped old messages.
    pub(crate) fn enqueue(&self, msg: &SharedMessage) -> bool {
        let mut msg = msg.clone();
        let (overflow, wake) = {
            let mut state = self.state.lock();
            if !self.atc {
                state.jitter.correct(&mut msg, self.algorithm);
            }
            let overflow = state.queue.enqueue(msg);

            let wake = match state.wait {
                Some((min_msgs, min_ms)) if state.ready(min_msgs, min_ms) => {
                    state.wait = None;
                    true
                }
                _ => false,
            };
            (overflow, wake)
        };
        if overflow {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        if wake {
            self.notify.notify_one();
        }
        overflow
    }

    pub(crate) fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_source_changed(&self) {
        self.update_source_id.store(true, Ordering::Release);
    }

    fn wakeup(&self) {
        self.state.lock().wait = None;
        self.notify.notify_one();
    }
}

/// Handle held by a play connection
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    source: Arc<Source>,
}

impl Consumer {
    pub(crate) fn new(inner: Arc<ConsumerInner>, source: Arc<Source>) -> Self {
        Self { inner, source }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    /// Wait until at least `min_msgs` messages or `min_duration` of media is
    /// queued, the consumer is paused, or [`wakeup`](Self::wakeup) is called.
    pub async fn wait(&self, min_msgs: usize, min_duration: Duration) {
        let min_ms = i64::try_from(min_duration.as_millis()).unwrap_or(i64::MAX);
        {
            let mut state = self.inner.state.lock();
            if state.paused || state.ready(min_msgs, min_ms) {
                return;
            }
            state.wait = Some((min_msgs, min_ms));
        }
        self.inner.notify.notified().await;
    }

    /// Release a pending [`wait`](Self::wait)
    pub fn wakeup(&self) {
        self.inner.wakeup();
    }

    /// Take up to `max` queued messages, all if `max` is 0. Nothing while paused.
    pub fn dump_packets(&self, max: usize) -> Vec<SharedMessage> {
        let mut state = self.inner.state.lock();
        if state.paused {
            return Vec::new();
        }
        state.queue.dump_packets(max)
    }

    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        tracing::debug!(consumer_id = self.inner.id, "Consumer paused");
        self.inner.wakeup();
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        tracing::debug!(consumer_id = self.inner.id, "Consumer resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// True once after each new publisher took over the source
    pub fn should_update_source_id(&self) -> bool {
        self.inner.update_source_id.swap(false, Ordering::AcqRel)
    }

    /// How many times the queue overflowed and dropped its oldest media
    pub fn overflow_count(&self) -> u64 {
        self.inner.overflow_count()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.source.detach(self.inner.id);
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("stream", self.source.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StreamKey;
    use crate::server::config::VhostConfig;
    use bytes::Bytes;
    use tokio_test::{assert_pending, assert_ready, task};

    fn inner(atc: bool) -> ConsumerInner {
        ConsumerInner::new(1, Duration::from_secs(30), JitterAlgorithm::Full, atc)
    }

    fn video(ts: u32) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x27, 0x01]))
    }

    #[test]
    fn test_enqueue_applies_jitter() {
        let consumer = inner(false);
        consumer.enqueue(&video(5000));
        consumer.enqueue(&video(5040));
        let msgs = consumer.state.lock().queue.dump_packets(0);
        assert_eq!(msgs[0].timestamp, 9);
        assert_eq!(msgs[1].timestamp, 49);
    }

    #[test]
    fn test_atc_skips_jitter() {
        let consumer = inner(true);
        consumer.enqueue(&video(5000));
        let msgs = consumer.state.lock().queue.dump_packets(0);
        assert_eq!(msgs[0].timestamp, 5000);
    }

    #[test]
    fn test_enqueue_leaves_original_untouched() {
        let consumer = inner(false);
        let msg = video(5000);
        consumer.enqueue(&msg);
        assert_eq!(msg.timestamp, 5000);
    }

    #[test]
    fn test_ready_condition() {
        let consumer = inner(false);
        {
            let state = consumer.state.lock();
            assert!(!state.ready(0, 0));
        }
        consumer.enqueue(&video(0));
        consumer.enqueue(&video(40));
        let state = consumer.state.lock();
        assert!(state.ready(2, 10_000));
        assert!(state.ready(10, 40));
        assert!(!state.ready(10, 41));
    }

    #[test]
    fn test_enqueue_reports_overflow() {
        let consumer = ConsumerInner::new(1, Duration::from_secs(1), JitterAlgorithm::Off, true);
        assert!(!consumer.enqueue(&video(0)));
        assert!(!consumer.enqueue(&video(500)));
        assert!(!consumer.enqueue(&video(1000)));
        assert_eq!(consumer.overflow_count(), 0);

        assert!(consumer.enqueue(&video(1600)));
        assert_eq!(consumer.overflow_count(), 1);
    }

    fn attached() -> (Arc<Source>, Consumer) {
        let source = Arc::new(Source::new(
            StreamKey::new("vhost", "live", "cam"),
            VhostConfig::default().jitter(JitterAlgorithm::Off),
        ));
        let consumer = source.create_consumer();
        (source, consumer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_message_count() {
        let (_source, consumer) = attached();
        let mut wait = task::spawn(consumer.wait(3, Duration::from_secs(10)));
        assert_pending!(wait.poll());

        consumer.inner.enqueue(&video(0));
        consumer.inner.enqueue(&video(40));
        assert!(!wait.is_woken());
        assert_pending!(wait.poll());

        consumer.inner.enqueue(&video(80));
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_duration() {
        let (_source, consumer) = attached();
        let mut wait = task::spawn(consumer.wait(100, Duration::from_millis(100)));
        assert_pending!(wait.poll());

        for ts in [0, 40, 80] {
            consumer.inner.enqueue(&video(ts));
        }
        assert!(!wait.is_woken());
        assert_pending!(wait.poll());

        consumer.inner.enqueue(&video(120));
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_does_not_time_out_by_itself() {
        let (_source, consumer) = attached();
        consumer.inner.enqueue(&video(0));

        // Only media satisfies the condition, never wall time
        let waited =
            tokio::time::timeout(Duration::from_secs(60), consumer.wait(2, Duration::from_millis(10)))
                .await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_at_once_when_ready() {
        let (_source, consumer) = attached();
        consumer.inner.enqueue(&video(0));
        consumer.inner.enqueue(&video(40));

        let mut wait = task::spawn(consumer.wait(2, Duration::from_secs(10)));
        assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_at_once_when_paused() {
        let (_source, consumer) = attached();
        consumer.pause();

        let mut wait = task::spawn(consumer.wait(1, Duration::from_secs(10)));
        assert_ready!(wait.poll());
        assert!(consumer.dump_packets(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_releases_pending_wait() {
        let (_source, consumer) = attached();
        let mut wait = task::spawn(consumer.wait(1, Duration::from_secs(10)));
        assert_pending!(wait.poll());

        consumer.pause();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakeup_releases_pending_wait() {
        let (_source, consumer) = attached();
        let mut wait = task::spawn(consumer.wait(1, Duration::from_secs(10)));
        assert_pending!(wait.poll());

        consumer.wakeup();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_enqueue_clears_satisfied_wait() {
        let consumer = inner(false);
        consumer.state.lock().wait = Some((2, 10_000));
        consumer.enqueue(&video(0));
        assert!(consumer.state.lock().wait.is_some());
        consumer.enqueue(&video(40));
        assert!(consumer.state.lock().wait.is_none());
    }
}
