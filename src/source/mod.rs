//! Stream distribution
//!
//! A [`Source`] takes media from one publisher and fans it out to any
//! number of [`Consumer`]s. Payloads are `Bytes`, so fan-out copies only
//! the small message envelope; each consumer rewrites its own timestamps.

pub mod consumer;
pub mod jitter;
pub mod mix_queue;
pub mod queue;
pub mod sink;
#[allow(clippy::module_inception)]
pub mod source;

pub use consumer::Consumer;
pub use jitter::{Jitter, JitterAlgorithm};
pub use mix_queue::MixQueue;
pub use queue::MessageQueue;
pub use sink::MediaSink;
pub use source::{PublishGuard, Source};
