//! Source registry
//!
//! Maps each stream to the one [`Source`](crate::source::Source) that
//! serves it. Publishers and players look sources up by key; a background
//! task sweeps sources nobody has used for a while.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SourceRegistry>
//!                   ┌──────────────────────────┐
//!                   │ sources: HashMap<        │
//!                   │   StreamKey,             │
//!                   │   Arc<Source>,           │
//!                   │ >                        │
//!                   └────────────┬─────────────┘
//!                                │ fetch_or_create
//!         ┌──────────────────────┼──────────────────────┐
//!         ▼                      ▼                      ▼
//!    [Publisher]             [Player]               [Player]
//!    acquire_publish()       create_consumer()      create_consumer()
//!    on_video() ──► enqueue ──► Consumer ──► dump_packets() ──► TCP
//! ```

pub mod config;
pub mod error;
pub mod key;
pub mod store;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use key::StreamKey;
pub use store::SourceRegistry;
