//! Media handling
//!
//! - FLV payload classification (codecs, key frames, sequence headers)
//! - Aggregate message splitting
//! - GOP caching for late joiners

pub mod flv;
pub mod gop;

pub use flv::{FlvTag, FlvTagType};
pub use gop::GopCache;
