//! Hooks for forwarding a live stream elsewhere
//!
//! Recorders, HLS segmenters and relays attach to a [`Source`] as sinks.
//! They are called after the source lock is released, so a sink may do
//! real work, but it runs on the publisher's task and should not block.
//!
//! [`Source`]: super::Source

use crate::error::Result;
use crate::protocol::message::SharedMessage;
use crate::protocol::request::Request;

pub trait MediaSink: Send + Sync {
    fn on_publish(&self, _request: &Request) -> Result<()> {
        Ok(())
    }

    fn on_unpublish(&self) {}

    fn on_metadata(&self, _msg: &SharedMessage) -> Result<()> {
        Ok(())
    }

    fn on_audio(&self, _msg: &SharedMessage) -> Result<()> {
        Ok(())
    }

    fn on_video(&self, _msg: &SharedMessage) -> Result<()> {
        Ok(())
    }
}
