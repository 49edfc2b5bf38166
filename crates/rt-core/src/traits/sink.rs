//! Outbound frame sink

use async_trait::async_trait;
use rt_protocol::Message;

use crate::error::LinkError;

/// Something that delivers frames to the relay
///
/// The relay link implements this; tests substitute an in-memory channel.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one frame
    ///
    /// Fails with [`LinkError::NotConnected`] while no relay connection is up.
    async fn send(&self, message: Message) -> Result<(), LinkError>;
}
