pub mod client;
pub mod forwarder;

use async_trait::async_trait;

use crate::gateway::OutboundMessage;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("connection lost: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("publish not flushed within {0:?}")]
    Timeout(std::time::Duration),
}

/// Outbound side of the bridge: one connection, one message at a time.
#[async_trait]
pub trait Publisher: Send {
    /// Whether a publish can be attempted right now.
    fn is_ready(&self) -> bool;

    /// Keep the connection alive while there is nothing to publish.
    /// Must be cancel safe.
    async fn maintain(&mut self);

    /// Publish one message and wait until the transport has taken it.
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PublishError>;

    /// Close the connection, flushing in-flight packets for a bounded time.
    async fn close(&mut self);
}
