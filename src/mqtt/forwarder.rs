use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::OutboundMessage;
use crate::stats::BridgeStats;

use super::Publisher;

/// Drains the outbound queue into a single publisher, in arrival order.
pub struct Forwarder<P> {
    publisher: P,
    stats: Arc<BridgeStats>,
    drain_timeout: Duration,
}

impl<P: Publisher> Forwarder<P> {
    pub fn new(publisher: P, stats: Arc<BridgeStats>, drain_timeout: Duration) -> Self {
        Self {
            publisher,
            stats,
            drain_timeout,
        }
    }

    /// Run until cancelled or until every sender is gone, then drain what is
    /// left in the queue and close the publisher.
    ///
    /// Messages are only taken off the queue while the publisher is ready, so
    /// they stay buffered across a reconnect.
    pub async fn run(mut self, mut rx: mpsc::Receiver<OutboundMessage>, cancel: CancellationToken) {
        loop {
            let ready = self.publisher.is_ready();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Forwarder stopping");
                    break;
                }
                message = rx.recv(), if ready => {
                    match message {
                        Some(message) => self.forward(message).await,
                        None => {
                            info!("Outbound queue closed");
                            break;
                        }
                    }
                }
                _ = self.publisher.maintain() => {}
            }
        }

        rx.close();
        self.drain(&mut rx).await;
        self.publisher.close().await;
    }

    async fn forward(&mut self, message: OutboundMessage) {
        debug!("Publishing {}: {}", message.topic, message.payload);
        match self.publisher.publish(&message).await {
            Ok(()) => self.stats.message_published(),
            Err(e) => {
                self.stats.publish_failed();
                warn!("Failed to publish {}: {}", message.topic, e);
            }
        }
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<OutboundMessage>) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        let mut flushed = 0usize;

        loop {
            let message = match rx.try_recv() {
                Ok(message) => message,
                Err(_) => break,
            };
            if !self.publisher.is_ready() {
                let dropped = 1 + count_remaining(rx);
                warn!("Publisher not connected, discarding {} queued messages", dropped);
                return;
            }
            match tokio::time::timeout_at(deadline, self.forward(message)).await {
                Ok(()) => flushed += 1,
                Err(_) => {
                    let dropped = count_remaining(rx);
                    warn!(
                        "Drain timed out after {:?}, discarding {} queued messages",
                        self.drain_timeout, dropped
                    );
                    return;
                }
            }
        }

        if flushed > 0 {
            info!("Flushed {} queued messages", flushed);
        }
    }
}

fn count_remaining(rx: &mut mpsc::Receiver<OutboundMessage>) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}
