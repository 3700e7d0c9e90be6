use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the receiver and the forwarder.
#[derive(Debug, Default)]
pub struct BridgeStats {
    datagrams_received: AtomicU64,
    receive_errors: AtomicU64,
    datagrams_malformed: AtomicU64,
    messages_enqueued: AtomicU64,
    messages_dropped: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl BridgeStats {
    #[inline]
    pub fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn datagram_malformed(&self) {
        self.datagrams_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of dropped messages so far.
    #[inline]
    pub fn message_dropped(&self) -> u64 {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            datagrams_malformed: self.datagrams_malformed.load(Ordering::Relaxed),
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub datagrams_received: u64,
    pub receive_errors: u64,
    pub datagrams_malformed: u64,
    pub messages_enqueued: u64,
    pub messages_dropped: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
}
