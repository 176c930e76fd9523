use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Process-wide relay counters, shared by the dispatcher, bus adapter and
/// subscriptions.
#[derive(Debug, Default)]
pub struct RelayStats {
    published: AtomicU64,
    publish_retries: AtomicU64,
    dropped: AtomicU64,
    commands_routed: AtomicU64,
    commands_rejected: AtomicU64,
    reconnects: AtomicU64,
    gave_up: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub published: u64,
    pub publish_retries: u64,
    pub dropped: u64,
    pub commands_routed: u64,
    pub commands_rejected: u64,
    pub reconnects: u64,
    pub gave_up: u64,
}

impl RelayStats {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self) {
        self.commands_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gave_up(&self) {
        self.gave_up.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            commands_routed: self.commands_routed.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            gave_up: self.gave_up.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            published = s.published,
            publish_retries = s.publish_retries,
            dropped = s.dropped,
            commands_routed = s.commands_routed,
            commands_rejected = s.commands_rejected,
            reconnects = s.reconnects,
            gave_up = s.gave_up,
            "Relay statistics"
        );
    }
}
