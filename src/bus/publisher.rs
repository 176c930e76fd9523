//! Publishing side of the bus adapter.
//!
//! Delivery is at-least-once: a failed publish is retried with the same
//! payload until it succeeds or the retry budget runs out. Each attempt is
//! bounded by the publish timeout. An exhausted budget is logged at error
//! level and counted; it never passes silently.

use crate::app::stats::RelayStats;
use crate::bus::payload::Publication;
use crate::config::BusConfig;
use crate::error::BusError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;
}

pub struct BusAdapter<P> {
    publisher: P,
    retries: u32,
    retry_delay: Duration,
    timeout: Duration,
    stats: Arc<RelayStats>,
}

impl<P: Publisher> BusAdapter<P> {
    pub fn new(publisher: P, config: &BusConfig, stats: Arc<RelayStats>) -> Self {
        Self {
            publisher,
            retries: config.publish_retries,
            retry_delay: config.retry_delay(),
            timeout: config.publish_timeout(),
            stats,
        }
    }

    /// Publish one event, retrying up to the budget. Returns the number of
    /// attempts it took.
    pub async fn publish(&self, publication: &Publication) -> Result<u32, BusError> {
        let payload = match publication.encode() {
            Ok(p) => p,
            Err(e) => {
                error!(channel = %publication.channel, error = %e, "Dropping unencodable event");
                self.stats.record_dropped();
                return Err(e);
            }
        };

        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            let sent = tokio::time::timeout(
                self.timeout,
                self.publisher.publish(&publication.channel, &payload),
            )
            .await
            .unwrap_or(Err(BusError::Timeout(self.timeout)));
            match sent {
                Ok(()) => {
                    debug!(channel = %publication.channel, attempt, "Published");
                    self.stats.record_published();
                    return Ok(attempt);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        channel = %publication.channel,
                        attempt,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        channel = %publication.channel,
                        attempts,
                        error = %e,
                        payload = %payload,
                        "Event dropped after exhausting publish retries"
                    );
                }
            }
        }

        self.stats.record_dropped();
        Err(BusError::Dropped {
            channel: publication.channel.clone(),
            attempts,
        })
    }

    /// Publish everything received on `rx`, in order, until the sender side
    /// closes. Queued events are drained before returning.
    pub async fn run(self, mut rx: mpsc::Receiver<Publication>) {
        while let Some(publication) = rx.recv().await {
            let _ = self.publish(&publication).await;
        }
        debug!("Publisher drained");
    }
}
