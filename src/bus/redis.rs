//! Redis pub/sub backend.

use crate::app::router::Router;
use crate::bus::naming::command_channel;
use crate::bus::payload::OutboundCommand;
use crate::bus::publisher::Publisher;
use crate::error::{BusError, RoutingError};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Publishes over one multiplexed connection, reopened lazily after a
/// failure.
pub struct RedisPublisher {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisPublisher {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut slot = self.connection.lock().await;
        let mut con = match slot.take() {
            Some(con) => con,
            None => {
                debug!("Opening redis publish connection");
                self.client.get_multiplexed_async_connection().await?
            }
        };
        let receivers: i64 = con.publish(channel, payload).await?;
        debug!(channel, receivers, "Published to redis");
        *slot = Some(con);
        Ok(())
    }
}

/// Relay `{network}.cmd` to the router until `shutdown` fires, either for the
/// whole process or because the network was abandoned. The subscription is
/// re-established after `retry_delay` whenever it fails or drops.
pub async fn run_subscription(
    client: redis::Client,
    network: String,
    router: Router,
    retry_delay: Duration,
    shutdown: CancellationToken,
) {
    let channel = command_channel(&network);

    loop {
        let subscribed = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = subscribe(&client, &channel) => res,
        };

        match subscribed {
            Ok(mut pubsub) => {
                info!(channel = %channel, "Subscribed to command channel");
                let mut messages = std::pin::pin!(pubsub.on_message());
                loop {
                    let msg = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        msg = messages.next() => msg,
                    };
                    let Some(msg) = msg else {
                        warn!(channel = %channel, "Command subscription lost");
                        break;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Unreadable command payload");
                            router.stats().record_rejected();
                            continue;
                        }
                    };
                    // Awaiting here pauses this network's bus reads while
                    // its outbound queue is full.
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = deliver(&router, &network, &payload) => {}
                    }
                }
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Command subscription failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

async fn subscribe(client: &redis::Client, channel: &str) -> Result<redis::aio::PubSub, BusError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// Decode one command payload received on `subscribed`'s command channel
/// and route it. The payload's `network` field decides the target.
pub async fn deliver(router: &Router, subscribed: &str, payload: &str) -> Result<(), RoutingError> {
    let command = match OutboundCommand::decode(payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(network = %subscribed, error = %e, "Discarding undecodable command");
            router.stats().record_rejected();
            return Err(RoutingError::Malformed(e.to_string()));
        }
    };
    if command.network != subscribed {
        debug!(
            subscribed = %subscribed,
            target = %command.network,
            "Command names another network; routing by payload"
        );
    }
    router.dispatch(&command).await
}
