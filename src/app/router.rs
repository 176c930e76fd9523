//! Routes bus commands to IRC connections.

use crate::app::state::RouteState;
use crate::app::stats::RelayStats;
use crate::bus::payload::OutboundCommand;
use crate::error::RoutingError;
use crate::irc::session::Registration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Read-only view of every network's route, cloned into each subscription.
///
/// The dispatcher is the only writer; a command is forwarded only while its
/// network is Registered. Forwarding awaits space in the connection's
/// bounded queue, so a slow server pauses the caller.
#[derive(Clone)]
pub struct Router {
    routes: Arc<HashMap<String, watch::Receiver<RouteState>>>,
    stats: Arc<RelayStats>,
}

impl Router {
    pub fn new(routes: HashMap<String, watch::Receiver<RouteState>>, stats: Arc<RelayStats>) -> Self {
        Self {
            routes: Arc::new(routes),
            stats,
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub async fn dispatch(&self, command: &OutboundCommand) -> Result<(), RoutingError> {
        let result = self.forward(command).await;
        match &result {
            Ok(()) => {
                debug!(network = %command.network, line = %command.line, "Command forwarded");
                self.stats.record_routed();
            }
            Err(e) => {
                warn!(network = %command.network, error = %e, "Command rejected");
                self.stats.record_rejected();
            }
        }
        result
    }

    async fn forward(&self, command: &OutboundCommand) -> Result<(), RoutingError> {
        let route = self
            .routes
            .get(&command.network)
            .ok_or_else(|| RoutingError::UnknownNetwork(command.network.clone()))?;

        let handle = {
            let current = route.borrow();
            match (&current.connection, current.state) {
                (Some(handle), Registration::Registered) => handle.clone(),
                (_, state) => {
                    return Err(RoutingError::NotRegistered {
                        network: command.network.clone(),
                        state: state.to_string(),
                    })
                }
            }
        };

        handle
            .send(command.line.clone())
            .await
            .map_err(|_| RoutingError::ConnectionClosed(command.network.clone()))
    }
}
