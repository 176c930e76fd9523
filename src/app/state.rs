//! Per-network pipeline state owned by the dispatcher.

use crate::app::stats::RelayStats;
use crate::bus::payload::Publication;
use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::irc::connection::ConnectionHandle;
use crate::irc::session::{Registration, Session, Transition};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What the command router may see of a network.
#[derive(Debug, Clone)]
pub struct RouteState {
    pub state: Registration,
    pub connection: Option<ConnectionHandle>,
}

impl Default for RouteState {
    fn default() -> Self {
        Self {
            state: Registration::Unregistered,
            connection: None,
        }
    }
}

/// Hands publications to the bus adapter without ever waiting on it.
///
/// A full queue means the bus is stalled; the event is dropped, logged at
/// error level and counted.
#[derive(Clone)]
pub struct Outbox {
    publish: mpsc::Sender<Publication>,
    stats: Arc<RelayStats>,
}

impl Outbox {
    pub fn new(publish: mpsc::Sender<Publication>, stats: Arc<RelayStats>) -> Self {
        Self { publish, stats }
    }

    pub fn offer(&self, publication: Publication) {
        match self.publish.try_send(publication) {
            Ok(()) => {}
            Err(TrySendError::Full(p)) => {
                error!(channel = %p.channel, "Publish queue full; event dropped");
                self.stats.record_dropped();
            }
            Err(TrySendError::Closed(p)) => {
                warn!(channel = %p.channel, "Publisher stopped; event dropped");
                self.stats.record_dropped();
            }
        }
    }
}

pub struct Pipeline {
    pub config: NetworkConfig,
    pub session: Session,
    /// The live connection, if any. At most one per network.
    pub connection: Option<ConnectionHandle>,
    /// Cancelled once the network is abandoned; stops its bus subscription.
    pub teardown: CancellationToken,
    route: watch::Sender<RouteState>,
}

impl Pipeline {
    pub fn new(
        config: NetworkConfig,
        session: Session,
        teardown: CancellationToken,
    ) -> (Self, watch::Receiver<RouteState>) {
        let (route, rx) = watch::channel(RouteState::default());
        let pipeline = Self {
            config,
            session,
            connection: None,
            teardown,
            route,
        };
        (pipeline, rx)
    }

    /// Apply a transition whose state change the session has already made:
    /// expose the new state to the router, queue the session's lines, then
    /// publish, then honour any disconnect request. Never waits.
    pub fn commit(&mut self, transition: Transition, outbox: &Outbox) {
        let state = self.session.state();
        self.route.send_replace(RouteState {
            state,
            connection: self.connection.clone(),
        });

        if let Some(handle) = &self.connection {
            for line in transition.send {
                match handle.try_send_control(line) {
                    Ok(()) => {}
                    Err(TransportError::Backlog) => {
                        warn!(network = %self.config.name, "Control lane overflowed; dropping connection");
                        handle.disconnect("control queue overflow");
                        break;
                    }
                    Err(_) => {
                        debug!(network = %self.config.name, "Connection closed before control line was queued");
                        break;
                    }
                }
            }
        }

        let now = Utc::now();
        for notice in &transition.notices {
            outbox.offer(Publication::new(&self.config.name, notice, state, now));
        }

        if let (Some(reason), Some(handle)) = (transition.disconnect, &self.connection) {
            handle.disconnect(&reason);
        }
    }
}
