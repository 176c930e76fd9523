//! The single coordination point between connections and the bus.
//!
//! Events from every connection arrive on one queue. Each is applied to the
//! owning network's session first; the resulting transition is then
//! committed (route, control lines, publications, disconnect) in that order,
//! so nothing is published before the state it describes exists. Commits
//! never wait on a connection or on the bus.

use crate::app::event::{Event, NetworkEvent, Scope};
use crate::app::router::Router;
use crate::app::state::{Outbox, Pipeline};
use crate::app::stats::RelayStats;
use crate::bus::payload::Publication;
use crate::config::{AppConfig, CoreConfig};
use crate::irc::session::{NickPolicy, Notice, Session, Transition};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REGISTRATION_CHECK: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    pipelines: HashMap<String, Pipeline>,
    core: CoreConfig,
    policy: NickPolicy,
    events: mpsc::Receiver<NetworkEvent>,
    outbox: Outbox,
    stats: Arc<RelayStats>,
}

impl Dispatcher {
    pub fn new(
        config: &AppConfig,
        events: mpsc::Receiver<NetworkEvent>,
        publish: mpsc::Sender<Publication>,
        stats: Arc<RelayStats>,
        shutdown: &CancellationToken,
    ) -> (Self, Router) {
        let policy = NickPolicy::from(&config.core);
        let mut pipelines = HashMap::new();
        let mut routes = HashMap::new();
        for network in &config.networks {
            let session = Session::new(network, &policy);
            let (pipeline, route) =
                Pipeline::new(network.clone(), session, shutdown.child_token());
            pipelines.insert(network.name.clone(), pipeline);
            routes.insert(network.name.clone(), route);
        }
        let dispatcher = Self {
            pipelines,
            core: config.core.clone(),
            policy,
            events,
            outbox: Outbox::new(publish, stats.clone()),
            stats: stats.clone(),
        };
        (dispatcher, Router::new(routes, stats))
    }

    /// Run until every event sender is gone.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(REGISTRATION_CHECK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = ticker.tick() => self.check_registration(Instant::now()),
            }
        }
        info!("Dispatcher stopped");
    }

    /// Token cancelled when `network` is abandoned.
    pub fn teardown(&self, network: &str) -> Option<CancellationToken> {
        self.pipelines.get(network).map(|p| p.teardown.clone())
    }

    fn handle_event(&mut self, event: NetworkEvent) {
        let NetworkEvent {
            network,
            connection,
            event,
        } = event;
        let Some(pipeline) = self.pipelines.get_mut(&network) else {
            warn!(network = %network, "Event for unconfigured network");
            return;
        };

        match &event {
            Event::Reconnecting { attempt, delay } => {
                self.stats.record_reconnect();
                let notice = Notice::bare(
                    Scope::Server,
                    "reconnecting",
                    vec![attempt.to_string(), delay.as_millis().to_string()],
                );
                pipeline.commit(announce(notice), &self.outbox);
                return;
            }
            Event::GaveUp { attempts } => {
                self.stats.record_gave_up();
                error!(network = %network, attempts, "Network abandoned after reconnect attempts ran out");
                let notice = Notice::bare(Scope::Server, "gave_up", vec![attempts.to_string()]);
                pipeline.commit(announce(notice), &self.outbox);
                pipeline.teardown.cancel();
                return;
            }
            Event::Connected(handle) => {
                debug!(network = %network, connection, "New session");
                pipeline.session = Session::new(&pipeline.config, &self.policy);
                pipeline.connection = Some(handle.clone());
            }
            _ => {
                let live = pipeline.connection.as_ref().map(|c| c.id);
                if live != Some(connection) {
                    debug!(network = %network, connection, ?live, "Ignoring event from stale connection");
                    return;
                }
            }
        }

        let event = match event {
            Event::Line(line) => pipeline.session.classify(line),
            other => other,
        };
        let transition = pipeline.session.handle(&event, Instant::now());

        match &event {
            Event::Disconnected { reason } => {
                info!(network = %network, reason = %reason, "Session ended");
                pipeline.connection = None;
            }
            Event::JoinAck { channel, .. } => info!(network = %network, channel = %channel, "Joined"),
            Event::PartAck { channel, .. } => info!(network = %network, channel = %channel, "Left"),
            Event::Error(reason) => debug!(network = %network, reason = %reason, "Protocol error"),
            _ => {}
        }

        pipeline.commit(transition, &self.outbox);
    }

    fn check_registration(&mut self, now: Instant) {
        let timeout = self.core.registration_timeout();
        for pipeline in self.pipelines.values_mut() {
            if pipeline.session.registration_expired(now, timeout) {
                warn!(
                    network = %pipeline.config.name,
                    timeout_secs = timeout.as_secs(),
                    "Registration timed out"
                );
                let transition = pipeline.session.fail("registration timed out");
                pipeline.commit(transition, &self.outbox);
            }
        }
    }
}

fn announce(notice: Notice) -> Transition {
    Transition {
        notices: vec![notice],
        ..Transition::default()
    }
}
