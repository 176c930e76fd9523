//! Connection manager: one supervisor task per configured network.
//!
//! A supervisor owns at most one live connection at a time. It connects,
//! drives the connection until it ends, reports `Disconnected`, then waits
//! out the backoff delay and starts over with a fresh connection id. Only a
//! connection that got as far as the server welcome resets the backoff.

use crate::app::event::{ConnectionId, Event, NetworkEvent};
use crate::config::{CoreConfig, NetworkConfig};
use crate::irc::backoff::Backoff;
use crate::irc::{connection, transport};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ConnectionManager {
    supervisors: HashMap<String, JoinHandle<()>>,
    events: mpsc::Sender<NetworkEvent>,
    core: CoreConfig,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        events: mpsc::Sender<NetworkEvent>,
        core: CoreConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            supervisors: HashMap::new(),
            events,
            core,
            shutdown,
        }
    }

    /// Start supervising `config`. A network that already has a running
    /// supervisor is left alone; returns whether a new one was started.
    pub fn connect(&mut self, config: NetworkConfig) -> bool {
        if let Some(running) = self.supervisors.get(&config.name) {
            if !running.is_finished() {
                warn!(network = %config.name, "Network already connected");
                return false;
            }
        }
        let name = config.name.clone();
        let task = tokio::spawn(supervise(
            config,
            self.core.clone(),
            self.events.clone(),
            self.shutdown.clone(),
        ));
        self.supervisors.insert(name, task);
        true
    }

    /// Wait for every supervisor to exit. Call after cancelling `shutdown`.
    pub async fn join(self) {
        drop(self.events);
        for (name, task) in self.supervisors {
            if let Err(e) = task.await {
                error!(network = %name, error = %e, "Supervisor task failed");
            }
        }
    }
}

async fn supervise(
    config: NetworkConfig,
    core: CoreConfig,
    events: mpsc::Sender<NetworkEvent>,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::new(config.backoff_base(), config.backoff_cap());
    let mut generation: ConnectionId = 0;
    let mut failures: u32 = 0;
    let settings = connection::Settings::new(&core, &config);

    loop {
        generation += 1;
        info!(network = %config.name, addr = %config.address(), tls = config.tls, "Connecting");

        let attempt = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = transport::connect(&config, core.connect_timeout()) => res,
        };

        match attempt {
            Ok(stream) => {
                let outcome =
                    connection::run(&config, generation, stream, &settings, &events, &shutdown)
                        .await;
                info!(
                    network = %config.name,
                    reason = %outcome.reason,
                    registered = outcome.registered,
                    "Disconnected"
                );

                if outcome.registered {
                    backoff.reset();
                    failures = 0;
                } else {
                    failures += 1;
                }
                let reason = outcome.reason;

                let disconnected = NetworkEvent {
                    network: config.name.clone(),
                    connection: generation,
                    event: Event::Disconnected { reason },
                };
                if events.send(disconnected).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(network = %config.name, error = %e, "Connection attempt failed");
                failures += 1;
            }
        }

        if shutdown.is_cancelled() {
            break;
        }

        if config.max_reconnect_attempts > 0 && failures >= config.max_reconnect_attempts {
            error!(
                network = %config.name,
                attempts = failures,
                "Giving up on network after repeated failures"
            );
            let _ = events
                .send(NetworkEvent {
                    network: config.name.clone(),
                    connection: generation,
                    event: Event::GaveUp { attempts: failures },
                })
                .await;
            break;
        }

        let delay = backoff.next_delay();
        info!(
            network = %config.name,
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );
        let reconnecting = NetworkEvent {
            network: config.name.clone(),
            connection: generation,
            event: Event::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            },
        };
        if events.send(reconnecting).await.is_err() {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn test_config(port: u16, max_attempts: u32) -> (NetworkConfig, CoreConfig) {
        let toml = format!(
            r##"
[core]
registration_timeout_secs = 60

[[networks]]
name = "mock"
host = "127.0.0.1"
port = {}
nickname = "tenyks"
channels = ["#tenyks"]
backoff_base_ms = 10
backoff_cap_ms = 20
max_reconnect_attempts = {}
"##,
            port, max_attempts
        );
        let mut cfg = parse_config(&toml).unwrap();
        (cfg.networks.remove(0), cfg.core)
    }

    async fn next_event(rx: &mut mpsc::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_read_write_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (net, core) = test_config(port, 0);
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let mut manager = ConnectionManager::new(tx, core, shutdown.clone());
        assert!(manager.connect(net.clone()));
        assert!(!manager.connect(net.clone()), "second supervisor for the same network");

        let (sock, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = sock.into_split();
        let mut server_lines = BufReader::new(read_half).lines();

        let first = next_event(&mut rx).await;
        assert_eq!(first.connection, 1);
        let handle = match first.event {
            Event::Connected(handle) => handle,
            other => panic!("expected Connected, got {:?}", other),
        };

        write_half
            .write_all(b":mock.server 001 tenyks :Welcome\r\n")
            .await
            .unwrap();
        match next_event(&mut rx).await.event {
            Event::Line(line) => assert_eq!(line.command, "001"),
            other => panic!("expected Line, got {:?}", other),
        }

        handle.try_send_control("NICK tenyks".to_string()).unwrap();
        handle.send("PRIVMSG #tenyks :hi".to_string()).await.unwrap();
        assert_eq!(server_lines.next_line().await.unwrap().unwrap(), "NICK tenyks");
        assert_eq!(
            server_lines.next_line().await.unwrap().unwrap(),
            "PRIVMSG #tenyks :hi"
        );

        // Server hangs up: Disconnected, then a scheduled reconnect.
        drop(write_half);
        drop(server_lines);
        match next_event(&mut rx).await.event {
            Event::Disconnected { .. } => {}
            other => panic!("expected Disconnected, got {:?}", other),
        }
        match next_event(&mut rx).await.event {
            Event::Reconnecting { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("expected Reconnecting, got {:?}", other),
        }

        let (_sock2, _) = listener.accept().await.unwrap();
        let again = next_event(&mut rx).await;
        assert_eq!(again.connection, 2);
        assert!(matches!(again.event, Event::Connected(_)));

        shutdown.cancel();
        manager.join().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (net, core) = test_config(port, 2);
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let mut manager = ConnectionManager::new(tx, core, shutdown);
        manager.connect(net);

        assert!(matches!(
            next_event(&mut rx).await.event,
            Event::Reconnecting { attempt: 1, .. }
        ));
        assert!(matches!(
            next_event(&mut rx).await.event,
            Event::GaveUp { attempts: 2 }
        ));
        manager.join().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unwelcoming_server_counts_toward_give_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (net, core) = test_config(port, 2);
        let (tx, mut rx) = mpsc::channel(16);
        let mut manager = ConnectionManager::new(tx, core, CancellationToken::new());
        manager.connect(net);

        // Accepts every connection and hangs up without ever sending 001.
        let server = tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                drop(sock);
            }
        });

        assert!(matches!(next_event(&mut rx).await.event, Event::Connected(_)));
        assert!(matches!(next_event(&mut rx).await.event, Event::Disconnected { .. }));
        assert!(matches!(
            next_event(&mut rx).await.event,
            Event::Reconnecting { attempt: 1, .. }
        ));
        assert!(matches!(next_event(&mut rx).await.event, Event::Connected(_)));
        assert!(matches!(next_event(&mut rx).await.event, Event::Disconnected { .. }));
        assert!(matches!(
            next_event(&mut rx).await.event,
            Event::GaveUp { attempts: 2 }
        ));

        manager.join().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_shutdown_sends_quit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (net, core) = test_config(port, 0);
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let mut manager = ConnectionManager::new(tx, core, shutdown.clone());
        manager.connect(net);

        let (sock, _) = listener.accept().await.unwrap();
        let mut server_lines = BufReader::new(sock).lines();
        assert!(matches!(next_event(&mut rx).await.event, Event::Connected(_)));

        shutdown.cancel();
        assert_eq!(
            server_lines.next_line().await.unwrap().unwrap(),
            "QUIT :tenyks"
        );
        match next_event(&mut rx).await.event {
            Event::Disconnected { reason } => assert_eq!(reason, "shutdown"),
            other => panic!("expected Disconnected, got {:?}", other),
        }
        manager.join().await;
    }
}
