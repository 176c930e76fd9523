//! One live IRC connection: outbound queues, writer task and read loop.
//!
//! Server PINGs are answered here, ahead of the dispatcher, so keepalive
//! never waits on the bus. The connection also checks on an idle server with
//! its own PING and gives up when nothing comes back.

use crate::app::event::{ConnectionId, Event, NetworkEvent};
use crate::config::{CoreConfig, NetworkConfig};
use crate::error::{ProtocolError, TransportError};
use crate::irc::codec::{LineCodec, DEFAULT_MAX_LINE};
use crate::irc::transport::IrcStream;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the session's own lane (registration, JOIN, PONG).
const CONTROL_LANE: usize = 64;

/// Upper bound on flushing QUIT during a graceful disconnect.
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// Token carried by keepalive PINGs.
const KEEPALIVE_TOKEN: &str = "tenyks";

type LineSink = SplitSink<Framed<IrcStream, LineCodec>, String>;

/// Outbound rate for plugin lines.
#[derive(Debug, Clone, Copy)]
pub struct FloodPolicy {
    pub burst: NonZeroU32,
    pub interval: Duration,
}

impl FloodPolicy {
    fn limiter(&self) -> Option<DefaultDirectRateLimiter> {
        let quota = Quota::with_period(self.interval)?.allow_burst(self.burst);
        Some(RateLimiter::direct(quota))
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct Settings {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub flood: Option<FloodPolicy>,
}

impl Settings {
    pub fn new(core: &CoreConfig, network: &NetworkConfig) -> Self {
        let flood = match (network.flood_protection, NonZeroU32::new(network.flood_burst)) {
            (true, Some(burst)) => Some(FloodPolicy {
                burst,
                interval: network.flood_interval(),
            }),
            _ => None,
        };
        Self {
            queue_capacity: core.max_outbound_queue,
            ping_interval: core.ping_interval(),
            ping_timeout: core.ping_timeout(),
            flood,
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reason: String,
    /// The server welcomed us (001) at some point.
    pub registered: bool,
}

/// Cloneable handle to a live connection's outbound side.
///
/// Both lanes are bounded FIFOs; the writer drains the control lane first.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    outbound: mpsc::Sender<String>,
    control: mpsc::Sender<String>,
    close: mpsc::Sender<String>,
}

impl ConnectionHandle {
    /// Enqueue a line for writing. Suspends while the queue is full.
    pub async fn send(&self, line: String) -> Result<(), TransportError> {
        self.outbound
            .send(line)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Enqueue a line generated by the core itself. Never waits.
    pub fn try_send_control(&self, line: String) -> Result<(), TransportError> {
        self.control.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backlog,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Ask the connection to send QUIT with `reason` and close.
    pub fn disconnect(&self, reason: &str) {
        let _ = self.close.try_send(reason.to_string());
    }
}

/// Receiving ends of a connection's queues.
pub struct Lanes {
    pub(crate) outbound: mpsc::Receiver<String>,
    pub(crate) control: mpsc::Receiver<String>,
    pub(crate) close: mpsc::Receiver<String>,
}

pub fn channel(id: ConnectionId, capacity: usize) -> (ConnectionHandle, Lanes) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
    let (control_tx, control_rx) = mpsc::channel(CONTROL_LANE);
    let (close_tx, close_rx) = mpsc::channel(1);
    let handle = ConnectionHandle {
        id,
        outbound: outbound_tx,
        control: control_tx,
        close: close_tx,
    };
    let lanes = Lanes {
        outbound: outbound_rx,
        control: control_rx,
        close: close_rx,
    };
    (handle, lanes)
}

/// Drive an established connection until it ends.
///
/// Emits `Connected` first, then one `Line`/`Error` per decoded line, in
/// wire order. PING and PONG are consumed here. The caller emits
/// `Disconnected`.
pub async fn run(
    config: &NetworkConfig,
    id: ConnectionId,
    stream: IrcStream,
    settings: &Settings,
    events: &mpsc::Sender<NetworkEvent>,
    shutdown: &CancellationToken,
) -> Outcome {
    let (handle, lanes) = channel(id, settings.queue_capacity);
    let Lanes {
        outbound,
        control,
        mut close,
    } = lanes;

    let emit = |event: Event| NetworkEvent {
        network: config.name.clone(),
        connection: id,
        event,
    };
    let mut registered = false;
    let ended = |reason: String, registered: bool| Outcome { reason, registered };

    if events.send(emit(Event::Connected(handle.clone()))).await.is_err() {
        return ended("dispatcher stopped".to_string(), false);
    }

    let (sink, mut lines) = Framed::new(stream, LineCodec::new()).split();
    let stop = CancellationToken::new();
    let limiter = settings.flood.and_then(|f| f.limiter());
    let mut writer = tokio::spawn(write_loop(sink, control, outbound, limiter, stop.clone()));

    let idle = tokio::time::sleep(settings.ping_interval);
    tokio::pin!(idle);
    let mut awaiting_pong = false;

    let mut quit = None;
    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                quit = Some(config.quit_message.clone());
                break "shutdown".to_string();
            }
            Some(reason) = close.recv() => {
                quit = Some(reason.clone());
                break reason;
            }
            res = &mut writer => {
                let reason = match res {
                    Ok((_, Err(e))) => format!("write failed: {}", e),
                    Ok((_, Ok(()))) => "writer stopped".to_string(),
                    Err(e) => format!("writer task failed: {}", e),
                };
                return ended(reason, registered);
            }
            _ = &mut idle => {
                if awaiting_pong {
                    break TransportError::PingTimeout(settings.ping_timeout).to_string();
                }
                debug!(network = %config.name, "Connection idle, sending keepalive PING");
                queue_control(&handle, format!("PING :{}", KEEPALIVE_TOKEN), &config.name);
                awaiting_pong = true;
                idle.as_mut().reset(Instant::now() + settings.ping_timeout);
            }
            item = lines.next() => match item {
                Some(Ok(Ok(line))) => {
                    awaiting_pong = false;
                    idle.as_mut().reset(Instant::now() + settings.ping_interval);

                    if line.truncated {
                        warn!(
                            network = %config.name,
                            limit = DEFAULT_MAX_LINE,
                            raw = %line.raw,
                            "Inbound line exceeded the length limit and was truncated"
                        );
                    }
                    match line.command.as_str() {
                        "PING" => {
                            let token = line.params.first().map(String::as_str).unwrap_or("");
                            queue_control(&handle, format!("PONG :{}", token), &config.name);
                            continue;
                        }
                        "PONG" => continue,
                        "001" => registered = true,
                        _ => {}
                    }
                    if events.send(emit(Event::Line(line))).await.is_err() {
                        break "dispatcher stopped".to_string();
                    }
                }
                Some(Ok(Err(e))) => {
                    warn!(network = %config.name, error = %e, "Skipping malformed line");
                    if events.send(emit(Event::Error(e.to_string()))).await.is_err() {
                        break "dispatcher stopped".to_string();
                    }
                }
                Some(Err(e)) => break format!("read failed: {}", e),
                None => break "connection closed by server".to_string(),
            },
        }
    };

    stop.cancel();
    if let Ok((mut sink, _)) = writer.await {
        if let Some(message) = quit {
            let flush = async {
                sink.send(format!("QUIT :{}", message)).await?;
                sink.close().await
            };
            if let Err(e) = tokio::time::timeout(QUIT_GRACE, flush)
                .await
                .unwrap_or(Ok(()))
            {
                debug!(network = %config.name, error = %e, "QUIT not delivered");
            }
        }
    }
    ended(reason, registered)
}

fn queue_control(handle: &ConnectionHandle, line: String, network: &str) {
    if let Err(e) = handle.try_send_control(line) {
        warn!(network = %network, error = %e, "Control line not queued");
    }
}

async fn write_loop(
    mut sink: LineSink,
    mut control: mpsc::Receiver<String>,
    mut outbound: mpsc::Receiver<String>,
    limiter: Option<DefaultDirectRateLimiter>,
    stop: CancellationToken,
) -> (LineSink, Result<(), TransportError>) {
    // Plugin line held back by the rate limiter.
    let mut pending: Option<String> = None;
    loop {
        let line = tokio::select! {
            biased;
            _ = stop.cancelled() => return (sink, Ok(())),
            Some(line) = control.recv() => line,
            _ = next_turn(limiter.as_ref()), if pending.is_some() => match pending.take() {
                Some(line) => line,
                None => continue,
            },
            Some(line) = outbound.recv(), if pending.is_none() => {
                pending = Some(line);
                continue;
            }
            else => return (sink, Ok(())),
        };
        match sink.send(line).await {
            Ok(()) => {}
            Err(ProtocolError::Io(e)) => return (sink, Err(TransportError::Io(e))),
            Err(e) => warn!(error = %e, "Rejected outbound line"),
        }
    }
}

async fn next_turn(limiter: Option<&DefaultDirectRateLimiter>) {
    if let Some(limiter) = limiter {
        limiter.until_ready().await;
    }
}
