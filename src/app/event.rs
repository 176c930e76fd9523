use crate::irc::codec::Line;
use crate::irc::connection::ConnectionHandle;
use std::time::Duration;

/// Generation counter of a network's connections; bumped on every attempt.
pub type ConnectionId = u64;

/// An [`Event`] tagged with the network and connection it came from.
#[derive(Debug)]
pub struct NetworkEvent {
    pub network: String,
    pub connection: ConnectionId,
    pub event: Event,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Transport is up; the handle carries the outbound queues.
    Connected(ConnectionHandle),
    Disconnected {
        reason: String,
    },
    /// A parsed protocol line.
    Line(Line),
    /// Server echo of our own JOIN.
    JoinAck {
        channel: String,
        line: Line,
    },
    /// Server echo of our own PART, or a KICK of our nick.
    PartAck {
        channel: String,
        line: Line,
    },
    /// A line that failed to decode; it is skipped.
    Error(String),

    /// Reconnect scheduled after `delay`.
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnect attempts exhausted; the network stays down.
    GaveUp {
        attempts: u32,
    },
}

/// Where a published event belongs: an IRC channel, a private message to
/// the bot, or the network as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Lower-cased channel name.
    Channel(String),
    Private,
    Server,
}

impl Scope {
    pub fn channel(name: &str) -> Self {
        Scope::Channel(name.to_ascii_lowercase())
    }

    pub fn channel_name(&self) -> Option<&str> {
        match self {
            Scope::Channel(name) => Some(name),
            _ => None,
        }
    }
}

/// True if `target` names a channel rather than a nick.
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}
