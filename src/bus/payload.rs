use crate::bus::naming::event_channel;
use crate::error::BusError;
use crate::irc::session::{Notice, Registration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON body of every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub network: String,
    pub channel: Option<String>,
    pub kind: String,
    pub nick: Option<String>,
    /// Full source prefix (`nick!user@host` or a server name).
    pub prefix: Option<String>,
    pub raw: Option<String>,
    pub command: Option<String>,
    pub params: Vec<String>,
    /// The inbound line was cut at the length limit.
    pub truncated: bool,
    pub timestamp: DateTime<Utc>,
    /// Registration state after the transition was applied.
    pub state: Registration,
}

/// JSON body received on `{network}.cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub network: String,
    /// Sent verbatim; the terminator is added by the codec.
    pub line: String,
}

impl OutboundCommand {
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// An event ready for the bus: target channel plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub channel: String,
    pub payload: EventPayload,
}

impl Publication {
    pub fn new(
        network: &str,
        notice: &Notice,
        state: Registration,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (nick, prefix, raw, command, params, truncated) = match &notice.line {
            Some(line) => (
                line.source_nick().map(str::to_string),
                line.prefix.clone(),
                Some(line.raw.clone()),
                Some(line.command.clone()),
                line.params.clone(),
                line.truncated,
            ),
            None => (None, None, None, None, notice.detail.clone(), false),
        };
        Self {
            channel: event_channel(network, &notice.scope, &notice.kind),
            payload: EventPayload {
                network: network.to_string(),
                channel: notice.scope.channel_name().map(str::to_string),
                kind: notice.kind.clone(),
                nick,
                prefix,
                raw,
                command,
                params,
                truncated,
                timestamp,
                state,
            },
        }
    }

    pub fn encode(&self) -> Result<String, BusError> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}
