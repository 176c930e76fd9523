//! Error taxonomy for the relay core.
//!
//! Each class maps to one handling policy: protocol errors skip a line,
//! transport errors feed the reconnect policy, routing errors reject a single
//! bus command, bus errors are retried and then dropped with a signal, and
//! configuration errors abort startup.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Malformed wire data. The offending line is logged and skipped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid UTF-8 at byte {valid_up_to}")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("malformed line: {0}")]
    Malformed(String),

    #[error("line contains a forbidden character {0:?}")]
    ForbiddenChar(char),

    #[error("line too long: {actual} bytes (limit {limit})")]
    LineTooLong { actual: usize, limit: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Connect/send/receive failure. Never fatal to the process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("connection closed")]
    Closed,

    #[error("control queue full")]
    Backlog,

    #[error("no reply to keepalive PING within {0:?}")]
    PingTimeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A bus command could not be delivered to an IRC connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("network {network:?} is not registered (state: {state})")]
    NotRegistered { network: String, state: String },

    #[error("connection for {0:?} closed while sending")]
    ConnectionClosed(String),

    #[error("undecodable command payload: {0}")]
    Malformed(String),
}

/// Publish/subscribe failure on the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("publish to {channel} dropped after {attempts} attempts")]
    Dropped { channel: String, attempts: u32 },
}

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
