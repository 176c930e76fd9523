//! Configuration data model.
//!
//! All structs derive `Serialize`/`Deserialize` for TOML. Tunables have
//! defaults; identity fields (network name, host, nickname) are required.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

/// Pub/sub bus endpoint and publish retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Bound on a single publish attempt, connect included.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            publish_retries: default_publish_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl BusConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Process-wide relay tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_max_outbound_queue")]
    pub max_outbound_queue: usize,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_nick_retries")]
    pub max_nick_retries: u32,
    #[serde(default = "default_nick_suffix")]
    pub nick_suffix: String,
    /// Idle time on a connection before the client sends its own PING.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// How long to wait for any reply to that PING before dropping.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_outbound_queue: default_max_outbound_queue(),
            registration_timeout_secs: default_registration_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_nick_retries: default_max_nick_retries(),
            nick_suffix: default_nick_suffix(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }
}

impl CoreConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

/// Diagnostic log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Configuration for a single IRC network. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Label used in bus channel names (e.g. `"freenode"`).
    pub name: String,
    /// Hostname or IP address of the IRC server.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub nickname: String,
    #[serde(default)]
    pub alt_nicks: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
    /// 0 retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_quit_message")]
    pub quit_message: String,
    /// Rate-limit lines sent on behalf of plugins.
    #[serde(default = "default_true")]
    pub flood_protection: bool,
    /// Lines allowed back to back before the rate applies.
    #[serde(default = "default_flood_burst")]
    pub flood_burst: u32,
    /// One line per interval once the burst is spent.
    #[serde(default = "default_flood_interval")]
    pub flood_interval_ms: u64,
}

impl NetworkConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nickname)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nickname)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn flood_interval(&self) -> Duration {
        Duration::from_millis(self.flood_interval_ms)
    }
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}
fn default_publish_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    200
}
fn default_publish_timeout_ms() -> u64 {
    5_000
}
fn default_max_outbound_queue() -> usize {
    256
}
fn default_registration_timeout() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_max_nick_retries() -> u32 {
    3
}
fn default_nick_suffix() -> String {
    "_".to_string()
}
fn default_ping_interval() -> u64 {
    120
}
fn default_ping_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_port() -> u16 {
    6667
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_cap() -> u64 {
    300_000 // 5 minutes
}
fn default_quit_message() -> String {
    "tenyks".to_string()
}
fn default_true() -> bool {
    true
}
fn default_flood_burst() -> u32 {
    4
}
fn default_flood_interval() -> u64 {
    2_000
}
