pub mod model;
pub mod nickname;

use crate::app::event::is_channel_name;
use crate::error::ConfigError;
use redis::IntoConnectionInfo;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub use model::{AppConfig, BusConfig, CoreConfig, LogConfig, NetworkConfig};

/// Resolve the config path: explicit argument, else the per-user config dir.
pub fn config_path(arg: Option<String>) -> PathBuf {
    match arg {
        Some(p) => PathBuf::from(p),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tenyks")
            .join("config.toml"),
    }
}

pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = toml::from_str(contents)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.networks.is_empty() {
        return Err(invalid("at least one [[networks]] entry is required"));
    }
    if config.core.max_outbound_queue == 0 {
        return Err(invalid("core.max_outbound_queue must be greater than 0"));
    }
    if config.core.nick_suffix.is_empty() {
        return Err(invalid("core.nick_suffix must not be empty"));
    }
    let timeouts = [
        ("core.registration_timeout_secs", config.core.registration_timeout_secs),
        ("core.connect_timeout_secs", config.core.connect_timeout_secs),
        ("core.ping_interval_secs", config.core.ping_interval_secs),
        ("core.ping_timeout_secs", config.core.ping_timeout_secs),
        ("bus.publish_timeout_ms", config.bus.publish_timeout_ms),
    ];
    if let Some((key, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
        return Err(invalid(format!("{} must be greater than 0", key)));
    }
    config
        .bus
        .url
        .as_str()
        .into_connection_info()
        .map_err(|e| invalid(format!("bus.url {:?}: {}", config.bus.url, e)))?;

    let mut seen = HashSet::new();
    for net in &config.networks {
        if net.name.is_empty() || net.name.contains('.') || net.name.contains(char::is_whitespace) {
            return Err(invalid(format!(
                "network name {:?} must be non-empty without '.' or whitespace",
                net.name
            )));
        }
        if !seen.insert(net.name.to_ascii_lowercase()) {
            return Err(invalid(format!("duplicate network name {:?}", net.name)));
        }
        if net.host.is_empty() {
            return Err(invalid(format!("network {:?}: host is required", net.name)));
        }
        if net.port == 0 {
            return Err(invalid(format!("network {:?}: port must be non-zero", net.name)));
        }
        if net.nickname.is_empty() {
            return Err(invalid(format!("network {:?}: nickname is required", net.name)));
        }
        if let Some(ch) = net.channels.iter().find(|c| !is_channel_name(c)) {
            return Err(invalid(format!(
                "network {:?}: {:?} is not a channel name",
                net.name, ch
            )));
        }
        if net.backoff_base_ms == 0 || net.backoff_base_ms > net.backoff_cap_ms {
            return Err(invalid(format!(
                "network {:?}: need 0 < backoff_base_ms <= backoff_cap_ms",
                net.name
            )));
        }
        if net.flood_protection && (net.flood_burst == 0 || net.flood_interval_ms == 0) {
            return Err(invalid(format!(
                "network {:?}: flood_burst and flood_interval_ms must be non-zero",
                net.name
            )));
        }
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
