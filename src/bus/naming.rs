//! Bus channel names. Plugins subscribe by these exact strings.

use crate::app::event::Scope;

/// Target token for messages addressed to the bot's own nick.
pub const PRIVATE: &str = "private";
/// Target token for network-level events.
pub const SERVER: &str = "server";

/// `{network}.{target}.{kind}`
pub fn event_channel(network: &str, scope: &Scope, kind: &str) -> String {
    let target = match scope {
        Scope::Channel(name) => name.as_str(),
        Scope::Private => PRIVATE,
        Scope::Server => SERVER,
    };
    format!("{}.{}.{}", network, target, kind)
}

/// `{network}.cmd`
pub fn command_channel(network: &str) -> String {
    format!("{}.cmd", network)
}
