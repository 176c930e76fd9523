//! Pub/sub bus adapter: channel naming, payloads, publishing and command
//! subscriptions.

pub mod naming;
pub mod payload;
pub mod publisher;
pub mod redis;
