//! IRC side: wire codec, transport, connections and session state.

pub mod backoff;
pub mod codec;
pub mod connection;
pub mod manager;
pub mod session;
pub mod transport;
