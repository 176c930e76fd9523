//! Coordination between IRC connections and the bus.

pub mod dispatcher;
pub mod event;
pub mod router;
pub mod state;
pub mod stats;
