//! Listening socket and live-connection bookkeeping.

pub mod listener;
pub mod registry;

pub use listener::{Listener, ListenerBuilder, ListenerError};
pub use registry::{ConnectionId, ConnectionRegistry};
