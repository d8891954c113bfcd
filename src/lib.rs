//! control-http - HTTP server substrate for a control API
//!
//! Core library for the listener, the connection state machine and the
//! request/response types they exchange.

pub mod config;
pub mod http;
pub mod server;
