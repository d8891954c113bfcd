//! HTTP protocol implementation.
//!
//! This module implements an HTTP/1.0 and HTTP/1.1 server connection with
//! persistent connections, request timeouts and idle timeouts.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The per-socket state machine
//! - **`parser`**: Incremental request framing from byte chunks
//! - **`request`**: HTTP request representation and the persistence policy
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes and writes HTTP responses to the client
//! - **`creator`**: The response creator traits supplied by the application
//! - **`json`**: JSON request checks, stock responses and a ready-made creator
//! - **`timeout`**: Validated timeout values and phase timers
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌──────────────────┐
//!   ┌───▶│ ReceivingRequest │ ← request timer armed
//!   │    └──────┬───────────┘
//!   │           │ Request framed and valid
//!   │           ▼
//!   │    ┌──────────────────┐
//!   │    │ ParsingComplete  │ ← decide persistence, build response
//!   │    └──────┬───────────┘
//!   │           │      ┌── malformed request → 400
//!   │           ▼      ▼── request timer fired → 408
//!   │    ┌──────────────────┐
//!   │    │ SendingResponse  │
//!   │    └──────┬───────────┘
//!   │           │ Response sent
//!   │           ├─ keep open ──▶ Idle (idle timer armed)
//!   │           └─ close ──────▶ Closed
//!   │                              ▲
//!   └── new bytes ── Idle ─────────┘ idle timer fired
//! ```
//!
//! Any state moves to `Closed` on end-of-stream, I/O error or listener
//! shutdown. Stock responses always close the connection.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use control_http::http::json::JsonResponseCreatorFactory;
//! use control_http::server::Listener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut listener = Listener::builder()
//!         .port(8000)
//!         .factory(Arc::new(JsonResponseCreatorFactory::new()))
//!         .build()?;
//!
//!     listener.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod creator;
pub mod json;
pub mod parser;
pub mod request;
pub mod response;
pub mod timeout;
pub mod writer;
