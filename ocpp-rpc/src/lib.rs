//! # OCPP RPC
//!
//! OCPP-J bidirectional RPC transport for a central system.
//!
//! Charging stations hold long-lived WebSocket connections to the server and
//! both sides exchange JSON-framed calls over them. This crate owns the
//! framing, the correlation of outbound calls with their answers, dispatch of
//! inbound calls to injected handlers, and a registry that keeps exactly one
//! live connection per station of a tenant.
//!
//! ## Architecture
//!
//! ```text
//!  Charging stations
//!       │ ws://host/ocpp/<tenant>/<station>/<siteArea>/<site>/<company>
//!       ▼
//! ┌──────────────────────────────────────────────┐
//! │ TransportServer                              │
//! │  handshake ─► Route ─► Connection ─► Registry│
//! │  reader loop │ writer task │ liveness sweep  │
//! └───────┬──────────────────────────────▲───────┘
//!         │ CALL                         │ send_call
//!         ▼                              │
//!  CommandHandlers                 StationClient
//!  (business logic)                (business logic)
//! ```
//!
//! ## Wire frames
//!
//! | Type | Frame |
//! |------|-------|
//! | CALL | `[2, id, action, payload]` |
//! | CALLRESULT | `[3, id, payload]` |
//! | CALLERROR | `[4, id, code, description, details]` |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_rpc::{CommandHandlers, CommandOutcome, ConnectionRegistry, ServerConfig, TransportServer};
//! use ocpp_rpc::ocpp::ResetType;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ConnectionRegistry::new());
//!     let handlers = CommandHandlers::new().on("Heartbeat", |_ctx, _payload| async {
//!         Ok(serde_json::json!({ "currentTime": chrono::Utc::now() }))
//!     });
//!
//!     let server = TransportServer::bind(ServerConfig::default(), registry, handlers).await?;
//!     let client = server.station_client("tenantA", "CS-1");
//!     tokio::spawn(async move { server.run().await });
//!
//!     match client.reset(ResetType::Soft).await? {
//!         CommandOutcome::Answered(response) => println!("Reset: {:?}", response.status),
//!         CommandOutcome::Failed { code, description, .. } => {
//!             println!("Reset refused: {} {}", code, description)
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod ocpp;
pub mod rpc;
pub mod server;

pub use client::StationClient;
pub use config::ServerConfig;
pub use error::{RpcError, ServerError};
pub use rpc::{
    CloseReason, CommandHandler, CommandHandlers, CommandOutcome, Connection, ConnectionContext,
    ConnectionRegistry, HandlerError,
};
pub use server::{ShutdownHandle, TransportServer};

// Re-export key types
pub use ocpp::{Action, Call, CallError, CallResult, ErrorCode, Frame};
