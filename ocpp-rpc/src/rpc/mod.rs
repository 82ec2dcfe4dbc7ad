//! Per-connection RPC engine
//!
//! - `pending`: outstanding outbound calls and their deadlines
//! - `handler`: command handler capability for station-initiated CALLs
//! - `connection`: dispatch state machine and `send_call`
//! - `registry`: single live connection per `(tenant, station)`

pub mod connection;
pub mod handler;
pub mod pending;
pub mod registry;

pub use connection::{CloseReason, Connection, ConnectionContext, ConnectionState, Liveness, Outbound};
pub use handler::{parse_payload, to_payload, CommandHandler, CommandHandlers, HandlerError};
pub use pending::{CommandOutcome, PendingCalls};
pub use registry::{ConnectionRegistry, StationKey};
