//! OCPP-J protocol layer
//!
//! - `messages`: wire framing (CALL, CALLRESULT, CALLERROR)
//! - `types`: OCPP 1.6 payload types

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
