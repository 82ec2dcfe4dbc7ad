//! Error types shared by the connection, registry, server and station client

use thiserror::Error;

use crate::ocpp::EncodeError;

/// Failure of an outbound call.
///
/// A CALLERROR from the station is not an `RpcError`; it comes back as
/// [`CommandOutcome::Failed`](crate::rpc::CommandOutcome::Failed).
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Station {station_identity} of tenant {tenant_id} is not connected")]
    NotConnected {
        tenant_id: String,
        station_identity: String,
    },

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] EncodeError),

    #[error("Unexpected payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl RpcError {
    /// True for failures of the transport itself rather than local encode/decode problems
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::NotConnected { .. } | RpcError::Timeout | RpcError::ConnectionClosed
        )
    }
}

/// Transport server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(RpcError::Timeout.is_transport());
        assert!(RpcError::ConnectionClosed.is_transport());

        let payload = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        assert!(!RpcError::from(payload).is_transport());
        assert!(!RpcError::from(EncodeError::MissingAction).is_transport());
    }
}
