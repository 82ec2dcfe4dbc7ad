//! Command handler capability
//!
//! Business logic for station-initiated actions is injected as a map from
//! action name to [`CommandHandler`]. A handler receives the decoded payload
//! and either returns the CALLRESULT payload or a [`HandlerError`], which the
//! connection maps onto the bounded OCPP-J error-code vocabulary.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::connection::ConnectionContext;
use crate::ocpp::ErrorCode;

/// Description sent on the wire for internal failures
const INTERNAL_ERROR_DESCRIPTION: &str = "Internal error";

/// Failure of a command handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not implemented")]
    NotImplemented,

    #[error("Formation violation: {0}")]
    FormationViolation(String),

    #[error("Property constraint violation: {0}")]
    PropertyConstraint(String),

    #[error("Occurrence constraint violation: {0}")]
    OccurrenceConstraint(String),

    #[error("Type constraint violation: {0}")]
    TypeConstraint(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HandlerError::NotSupported(_) => ErrorCode::NotSupported,
            HandlerError::NotImplemented => ErrorCode::NotImplemented,
            HandlerError::FormationViolation(_) => ErrorCode::FormationViolation,
            HandlerError::PropertyConstraint(_) => ErrorCode::PropertyConstraintViolation,
            HandlerError::OccurrenceConstraint(_) => ErrorCode::OccurenceConstraintViolation,
            HandlerError::TypeConstraint(_) => ErrorCode::TypeConstraintViolation,
            HandlerError::Security(_) => ErrorCode::SecurityError,
            HandlerError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Description safe to put in a CALLERROR; internal details stay in the logs.
    pub fn wire_description(&self) -> String {
        match self {
            HandlerError::Internal(_) => INTERNAL_ERROR_DESCRIPTION.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::FormationViolation(e.to_string())
    }
}

/// Decode a CALL payload into its typed request
pub fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerError> {
    Ok(serde_json::from_value(payload)?)
}

/// Encode a typed response as a CALLRESULT payload
pub fn to_payload<T: Serialize>(response: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(response).map_err(|e| HandlerError::Internal(e.to_string()))
}

/// Handler for one station-initiated action
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        context: Arc<ConnectionContext>,
        payload: Value,
    ) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Arc<ConnectionContext>, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        context: Arc<ConnectionContext>,
        payload: Value,
    ) -> Result<Value, HandlerError> {
        (self)(context, payload).await
    }
}

/// Action name → handler map shared by every connection
#[derive(Clone, Default)]
pub struct CommandHandlers {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure, replacing any previous handler for the action
    pub fn on<F, Fut>(mut self, action: impl ToString, handler: F) -> Self
    where
        F: Fn(Arc<ConnectionContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.insert(action, Arc::new(handler));
        self
    }

    pub fn insert(&mut self, action: impl ToString, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(action.to_string(), handler);
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(action).cloned()
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }
}

impl std::fmt::Debug for CommandHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandlers")
            .field("actions", &self.actions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::Action;
    use serde_json::json;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            HandlerError::NotSupported("x".into()).error_code(),
            ErrorCode::NotSupported
        );
        assert_eq!(
            HandlerError::FormationViolation("x".into()).error_code(),
            ErrorCode::FormationViolation
        );
        assert_eq!(
            HandlerError::Internal("db down".into()).error_code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_internal_details_stay_off_the_wire() {
        let err = HandlerError::Internal("connection pool exhausted at 10.0.0.3".into());
        assert_eq!(err.wire_description(), "Internal error");

        let err = HandlerError::PropertyConstraint("connectorId must be > 0".into());
        assert!(err.wire_description().contains("connectorId"));
    }

    #[test]
    fn test_bad_payload_is_formation_violation() {
        let err = parse_payload::<crate::ocpp::AuthorizeRequest>(json!({"idTag": 5})).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FormationViolation);
    }

    #[tokio::test]
    async fn test_closure_handlers() {
        let handlers = CommandHandlers::new().on(Action::Heartbeat, |_ctx, _payload| async {
            Ok::<_, HandlerError>(json!({"currentTime": "2024-01-01T00:00:00Z"}))
        });

        assert_eq!(handlers.actions(), vec!["Heartbeat"]);
        assert!(handlers.get("Reset").is_none());

        let handler = handlers.get("Heartbeat").unwrap();
        let context = Arc::new(ConnectionContext::new("tenantA", "CS-1"));
        let result = handler.handle(context, json!({})).await.unwrap();
        assert_eq!(result["currentTime"], "2024-01-01T00:00:00Z");
    }
}
