//! Station client: typed central-system-initiated commands
//!
//! The client resolves the live connection on every call, so a station that
//! reconnects is picked up without rebuilding the client. A command the
//! station refuses with a CALLERROR is an answer ([`CommandOutcome::Failed`]);
//! only transport failures and local encode/decode problems are `Err`.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::RpcError;
use crate::ocpp::*;
use crate::rpc::{CommandOutcome, ConnectionRegistry};

/// Default timeout for outbound calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StationClient {
    registry: Arc<ConnectionRegistry>,
    tenant_id: String,
    station_identity: String,
    timeout: Duration,
}

impl StationClient {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tenant_id: impl Into<String>,
        station_identity: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            tenant_id: tenant_id.into(),
            station_identity: station_identity.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn station_identity(&self) -> &str {
        &self.station_identity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.registry
            .lookup(&self.tenant_id, &self.station_identity)
            .map(|connection| connection.is_open())
            .unwrap_or(false)
    }

    /// Send a raw CALL and return the station's answer
    pub async fn call(&self, action: &str, payload: Value) -> Result<CommandOutcome, RpcError> {
        let connection = self
            .registry
            .lookup(&self.tenant_id, &self.station_identity)
            .ok_or_else(|| RpcError::NotConnected {
                tenant_id: self.tenant_id.clone(),
                station_identity: self.station_identity.clone(),
            })?;

        info!(
            tenant = %self.tenant_id,
            station = %self.station_identity,
            action,
            payload = %payload,
            "Sending command"
        );

        let result = connection.send_call(action, payload, self.timeout).await;
        match &result {
            Ok(CommandOutcome::Answered(response)) => info!(
                tenant = %self.tenant_id,
                station = %self.station_identity,
                action,
                response = %response,
                "Command answered"
            ),
            Ok(CommandOutcome::Failed {
                code, description, ..
            }) => info!(
                tenant = %self.tenant_id,
                station = %self.station_identity,
                action,
                code = %code,
                description = %description,
                "Command refused by station"
            ),
            Err(e) => warn!(
                tenant = %self.tenant_id,
                station = %self.station_identity,
                action,
                error = %e,
                "Command failed"
            ),
        }
        result
    }

    async fn typed<Req, Resp>(
        &self,
        action: Action,
        request: &Req,
    ) -> Result<CommandOutcome<Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let outcome = self.call(action.as_str(), payload).await?;
        Ok(outcome.try_map(serde_json::from_value)?)
    }

    pub async fn remote_start_transaction(
        &self,
        request: &RemoteStartTransactionRequest,
    ) -> Result<CommandOutcome<RemoteStartTransactionResponse>, RpcError> {
        self.typed(Action::RemoteStartTransaction, request).await
    }

    pub async fn remote_stop_transaction(
        &self,
        transaction_id: i32,
    ) -> Result<CommandOutcome<RemoteStopTransactionResponse>, RpcError> {
        let request = RemoteStopTransactionRequest { transaction_id };
        self.typed(Action::RemoteStopTransaction, &request).await
    }

    pub async fn reset(
        &self,
        reset_type: ResetType,
    ) -> Result<CommandOutcome<ResetResponse>, RpcError> {
        self.typed(Action::Reset, &ResetRequest { reset_type }).await
    }

    pub async fn change_configuration(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<CommandOutcome<ChangeConfigurationResponse>, RpcError> {
        let request = ChangeConfigurationRequest {
            key: key.into(),
            value: value.into(),
        };
        self.typed(Action::ChangeConfiguration, &request).await
    }

    /// Read configuration keys, all of them when `keys` is `None`
    pub async fn get_configuration(
        &self,
        keys: Option<Vec<String>>,
    ) -> Result<CommandOutcome<GetConfigurationResponse>, RpcError> {
        let request = GetConfigurationRequest { key: keys };
        self.typed(Action::GetConfiguration, &request).await
    }

    pub async fn clear_cache(&self) -> Result<CommandOutcome<ClearCacheResponse>, RpcError> {
        self.typed(Action::ClearCache, &json!({})).await
    }

    pub async fn unlock_connector(
        &self,
        connector_id: i32,
    ) -> Result<CommandOutcome<UnlockConnectorResponse>, RpcError> {
        self.typed(Action::UnlockConnector, &UnlockConnectorRequest { connector_id })
            .await
    }

    pub async fn change_availability(
        &self,
        connector_id: i32,
        availability_type: AvailabilityType,
    ) -> Result<CommandOutcome<ChangeAvailabilityResponse>, RpcError> {
        let request = ChangeAvailabilityRequest {
            connector_id,
            availability_type,
        };
        self.typed(Action::ChangeAvailability, &request).await
    }

    pub async fn trigger_message(
        &self,
        requested_message: MessageTrigger,
        connector_id: Option<i32>,
    ) -> Result<CommandOutcome<TriggerMessageResponse>, RpcError> {
        let request = TriggerMessageRequest {
            requested_message,
            connector_id,
        };
        self.typed(Action::TriggerMessage, &request).await
    }

    pub async fn set_charging_profile(
        &self,
        connector_id: i32,
        profile: ChargingProfile,
    ) -> Result<CommandOutcome<SetChargingProfileResponse>, RpcError> {
        let request = SetChargingProfileRequest {
            connector_id,
            cs_charging_profiles: profile,
        };
        self.typed(Action::SetChargingProfile, &request).await
    }

    pub async fn clear_charging_profile(
        &self,
        request: &ClearChargingProfileRequest,
    ) -> Result<CommandOutcome<ClearChargingProfileResponse>, RpcError> {
        self.typed(Action::ClearChargingProfile, request).await
    }

    pub async fn get_composite_schedule(
        &self,
        request: &GetCompositeScheduleRequest,
    ) -> Result<CommandOutcome<GetCompositeScheduleResponse>, RpcError> {
        self.typed(Action::GetCompositeSchedule, request).await
    }

    pub async fn reserve_now(
        &self,
        request: &ReserveNowRequest,
    ) -> Result<CommandOutcome<ReserveNowResponse>, RpcError> {
        self.typed(Action::ReserveNow, request).await
    }

    pub async fn cancel_reservation(
        &self,
        reservation_id: i32,
    ) -> Result<CommandOutcome<CancelReservationResponse>, RpcError> {
        self.typed(Action::CancelReservation, &CancelReservationRequest { reservation_id })
            .await
    }

    pub async fn data_transfer(
        &self,
        request: &DataTransferRequest,
    ) -> Result<CommandOutcome<DataTransferResponse>, RpcError> {
        self.typed(Action::DataTransfer, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CommandHandlers, Connection, ConnectionContext, Outbound};
    use tokio::sync::mpsc;

    fn connect(
        registry: &Arc<ConnectionRegistry>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            ConnectionContext::new("tenantA", "CS-1"),
            Arc::new(CommandHandlers::new()),
            tx,
        );
        registry.register(connection.clone());
        (connection, rx)
    }

    /// Answer the next outbound CALL with `payload`, returning the CALL
    async fn answer(
        connection: &Arc<Connection>,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
        payload: Value,
    ) -> Call {
        let text = match rx.recv().await {
            Some(Outbound::Text(text)) => text,
            other => panic!("expected CALL, got {:?}", other),
        };
        let call = match Frame::decode(&text).unwrap() {
            Frame::Call(call) => call,
            other => panic!("expected CALL, got {:?}", other),
        };
        let reply = Frame::CallResult(CallResult::new(call.message_id.clone(), payload));
        connection.on_message(&reply.encode().unwrap());
        call
    }

    #[tokio::test]
    async fn test_not_connected_sends_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let client = StationClient::new(registry.clone(), "tenantB", "CS-9");

        let err = client.reset(ResetType::Soft).await.unwrap_err();
        match &err {
            RpcError::NotConnected {
                tenant_id,
                station_identity,
            } => {
                assert_eq!(tenant_id, "tenantB");
                assert_eq!(station_identity, "CS-9");
            }
            other => panic!("expected NotConnected, got {:?}", other),
        }
        assert!(err.is_transport());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_wrong_tenant_is_not_connected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_connection, mut rx) = connect(&registry);

        let client = StationClient::new(registry.clone(), "tenantB", "CS-1");
        assert!(matches!(
            client.clear_cache().await,
            Err(RpcError::NotConnected { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_is_a_typed_response() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut rx) = connect(&registry);
        let client = StationClient::new(registry.clone(), "tenantA", "CS-1");

        let pending = tokio::spawn(async move { client.reset(ResetType::Hard).await });
        let call = answer(&connection, &mut rx, json!({"status": "Rejected"})).await;

        assert_eq!(call.action, "Reset");
        assert_eq!(call.payload, json!({"type": "Hard"}));
        let response = pending.await.unwrap().unwrap().answered().unwrap();
        assert_eq!(response.status, GenericStatus::Rejected);
    }

    #[tokio::test]
    async fn test_get_configuration_round_trip() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut rx) = connect(&registry);
        let client = StationClient::new(registry.clone(), "tenantA", "CS-1");

        let pending = tokio::spawn(async move {
            client
                .get_configuration(Some(vec!["HeartbeatInterval".to_string()]))
                .await
        });
        let call = answer(
            &connection,
            &mut rx,
            json!({
                "configurationKey": [
                    {"key": "HeartbeatInterval", "readonly": false, "value": "300"}
                ]
            }),
        )
        .await;

        assert_eq!(call.payload, json!({"key": ["HeartbeatInterval"]}));
        let response = pending.await.unwrap().unwrap().answered().unwrap();
        assert_eq!(response.configuration_key.len(), 1);
        assert!(response.unknown_key.is_empty());
    }

    #[tokio::test]
    async fn test_call_error_is_a_typed_answer() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut rx) = connect(&registry);
        let client = StationClient::new(registry.clone(), "tenantA", "CS-1");

        let pending = tokio::spawn(async move { client.unlock_connector(1).await });
        let text = match rx.recv().await {
            Some(Outbound::Text(text)) => text,
            other => panic!("expected CALL, got {:?}", other),
        };
        let message_id = Frame::decode(&text).unwrap().message_id().to_string();
        let reply = Frame::CallError(CallError::new(
            message_id,
            ErrorCode::NotSupported,
            "no locks on this model",
        ));
        connection.on_message(&reply.encode().unwrap());

        match pending.await.unwrap() {
            Ok(CommandOutcome::Failed {
                code, description, ..
            }) => {
                assert_eq!(code, ErrorCode::NotSupported);
                assert_eq!(description, "no locks on this model");
            }
            other => panic!("expected a Failed answer, got {:?}", other),
        }
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_payload_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut rx) = connect(&registry);
        let client = StationClient::new(registry.clone(), "tenantA", "CS-1");

        let pending = tokio::spawn(async move { client.remote_stop_transaction(42).await });
        answer(&connection, &mut rx, json!({"status": "Maybe"})).await;

        assert!(matches!(pending.await.unwrap(), Err(RpcError::Payload(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, _rx) = connect(&registry);
        let client = StationClient::new(registry.clone(), "tenantA", "CS-1")
            .with_timeout(Duration::from_secs(5));

        let err = client
            .trigger_message(MessageTrigger::Heartbeat, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        assert_eq!(connection.pending_calls(), 0);
    }

    #[test]
    fn test_debug_output_names_station() {
        let registry = Arc::new(ConnectionRegistry::new());
        let client = StationClient::new(registry, "tenantA", "CS-1");

        let debug = format!("{:?}", client);
        assert!(debug.contains("StationClient"));
        assert!(debug.contains("CS-1"));
    }
}
