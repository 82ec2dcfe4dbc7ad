//! One station connection: dispatch loop state machine and call correlation
//!
//! A [`Connection`] never touches the socket directly. Frames leave through an
//! unbounded channel drained by the server's writer task, which keeps every
//! state transition synchronous and lets the registry shut a connection down
//! while holding its entry lock.
//!
//! ```text
//! Open ──shutdown──► Closing ──close frame queued──► Closed
//!  │                    │                              │
//!  │ send_call, dispatch │ answers to in-flight CALLs  │ terminal, pending
//!  │                    │                              │ calls rejected
//! ```

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

use super::handler::CommandHandlers;
use super::pending::{CommandOutcome, PendingCalls};
use super::registry::{ConnectionRegistry, StationKey};
use crate::error::RpcError;
use crate::ocpp::{Action, Call, CallError, CallResult, ErrorCode, Frame};

/// Routing context of a connection, parsed from the upgrade path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub tenant_id: String,
    pub station_identity: String,
    pub site_area_id: String,
    pub site_id: String,
    pub company_id: String,
    /// Negotiated sub-protocol
    pub protocol: String,
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectionContext {
    pub fn new(tenant_id: impl Into<String>, station_identity: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            station_identity: station_identity.into(),
            site_area_id: String::new(),
            site_id: String::new(),
            company_id: String::new(),
            protocol: String::new(),
            remote_addr: None,
        }
    }

    pub fn key(&self) -> StationKey {
        StationKey::new(&self.tenant_id, &self.station_identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Why a connection is being closed, with its WebSocket close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    /// Server shutting down
    GoingAway,
    UnsupportedProtocol,
    InvalidPath,
    /// A newer connection registered for the same station
    Superseded,
    /// Missed too many keepalive pings
    Unresponsive,
    /// Socket closed or failed on the station side
    Remote,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal | CloseReason::Remote => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::UnsupportedProtocol => 1002,
            CloseReason::InvalidPath => 1008,
            CloseReason::Superseded => 4000,
            CloseReason::Unresponsive => 4001,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal closure",
            CloseReason::GoingAway => "server shutting down",
            CloseReason::UnsupportedProtocol => "unsupported sub-protocol",
            CloseReason::InvalidPath => "invalid connection path",
            CloseReason::Superseded => "superseded by a newer connection",
            CloseReason::Unresponsive => "keepalive timeout",
            CloseReason::Remote => "closed by station",
        }
    }

    /// The socket is already gone when the station closed it
    fn sends_close_frame(&self) -> bool {
        !matches!(self, CloseReason::Remote)
    }
}

/// Instruction for the socket writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close(CloseReason),
}

/// Result of one liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Idle for an interval: ping it
    Idle,
    /// Missed the allowed number of intervals: terminate it
    Dead,
}

pub struct Connection {
    id: Uuid,
    context: Arc<ConnectionContext>,
    handlers: Arc<CommandHandlers>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Mutex<ConnectionState>,
    closed: watch::Sender<bool>,
    pending: PendingCalls,
    last_activity: Mutex<Instant>,
    missed_pings: AtomicU32,
    registry: OnceLock<Weak<ConnectionRegistry>>,
    span: Span,
}

impl Connection {
    pub fn new(
        context: ConnectionContext,
        handlers: Arc<CommandHandlers>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        let span = tracing::info_span!(
            "connection",
            tenant = %context.tenant_id,
            station = %context.station_identity
        );

        Arc::new(Self {
            id: Uuid::new_v4(),
            context: Arc::new(context),
            handlers,
            outbound,
            state: Mutex::new(ConnectionState::Open),
            closed: watch::Sender::new(false),
            pending: PendingCalls::new(),
            last_activity: Mutex::new(Instant::now()),
            missed_pings: AtomicU32::new(0),
            registry: OnceLock::new(),
            span,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn key(&self) -> StationKey {
        self.context.key()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Resolves once the connection reached `Closed`
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn attach_registry(&self, registry: Weak<ConnectionRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Process one raw inbound text message
    pub fn on_message(self: &Arc<Self>, raw: &str) {
        let _enter = self.span.enter();

        if self.state() == ConnectionState::Closed {
            debug!("ignoring message on closed connection");
            return;
        }
        self.touch();

        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                match e.answerable_id() {
                    Some(message_id) => {
                        warn!(message_id, error = %e, "malformed CALL");
                        let reply = CallError::new(message_id, e.error_code(), e.kind.to_string());
                        self.send_frame(reply.into());
                    }
                    None => {
                        warn!(error = %e, raw = %e.raw, "dropping undecodable message");
                    }
                }
                return;
            }
        };

        match frame {
            Frame::Call(call) => self.dispatch(call),
            Frame::CallResult(result) => {
                debug!(message_id = %result.message_id, "received CALLRESULT");
                let outcome = Ok(CommandOutcome::Answered(result.payload));
                if !self.pending.settle(&result.message_id, outcome) {
                    warn!(message_id = %result.message_id, "CALLRESULT for unknown call, discarding");
                }
            }
            Frame::CallError(error) => {
                debug!(
                    message_id = %error.message_id,
                    code = %error.error_code,
                    "received CALLERROR"
                );
                let outcome = Ok(CommandOutcome::Failed {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                });
                if !self.pending.settle(&error.message_id, outcome) {
                    warn!(message_id = %error.message_id, "CALLERROR for unknown call, discarding");
                }
            }
        }
    }

    /// Run the handler for an inbound CALL on its own task
    fn dispatch(self: &Arc<Self>, call: Call) {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        let handler = match self.handlers.get(&action) {
            Some(handler) => handler,
            None => {
                // Known-but-unhandled and unknown actions get different codes
                let (code, description) = match action.parse::<Action>() {
                    Ok(_) => (ErrorCode::NotSupported, format!("Action {} is not supported", action)),
                    Err(_) => (ErrorCode::NotImplemented, format!("Unknown action {}", action)),
                };
                warn!(message_id = %message_id, action = %action, "no handler for action");
                self.send_frame(CallError::new(message_id, code, description).into());
                return;
            }
        };

        info!(message_id = %message_id, action = %action, payload = %payload, "handling CALL");

        let connection = Arc::clone(self);
        let context = Arc::clone(&self.context);
        tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(handler.handle(context, payload))
                    .catch_unwind()
                    .await;

                let reply: Frame = match outcome {
                    Ok(Ok(result)) => {
                        info!(message_id = %message_id, action = %action, result = %result, "CALL handled");
                        CallResult::new(message_id, result).into()
                    }
                    Ok(Err(e)) => {
                        warn!(message_id = %message_id, action = %action, error = %e, "handler failed");
                        CallError::new(message_id, e.error_code(), e.wire_description()).into()
                    }
                    Err(_) => {
                        warn!(message_id = %message_id, action = %action, "handler panicked");
                        CallError::new(message_id, ErrorCode::InternalError, "Internal error").into()
                    }
                };
                connection.send_frame(reply);
            }
            .instrument(self.span.clone()),
        );
    }

    /// Queue a frame for the writer. Answers are still allowed while closing.
    pub fn send_frame(&self, frame: Frame) -> bool {
        if self.state() == ConnectionState::Closed {
            debug!(message_id = frame.message_id(), "connection closed, dropping frame");
            return false;
        }

        match frame.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                false
            }
        }
    }

    /// Queue an already encoded frame
    pub(crate) fn send_text(&self, text: String) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        debug!(parent: &self.span, "Sending: {}", text);
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Issue a CALL to the station and wait for its answer.
    ///
    /// A CALLERROR from the station is an answer, not an `Err`.
    pub async fn send_call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CommandOutcome, RpcError> {
        if !self.is_open() {
            return Err(RpcError::ConnectionClosed);
        }

        let deadline = Instant::now() + timeout;
        let (message_id, mut response_rx) = loop {
            let message_id = Uuid::new_v4().to_string();
            if let Some(rx) = self.pending.insert(&message_id, action, deadline) {
                break (message_id, rx);
            }
        };

        // A concurrent shutdown may have drained the table before our insert
        if !self.is_open() {
            self.pending.remove(&message_id);
            return Err(RpcError::ConnectionClosed);
        }

        let frame = Frame::Call(Call {
            message_id: message_id.clone(),
            action: action.to_string(),
            payload,
        });
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                self.pending.remove(&message_id);
                return Err(e.into());
            }
        };

        debug!(parent: &self.span, message_id = %message_id, action, "sending CALL");
        if self.outbound.send(Outbound::Text(text)).is_err() {
            self.pending.remove(&message_id);
            return Err(RpcError::ConnectionClosed);
        }

        match tokio::time::timeout_at(deadline, &mut response_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                if self.pending.remove(&message_id) {
                    warn!(parent: &self.span, message_id = %message_id, action, "call timed out");
                    Err(RpcError::Timeout)
                } else {
                    // Settled between the deadline firing and our removal
                    response_rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
                }
            }
        }
    }

    /// Settle overdue calls with `Timeout`
    pub fn expire_calls(&self, now: Instant) -> usize {
        let _enter = self.span.enter();
        self.pending.expire(now)
    }

    /// Record inbound traffic (any frame or pong)
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.missed_pings.store(0, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Count an idle interval and tell the sweep what to do
    pub fn check_liveness(&self, now: Instant, interval: Duration, max_missed: u32) -> Liveness {
        if now.saturating_duration_since(self.last_activity()) < interval {
            return Liveness::Alive;
        }

        let missed = self.missed_pings.fetch_add(1, Ordering::Relaxed) + 1;
        if missed >= max_missed {
            Liveness::Dead
        } else {
            Liveness::Idle
        }
    }

    pub fn ping(&self) -> bool {
        self.is_open() && self.outbound.send(Outbound::Ping).is_ok()
    }

    /// Transition to Closed without touching the registry. Idempotent.
    ///
    /// Returns false if the connection was already closing or closed.
    pub fn shutdown(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Open {
                return false;
            }
            *state = ConnectionState::Closing;
        }

        if reason.sends_close_frame() {
            let _ = self.outbound.send(Outbound::Close(reason));
        }

        *self.state.lock() = ConnectionState::Closed;
        let rejected = self.pending.reject_all();
        self.closed.send_replace(true);

        info!(
            parent: &self.span,
            reason = reason.description(),
            code = reason.code(),
            rejected,
            "connection closed"
        );
        true
    }

    /// Close the connection and unregister it if it is still the live one
    pub fn close(&self, reason: CloseReason) {
        self.shutdown(reason);

        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.unregister(self);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tenant_id", &self.context.tenant_id)
            .field("station_identity", &self.context.station_identity)
            .field("state", &self.state())
            .finish()
    }
}
