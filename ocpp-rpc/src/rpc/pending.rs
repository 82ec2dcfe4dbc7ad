//! Outstanding outbound calls of one connection
//!
//! The table is the single source of truth for whether a message id is still
//! outstanding. Every settlement path (response, deadline, close) removes the
//! entry under the same lock before touching the sender, so each call settles
//! exactly once.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::ocpp::ErrorCode;

/// How the station answered a call
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome<T = Value> {
    /// CALLRESULT payload
    Answered(T),
    /// CALLERROR from the station
    Failed {
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl<T> CommandOutcome<T> {
    pub fn is_answered(&self) -> bool {
        matches!(self, CommandOutcome::Answered(_))
    }

    pub fn answered(self) -> Option<T> {
        match self {
            CommandOutcome::Answered(value) => Some(value),
            CommandOutcome::Failed { .. } => None,
        }
    }

    /// Convert the answered payload, leaving a station failure untouched
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<CommandOutcome<U>, E> {
        match self {
            CommandOutcome::Answered(value) => Ok(CommandOutcome::Answered(f(value)?)),
            CommandOutcome::Failed {
                code,
                description,
                details,
            } => Ok(CommandOutcome::Failed {
                code,
                description,
                details,
            }),
        }
    }
}

pub type CallOutcome = Result<CommandOutcome, RpcError>;

/// Outbound call awaiting a CALLRESULT or CALLERROR
struct PendingCall {
    action: String,
    deadline: Instant,
    response_tx: oneshot::Sender<CallOutcome>,
}

#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call. Returns `None` if the id is already outstanding.
    pub fn insert(
        &self,
        message_id: &str,
        action: &str,
        deadline: Instant,
    ) -> Option<oneshot::Receiver<CallOutcome>> {
        let mut calls = self.calls.lock();
        if calls.contains_key(message_id) {
            return None;
        }

        let (response_tx, response_rx) = oneshot::channel();
        calls.insert(
            message_id.to_string(),
            PendingCall {
                action: action.to_string(),
                deadline,
                response_tx,
            },
        );
        Some(response_rx)
    }

    /// Settle a call with the station's answer. Returns false on a correlation miss.
    pub fn settle(&self, message_id: &str, outcome: CallOutcome) -> bool {
        let call = self.calls.lock().remove(message_id);
        match call {
            Some(call) => {
                debug!(message_id, action = %call.action, "settled pending call");
                // The caller may have given up already; nothing to do then.
                let _ = call.response_tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a call without settling it. Returns true if it was still outstanding.
    pub fn remove(&self, message_id: &str) -> bool {
        self.calls.lock().remove(message_id).is_some()
    }

    /// Settle every call whose deadline has passed with `Timeout`
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingCall)> = {
            let mut calls = self.calls.lock();
            let ids: Vec<String> = calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|call| (id, call)))
                .collect()
        };

        let count = expired.len();
        for (message_id, call) in expired {
            warn!(message_id = %message_id, action = %call.action, "call timed out");
            let _ = call.response_tx.send(Err(RpcError::Timeout));
        }
        count
    }

    /// Settle every outstanding call with `ConnectionClosed`
    pub fn reject_all(&self) -> usize {
        let drained: Vec<PendingCall> = self.calls.lock().drain().map(|(_, call)| call).collect();

        let count = drained.len();
        for call in drained {
            let _ = call.response_tx.send(Err(RpcError::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.calls.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_settle_once() {
        let table = PendingCalls::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let rx = table.insert("m1", "Reset", deadline).unwrap();

        assert!(table.settle("m1", Ok(CommandOutcome::Answered(json!({"status": "Accepted"})))));
        assert!(!table.settle("m1", Ok(CommandOutcome::Answered(json!({"status": "Rejected"})))));
        assert!(table.is_empty());

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome, CommandOutcome::Answered(json!({"status": "Accepted"})));
    }

    #[test]
    fn test_outcome_try_map_keeps_failure() {
        let failed: CommandOutcome = CommandOutcome::Failed {
            code: ErrorCode::NotSupported,
            description: "no".into(),
            details: json!({}),
        };
        let mapped = failed
            .try_map(|value| serde_json::from_value::<u32>(value))
            .unwrap();
        assert!(!mapped.is_answered());

        let answered: CommandOutcome = CommandOutcome::Answered(json!(7));
        let mapped = answered.try_map(serde_json::from_value::<u32>).unwrap();
        assert_eq!(mapped.answered(), Some(7));

        let bad: CommandOutcome = CommandOutcome::Answered(json!("seven"));
        assert!(bad.try_map(serde_json::from_value::<u32>).is_err());
    }

    #[test]
    fn test_duplicate_id_is_refused() {
        let table = PendingCalls::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let _rx = table.insert("m1", "Reset", deadline).unwrap();

        assert!(table.insert("m1", "Reset", deadline).is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_only_overdue() {
        let table = PendingCalls::new();
        let now = Instant::now();
        let short = table.insert("short", "Reset", now + Duration::from_secs(1)).unwrap();
        let mut long = table.insert("long", "Reset", now + Duration::from_secs(60)).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.expire(Instant::now()), 1);

        assert!(matches!(short.await.unwrap(), Err(RpcError::Timeout)));
        assert!(table.contains("long"));
        tokio_test::assert_pending!(tokio_test::task::spawn(&mut long).poll());

        // A late answer for the expired call is a correlation miss
        assert!(!table.settle("short", Ok(CommandOutcome::Answered(json!({})))));
    }

    #[tokio::test]
    async fn test_reject_all() {
        let table = PendingCalls::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let a = table.insert("a", "Reset", deadline).unwrap();
        let b = table.insert("b", "ClearCache", deadline).unwrap();

        assert_eq!(table.reject_all(), 2);
        assert!(matches!(a.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(matches!(b.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(table.is_empty());
    }
}
