//! Tenant-scoped registry of live station connections
//!
//! At most one connection is live per `(tenant, station)` key. Registering a
//! new connection shuts the previous one down inside the key's entry lock,
//! so its pending calls are rejected before the replacement becomes visible.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::connection::{CloseReason, Connection};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StationKey {
    pub tenant_id: String,
    pub station_identity: String,
}

impl StationKey {
    pub fn new(tenant_id: impl Into<String>, station_identity: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            station_identity: station_identity.into(),
        }
    }
}

impl std::fmt::Display for StationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.station_identity)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<StationKey, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection` as the live session for its station.
    ///
    /// Returns the connection it replaced, already closed with
    /// [`CloseReason::Superseded`].
    pub fn register(self: &Arc<Self>, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        connection.attach_registry(Arc::downgrade(self));
        let key = connection.key();

        match self.connections.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = Arc::clone(entry.get());
                if Arc::ptr_eq(&previous, &connection) {
                    return None;
                }

                previous.shutdown(CloseReason::Superseded);
                entry.insert(connection);
                info!(station = %key, replaced = %previous.id(), "station reconnected, previous connection closed");
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(connection);
                info!(station = %key, "station registered");
                None
            }
        }
    }

    pub fn lookup(&self, tenant_id: &str, station_identity: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(&StationKey::new(tenant_id, station_identity))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `connection` only if it is still the registered one for its key
    pub fn unregister(&self, connection: &Connection) -> bool {
        let key = connection.key();
        let removed = self
            .connections
            .remove_if(&key, |_, current| std::ptr::eq(current.as_ref(), connection))
            .is_some();

        if removed {
            info!(station = %key, "station unregistered");
        } else {
            debug!(station = %key, connection = %connection.id(), "stale unregister ignored");
        }
        removed
    }

    /// Snapshot of all registered connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connections_for_tenant(&self, tenant_id: &str) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Close every registered connection
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let connections = self.connections();
        for connection in &connections {
            connection.close(reason);
        }
        connections.len()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
