//! Connection registry
//!
//! The registry owns connection state; the subscription engine keeps only
//! subscription-id references and observes closure. Wire transports
//! (WebSocket/SSE framing) live outside the core and drive the registry
//! through this API.

use crate::config::ConnectionsConfig;
use folio_core::{now_millis, Document, FolioError, FolioResult};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Transport protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Bidirectional socket
    WebSocket,
    /// Server-sent events
    Sse,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    /// Accepting traffic
    Open,
    /// Close initiated
    Closing,
    /// Closed; subscriptions are being dropped
    Closed,
}

/// One client connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Connection id
    pub id: String,
    /// Owning user
    pub user: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Lifecycle state
    pub ready_state: ReadyState,
    /// Subscriptions bound to this connection
    pub subscriptions: HashSet<String>,
    /// Transport metadata (remote address, user agent, ...)
    pub metadata: Document,
    /// Epoch ms at open
    pub connected_at: u64,
    /// Epoch ms of last observed activity
    pub last_activity: u64,
}

/// Owns all connections, enforcing total and per-user caps.
pub struct ConnectionRegistry {
    config: ConnectionsConfig,
    connections: RwLock<FxHashMap<String, Connection>>,
}

impl ConnectionRegistry {
    /// Registry with the given caps.
    pub fn new(config: ConnectionsConfig) -> Self {
        ConnectionRegistry {
            config,
            connections: RwLock::new(FxHashMap::default()),
        }
    }

    /// Open a connection for a user. Fails with `ResourceExhausted` when
    /// a cap is hit.
    pub fn open(
        &self,
        user: impl Into<String>,
        protocol: Protocol,
        metadata: Document,
    ) -> FolioResult<String> {
        let user = user.into();
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            return Err(FolioError::exhausted("connections"));
        }
        let per_user = connections.values().filter(|c| c.user == user).count();
        if per_user >= self.config.max_connections_per_user {
            return Err(FolioError::exhausted(format!(
                "connections for user {}",
                user
            )));
        }
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                user,
                protocol,
                ready_state: ReadyState::Open,
                subscriptions: HashSet::new(),
                metadata,
                connected_at: now,
                last_activity: now,
            },
        );
        Ok(id)
    }

    /// Fetch a connection snapshot.
    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections.read().get(id).cloned()
    }

    /// Whether a connection exists and is open.
    pub fn is_open(&self, id: &str) -> bool {
        self.connections
            .read()
            .get(id)
            .map_or(false, |c| c.ready_state == ReadyState::Open)
    }

    /// Bind a subscription to a connection.
    pub fn attach_subscription(&self, id: &str, subscription_id: &str) -> FolioResult<()> {
        let mut connections = self.connections.write();
        let connection = connections
            .get_mut(id)
            .ok_or_else(|| FolioError::not_found(format!("connection {}", id)))?;
        if connection.ready_state != ReadyState::Open {
            return Err(FolioError::validation(format!(
                "connection {} is not open",
                id
            )));
        }
        connection.subscriptions.insert(subscription_id.to_string());
        Ok(())
    }

    /// Unbind a subscription.
    pub fn detach_subscription(&self, id: &str, subscription_id: &str) {
        if let Some(connection) = self.connections.write().get_mut(id) {
            connection.subscriptions.remove(subscription_id);
        }
    }

    /// Record activity on a connection.
    pub fn touch(&self, id: &str) {
        if let Some(connection) = self.connections.write().get_mut(id) {
            connection.last_activity = now_millis();
        }
    }

    /// Mark closed and return the subscriptions that were bound.
    pub fn close(&self, id: &str) -> Vec<String> {
        let mut connections = self.connections.write();
        match connections.get_mut(id) {
            Some(connection) => {
                connection.ready_state = ReadyState::Closed;
                connection.subscriptions.drain().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop closed connections; returns how many were removed.
    pub fn remove_closed(&self) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|_, c| c.ready_state != ReadyState::Closed);
        before - connections.len()
    }

    /// Connections currently registered.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// True when no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
