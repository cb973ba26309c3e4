use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use uuid::Uuid;

pub mod handlers;
pub mod message_types;

/// Unique identifier for an accepted socket.
///
/// Generated by the transport layer on open; local to exactly one server
/// instance for the lifetime of the socket. Also used verbatim in the shared
/// directory's keyspace, so it must never be confused with a user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Commands the router pushes at a live socket.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Deliver a serialized payload to the client.
    Deliver(String),
    /// Send a structured close payload, then drop the socket.
    Close(String),
}

/// Per-process registry of connection id -> live socket sender.
///
/// Pure local cache, never persisted. Delivering to an id that is not here is
/// the normal case of "subscriber lives on another instance or just left",
/// not an error.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, UnboundedSender<SessionCommand>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, id: ConnectionId, sender: UnboundedSender<SessionCommand>) {
        let mut guard = self.inner.write().await;
        guard.insert(id, sender);
        tracing::debug!(connection_id = %id, total = guard.len(), "connection registered");
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<UnboundedSender<SessionCommand>> {
        let mut guard = self.inner.write().await;
        let removed = guard.remove(&id);
        if removed.is_some() {
            tracing::debug!(connection_id = %id, remaining = guard.len(), "connection removed");
        }
        removed
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    /// Deliver a payload to a local socket. Missing id is a silent no-op;
    /// a dead sender is evicted on the spot.
    pub async fn deliver_local(&self, id: ConnectionId, payload: String) {
        let mut guard = self.inner.write().await;
        if let Some(sender) = guard.get(&id) {
            if sender.send(SessionCommand::Deliver(payload)).is_err() {
                guard.remove(&id);
                tracing::debug!(connection_id = %id, "evicted dead sender during delivery");
            }
        }
    }

    /// Push a close command at a local socket, if it is local.
    /// Returns whether the connection was found here.
    pub async fn close_local(&self, id: ConnectionId, payload: String) -> bool {
        let guard = self.inner.read().await;
        match guard.get(&id) {
            Some(sender) => sender.send(SessionCommand::Close(payload)).is_ok(),
            None => false,
        }
    }

    pub async fn local_count(&self) -> usize {
        self.inner.read().await.len()
    }
}
