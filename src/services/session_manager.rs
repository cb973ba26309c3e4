use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::directory::{SessionDirectory, UserId};
use crate::services::fanout::FanoutBus;
use crate::services::lifecycle::{ConnectionState, ConnectionStateManager};
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::{ConnectionId, ConnectionRegistry, SessionCommand};

const AUTH_TIMEOUT_REASON: &str = "Authentication timeout";
const SESSION_TAKEOVER_REASON: &str = "Signed in from another connection";

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub instance_id: Uuid,
    pub local_connections: usize,
    pub total_connections: usize,
}

/// Orchestrates the connection lifecycle across the local registry, the
/// shared directory, the fan-out bus, and the state store.
///
/// `connect_lock` serializes the two operations that establish identity,
/// `on_open` and `bind_user`. Teardown paths never take it, so a close
/// racing a takeover cannot deadlock against the eviction it triggered.
pub struct SessionManager {
    registry: ConnectionRegistry,
    directory: SessionDirectory,
    fanout: FanoutBus,
    lifecycle: Arc<ConnectionStateManager>,
    connect_lock: Mutex<()>,
    // Identities of connections whose socket this instance holds. The
    // authenticate event arrives on that socket, so this map is
    // authoritative for "is this local connection bound" without a store
    // round trip.
    identities: RwLock<HashMap<ConnectionId, UserId>>,
    instance_id: Uuid,
    auth_timeout: Duration,
    single_session_per_user: bool,
}

impl SessionManager {
    pub fn new(
        registry: ConnectionRegistry,
        directory: SessionDirectory,
        fanout: FanoutBus,
        lifecycle: Arc<ConnectionStateManager>,
        auth_timeout: Duration,
        single_session_per_user: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            directory,
            fanout,
            lifecycle,
            connect_lock: Mutex::new(()),
            identities: RwLock::new(HashMap::new()),
            instance_id: Uuid::new_v4(),
            auth_timeout,
            single_session_per_user,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionStateManager> {
        &self.lifecycle
    }

    /// Accept a new connection: register it locally and in the directory,
    /// seed its state entry, and start the unauthenticated grace timer.
    pub async fn on_open(
        self: &Arc<Self>,
        id: ConnectionId,
        sender: UnboundedSender<SessionCommand>,
    ) -> AppResult<()> {
        let _guard = self.connect_lock.lock().await;

        self.registry.add(id, sender).await;
        if let Err(e) = self.directory.register(id).await {
            // Undo the local half so the registry never outlives the
            // directory entry.
            self.registry.remove(id).await;
            return Err(e);
        }
        if let Err(e) = self.lifecycle.set_state(id, ConnectionState::new()).await {
            // Same undo, plus the directory entry: a half-opened connection
            // must leave nothing behind for the sweep to miss.
            self.registry.remove(id).await;
            if let Err(unbind_err) = self.directory.unbind(id).await {
                warn!(connection_id = %id, error = %unbind_err, "failed to undo registration");
            }
            return Err(e);
        }

        self.spawn_auth_timeout(id);
        info!(connection_id = %id, "connection opened");
        Ok(())
    }

    /// After the grace window, a connection that never authenticated is
    /// force-closed with a structured reason. The check reads only the local
    /// identity map, so a store outage cannot stop enforcement.
    fn spawn_auth_timeout(self: &Arc<Self>, id: ConnectionId) {
        let manager = Arc::clone(self);
        let timeout = self.auth_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !manager.registry.contains(id).await {
                return;
            }
            if manager.bound_user(id).await.is_none() {
                info!(connection_id = %id, "closing unauthenticated connection");
                manager.close_connection(id, AUTH_TIMEOUT_REASON).await;
            }
        });
    }

    /// Identity bound to a connection whose socket this instance holds.
    pub async fn bound_user(&self, id: ConnectionId) -> Option<UserId> {
        self.identities.read().await.get(&id).cloned()
    }

    /// Bind an authenticated user identity to a connection and replay the
    /// user's durable topics onto it. Returns the replayed topics, sorted.
    ///
    /// With single-session mode on, the user's previous connections are
    /// evicted first: local ones get a close frame, remote ones lose their
    /// directory and state entries and go dark on the next delivery.
    pub async fn bind_user(
        self: &Arc<Self>,
        id: ConnectionId,
        user: &UserId,
    ) -> AppResult<Vec<String>> {
        let _guard = self.connect_lock.lock().await;

        if !self.registry.contains(id).await {
            return Err(AppError::NotFound);
        }

        if self.single_session_per_user {
            self.evict_other_sessions(id, user).await?;
        }

        self.directory.bind_user(id, user).await?;
        self.identities.write().await.insert(id, user.clone());

        let durable = self.directory.user_topics(user).await?;
        for topic in &durable {
            self.directory.subscribe(id, topic).await?;
        }
        self.refresh_state(id).await?;

        let mut topics: Vec<String> = durable.into_iter().collect();
        topics.sort();
        info!(connection_id = %id, user_id = %user, topics = topics.len(), "user bound");
        Ok(topics)
    }

    async fn evict_other_sessions(self: &Arc<Self>, keep: ConnectionId, user: &UserId) -> AppResult<()> {
        let others = self.directory.connections_of(user).await?;
        for other in others {
            if other == keep {
                continue;
            }
            let close = WsOutboundEvent::Close {
                reason: SESSION_TAKEOVER_REASON.to_string(),
            }
            .to_json();
            let was_local = self.registry.close_local(other, close).await;
            if !was_local {
                // The socket lives on another instance (or is already gone);
                // evict its shared entries so deliveries stop reaching it.
                self.cleanup_shared(other).await;
            }
            info!(evicted = %other, user_id = %user, was_local, "evicted prior session");
        }
        Ok(())
    }

    pub async fn subscribe(&self, id: ConnectionId, topic: &str) -> AppResult<()> {
        self.directory.subscribe(id, topic).await?;
        self.refresh_state(id).await?;
        debug!(connection_id = %id, topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, id: ConnectionId, topic: &str) -> AppResult<()> {
        self.directory.unsubscribe(id, topic).await?;
        self.refresh_state(id).await?;
        debug!(connection_id = %id, topic, "unsubscribed");
        Ok(())
    }

    /// Application-level heartbeat: refresh the state entry's timestamp so
    /// the staleness sweep keeps its hands off a live connection.
    pub async fn heartbeat(&self, id: ConnectionId) -> AppResult<()> {
        self.refresh_state(id).await
    }

    /// Broadcast a payload to every subscriber of the topic, on any
    /// instance. The sender must have a bound user; the payload travels in
    /// a `topic_message` envelope and lands in the topic's recent window.
    pub async fn broadcast_to_topic(
        &self,
        id: ConnectionId,
        topic: &str,
        payload: serde_json::Value,
    ) -> AppResult<()> {
        let user = self.bound_user(id).await.ok_or(AppError::Unauthorized)?;

        let envelope = WsOutboundEvent::TopicMessage {
            topic: topic.to_string(),
            user_id: user.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        }
        .to_json();

        self.directory.record_history(topic, &envelope).await?;
        self.fanout.publish_to_topic(topic, &envelope).await?;
        Ok(())
    }

    /// Push one event at a single connection, wherever it lives.
    pub async fn send_to_connection(
        &self,
        id: ConnectionId,
        event: &WsOutboundEvent,
    ) -> AppResult<()> {
        self.fanout.publish_to_connection(id, &event.to_json()).await
    }

    /// Force-close a connection with a structured reason. A local socket
    /// gets a close frame and tears itself down through `on_close`; a
    /// non-local id only loses its shared entries.
    pub async fn close_connection(self: &Arc<Self>, id: ConnectionId, reason: &str) {
        let close = WsOutboundEvent::Close {
            reason: reason.to_string(),
        }
        .to_json();
        if !self.registry.close_local(id, close).await {
            self.cleanup_shared(id).await;
        }
    }

    /// Teardown after a socket is gone. The registry entry goes first so no
    /// new deliveries target the dead sender; the shared-store steps are
    /// each best-effort and individually logged.
    pub async fn on_close(&self, id: ConnectionId) {
        self.registry.remove(id).await;
        self.cleanup_shared(id).await;
        info!(connection_id = %id, "connection closed");
    }

    async fn cleanup_shared(&self, id: ConnectionId) {
        self.identities.write().await.remove(&id);
        match self.directory.connection_topics(id).await {
            Ok(topics) => {
                for topic in topics {
                    if let Err(e) = self.directory.unsubscribe(id, &topic).await {
                        warn!(connection_id = %id, topic, error = %e, "cleanup unsubscribe failed");
                    }
                }
            }
            Err(e) => warn!(connection_id = %id, error = %e, "cleanup topic lookup failed"),
        }
        if let Err(e) = self.directory.unbind(id).await {
            warn!(connection_id = %id, error = %e, "cleanup unbind failed");
        }
        match self.lifecycle.remove_state(id).await {
            Ok(()) | Err(AppError::AlreadyDisposed) => {}
            Err(e) => warn!(connection_id = %id, error = %e, "cleanup state removal failed"),
        }
    }

    /// Rebuild the connection's state entry from the directory's view.
    async fn refresh_state(&self, id: ConnectionId) -> AppResult<()> {
        let state = ConnectionState {
            subscribed_topics: self.directory.connection_topics(id).await?,
            user_id: self.directory.user_of(id).await?,
            last_updated: chrono::Utc::now(),
        };
        self.lifecycle.set_state(id, state).await
    }

    pub async fn stats(&self) -> AppResult<SessionStats> {
        Ok(SessionStats {
            instance_id: self.instance_id,
            local_connections: self.registry.local_count().await,
            total_connections: self.directory.total_connections().await?,
        })
    }

    /// Stop accepting state writes. Live sweeps notice and bail.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
        info!(instance_id = %self.instance_id, "session manager shut down");
    }
}
