use futures_util::StreamExt;
use redis::AsyncCommands;
use redis_pool::RedisPool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::AppResult;
use crate::services::directory::SessionDirectory;
use crate::websocket::{ConnectionId, ConnectionRegistry};

const PATTERN: &str = "deliver:*";
const TOPIC_CHANNEL_PREFIX: &str = "deliver:topic:";
const CONNECTION_CHANNEL_PREFIX: &str = "deliver:";

pub fn connection_channel(id: ConnectionId) -> String {
    format!("{CONNECTION_CHANNEL_PREFIX}{id}")
}

pub fn topic_channel(topic: &str) -> String {
    format!("{TOPIC_CHANNEL_PREFIX}{topic}")
}

/// Publish side of the fan-out bus.
///
/// Fire-and-forget: a publish with zero current subscribers is the normal
/// "recipient not online" case, not an error. Topic broadcasts go out once
/// on the topic channel regardless of fan-out width; per-connection channels
/// are reserved for direct replies and force-close notifications.
#[derive(Clone)]
pub struct FanoutBus {
    pool: Arc<RedisPool>,
}

impl FanoutBus {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }

    pub async fn publish_to_topic(&self, topic: &str, payload: &str) -> AppResult<()> {
        let mut conn = self.pool.connection();
        conn.publish::<_, _, ()>(topic_channel(topic), payload)
            .await?;
        Ok(())
    }

    pub async fn publish_to_connection(&self, id: ConnectionId, payload: &str) -> AppResult<()> {
        let mut conn = self.pool.connection();
        conn.publish::<_, _, ()>(connection_channel(id), payload)
            .await?;
        Ok(())
    }
}

/// Per-process fan-out listener.
///
/// Pattern-subscribes to `deliver:*` on a dedicated pub/sub connection and
/// delivers into the local registry. Dropping the handle (or calling `stop`)
/// tears the subscription down.
pub struct FanoutListener {
    shutdown_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl FanoutListener {
    pub fn spawn(
        client: redis::Client,
        registry: ConnectionRegistry,
        directory: SessionDirectory,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(async move {
            if let Err(e) = run_listener(client, registry, directory, shutdown_rx).await {
                error!(error = %e, "fanout listener failed");
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
        info!("fanout listener stopped");
    }
}

impl Drop for FanoutListener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
    }
}

async fn run_listener(
    client: redis::Client,
    registry: ConnectionRegistry,
    directory: SessionDirectory,
    mut shutdown: watch::Receiver<()>,
) -> redis::RedisResult<()> {
    // Pub/sub needs a dedicated connection, not a multiplexed one.
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.psubscribe(PATTERN).await?;
    info!(pattern = PATTERN, "fanout listener subscribed");

    {
        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("fanout listener shutting down");
                    break;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        warn!("fanout pub/sub stream ended");
                        break;
                    };
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(%channel, error = %e, "dropping undecodable fanout payload");
                            continue;
                        }
                    };
                    dispatch(&channel, payload, &registry, &directory).await;
                }
            }
        }
    }

    pubsub.punsubscribe(PATTERN).await?;
    Ok(())
}

/// Route one bus message into the local registry.
///
/// Topic channels are resolved against the directory's current subscriber
/// set and filtered through the local registry: ids held by other instances
/// fall out as silent no-ops.
async fn dispatch(
    channel: &str,
    payload: String,
    registry: &ConnectionRegistry,
    directory: &SessionDirectory,
) {
    if let Some(topic) = channel.strip_prefix(TOPIC_CHANNEL_PREFIX) {
        match directory.subscribers(topic).await {
            Ok(subscribers) => {
                debug!(topic, subscribers = subscribers.len(), "fanout topic delivery");
                for id in subscribers {
                    registry.deliver_local(id, payload.clone()).await;
                }
            }
            Err(e) => warn!(topic, error = %e, "failed to resolve topic subscribers"),
        }
        return;
    }

    if let Some(raw) = channel.strip_prefix(CONNECTION_CHANNEL_PREFIX) {
        match raw.parse::<ConnectionId>() {
            Ok(id) => registry.deliver_local(id, payload).await,
            Err(_) => warn!(%channel, "ignoring fanout channel with malformed connection id"),
        }
    }
}
