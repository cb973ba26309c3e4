use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis_pool::RedisPool;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::services::directory::UserId;
use crate::websocket::ConnectionId;

const METRICS_TTL_SECS: u64 = 24 * 60 * 60;

/// Serializable per-connection state blob.
///
/// Written on every state-affecting operation, read back for reconciliation
/// and metrics, deleted on disconnect or by the staleness sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub subscribed_topics: HashSet<String>,
    pub user_id: Option<UserId>,
    pub last_updated: DateTime<Utc>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            subscribed_topics: HashSet::new(),
            user_id: None,
            last_updated: Utc::now(),
        }
    }
}

/// Counters persisted by the last sweep run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepMetrics {
    pub stale_removed: u64,
    pub ran_at: Option<DateTime<Utc>>,
}

/// Aggregated snapshot returned by [`ConnectionStateManager::get_metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct StateMetrics {
    pub active_connections: usize,
    pub average_age_secs: u64,
    pub connections_by_topic: HashMap<String, usize>,
    pub last_sweep: SweepMetrics,
}

/// Owns the connection-state keyspace: TTL-capable writes, reads that treat
/// absence as normal, and the recurring staleness sweep.
pub struct ConnectionStateManager {
    pool: Arc<RedisPool>,
    key_prefix: String,
    stale_threshold: Duration,
    sweep_lock: Mutex<()>,
    disposed: AtomicBool,
}

impl ConnectionStateManager {
    pub fn new(pool: Arc<RedisPool>, key_prefix: &str, stale_threshold: Duration) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.to_string(),
            stale_threshold,
            sweep_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    fn state_key(&self, id: ConnectionId) -> String {
        format!("{}:state:{}", self.key_prefix, id)
    }

    fn metrics_key(&self) -> String {
        format!("{}:metrics:last_cleanup", self.key_prefix)
    }

    fn ensure_active(&self) -> AppResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AppError::AlreadyDisposed);
        }
        Ok(())
    }

    /// Write a state blob, refreshing `last_updated` first.
    pub async fn set_state(&self, id: ConnectionId, mut state: ConnectionState) -> AppResult<()> {
        self.ensure_active()?;
        state.last_updated = Utc::now();
        let json = serde_json::to_string(&state)?;
        let mut conn = self.pool.connection();
        if let Err(e) = conn.set::<_, _, ()>(self.state_key(id), json).await {
            error!(connection_id = %id, error = %e, "failed to set connection state");
            return Err(e.into());
        }
        Ok(())
    }

    /// Like [`set_state`](Self::set_state), with a Redis-side expiry.
    pub async fn set_state_with_expiry(
        &self,
        id: ConnectionId,
        mut state: ConnectionState,
        expiry: Duration,
    ) -> AppResult<()> {
        self.ensure_active()?;
        state.last_updated = Utc::now();
        let json = serde_json::to_string(&state)?;
        let mut conn = self.pool.connection();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(self.state_key(id), json, expiry.as_secs().max(1))
            .await
        {
            error!(connection_id = %id, error = %e, "failed to set connection state with expiry");
            return Err(e.into());
        }
        Ok(())
    }

    /// Absent state is a normal answer, not an error.
    pub async fn get_state(&self, id: ConnectionId) -> AppResult<Option<ConnectionState>> {
        self.ensure_active()?;
        let mut conn = self.pool.connection();
        let raw: Option<String> = conn.get(self.state_key(id)).await?;
        match raw {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    pub async fn remove_state(&self, id: ConnectionId) -> AppResult<()> {
        self.ensure_active()?;
        let mut conn = self.pool.connection();
        conn.del::<_, ()>(self.state_key(id)).await?;
        Ok(())
    }

    /// Batched read for a set of connections; unknown ids are simply absent.
    pub async fn states_for(
        &self,
        ids: &[ConnectionId],
    ) -> AppResult<HashMap<ConnectionId, ConnectionState>> {
        self.ensure_active()?;
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.get(self.state_key(*id));
        }
        let mut conn = self.pool.connection();
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        let mut out = HashMap::new();
        for (id, raw) in ids.iter().zip(values) {
            if let Some(json) = raw {
                match serde_json::from_str(&json) {
                    Ok(state) => {
                        out.insert(*id, state);
                    }
                    Err(e) => warn!(connection_id = %id, error = %e, "skipping undecodable state"),
                }
            }
        }
        Ok(out)
    }

    /// Aggregate live key count, average age, per-topic counts, and the last
    /// sweep's counters. An empty store yields zeros, never an error.
    pub async fn get_metrics(&self) -> AppResult<StateMetrics> {
        self.ensure_active()?;
        let mut conn = self.pool.connection();
        let keys = self.scan_state_keys(&mut conn).await?;

        let mut active = 0usize;
        let mut total_age_secs = 0u64;
        let mut by_topic: HashMap<String, usize> = HashMap::new();
        let now = Utc::now();

        for key in &keys {
            let raw: Option<String> = conn.get(key).await?;
            let Some(json) = raw else { continue };
            let Ok(state) = serde_json::from_str::<ConnectionState>(&json) else {
                warn!(%key, "skipping undecodable state during metrics scan");
                continue;
            };
            active += 1;
            total_age_secs += age_secs(state.last_updated, now);
            for topic in &state.subscribed_topics {
                *by_topic.entry(topic.clone()).or_insert(0) += 1;
            }
        }

        let last_sweep: SweepMetrics = {
            let raw: Option<String> = conn.get(self.metrics_key()).await?;
            raw.and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default()
        };

        Ok(StateMetrics {
            active_connections: active,
            average_age_secs: if active > 0 {
                total_age_secs / active as u64
            } else {
                0
            },
            connections_by_topic: by_topic,
            last_sweep,
        })
    }

    /// One sweep pass: delete every state entry older than the threshold and
    /// persist the counters. Skipped (not queued) when a pass is already
    /// running. Returns how many entries were removed.
    pub async fn sweep_stale(&self) -> AppResult<u64> {
        self.ensure_active()?;
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("staleness sweep already running, skipping this pass");
            return Ok(0);
        };

        let mut conn = self.pool.connection();
        let keys = self.scan_state_keys(&mut conn).await?;
        let now = Utc::now();
        let mut removed = 0u64;

        for key in keys {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(AppError::AlreadyDisposed);
            }
            let raw: Option<String> = conn.get(&key).await?;
            let Some(json) = raw else { continue };
            let Ok(state) = serde_json::from_str::<ConnectionState>(&json) else {
                warn!(%key, "skipping undecodable state during sweep");
                continue;
            };
            if is_stale(state.last_updated, now, self.stale_threshold) {
                conn.del::<_, ()>(&key).await?;
                removed += 1;
                info!(%key, "removed stale connection state");
            }
        }

        let metrics = SweepMetrics {
            stale_removed: removed,
            ran_at: Some(now),
        };
        conn.set_ex::<_, _, ()>(
            self.metrics_key(),
            serde_json::to_string(&metrics)?,
            METRICS_TTL_SECS,
        )
        .await?;

        info!(removed, "staleness sweep completed");
        Ok(removed)
    }

    async fn scan_state_keys(
        &self,
        conn: &mut redis::aio::ConnectionManager,
    ) -> AppResult<Vec<String>> {
        let pattern = format!("{}:state:*", self.key_prefix);
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Spawn the recurring sweep. The returned handle owns the timer task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("staleness sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match manager.sweep_stale().await {
                            Ok(_) => {}
                            Err(AppError::AlreadyDisposed) => break,
                            Err(e) => error!(error = %e, "staleness sweep failed"),
                        }
                    }
                }
            }
        });

        SweeperHandle {
            shutdown_tx,
            handle,
        }
    }

    /// Stop accepting work. Later calls return `AlreadyDisposed`; an
    /// in-flight sweep notices the flag and bails out.
    pub fn shutdown(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

pub struct SweeperHandle {
    shutdown_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
    }
}

fn age_secs(last_updated: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    now.signed_duration_since(last_updated)
        .to_std()
        .map(|age| age.as_secs())
        .unwrap_or(0)
}

/// A clock-skewed entry from the future is young, not stale.
fn is_stale(last_updated: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    now.signed_duration_since(last_updated)
        .to_std()
        .map(|age| age > threshold)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn staleness_threshold_is_exclusive() {
        let now = Utc::now();
        let threshold = Duration::from_secs(24 * 60 * 60);

        let cases = [
            (1, false),
            (23, false),
            (25, true),
            (48, true),
        ];
        for (hours, expected) in cases {
            let last = now - ChronoDuration::hours(hours);
            assert_eq!(
                is_stale(last, now, threshold),
                expected,
                "age of {hours}h against a 24h threshold"
            );
        }
    }

    #[test]
    fn future_timestamps_are_not_stale() {
        let now = Utc::now();
        let future = now + ChronoDuration::hours(2);
        assert!(!is_stale(future, now, Duration::from_secs(60)));
        assert_eq!(age_secs(future, now), 0);
    }

    #[test]
    fn state_blob_serializes_roundtrip() {
        let mut state = ConnectionState::new();
        state.subscribed_topics.insert("general".into());
        state.user_id = Some(UserId::new("alice"));

        let json = serde_json::to_string(&state).unwrap();
        let back: ConnectionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn sweep_metrics_default_to_empty() {
        let metrics: SweepMetrics = serde_json::from_str("{}").unwrap_or_default();
        assert_eq!(metrics.stale_removed, 0);
        assert!(metrics.ran_at.is_none());
    }
}
