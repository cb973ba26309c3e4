use chrono::Utc;
use redis::AsyncCommands;
use redis_pool::RedisPool;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::websocket::ConnectionId;

/// Identity asserted at authentication time. Distinct from [`ConnectionId`]
/// so the two can never be mixed across the directory's keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Seeded topic metadata, served by the catalog endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
}

fn topic_key(topic: &str) -> String {
    format!("ws:topic:{topic}")
}

fn connection_topics_key(id: ConnectionId) -> String {
    format!("ws:connection:{id}:topics")
}

fn user_topics_key(user: &UserId) -> String {
    format!("ws:user:{user}:topics")
}

fn user_connections_key(user: &UserId) -> String {
    format!("ws:user:{user}:connections")
}

fn conn_key(id: ConnectionId) -> String {
    format!("ws:conn:{id}")
}

fn topic_meta_key(topic_id: &str) -> String {
    format!("ws:meta:topic:{topic_id}")
}

fn topic_history_key(topic: &str) -> String {
    format!("ws:topic:{topic}:history")
}

/// Shared session directory over Redis.
///
/// Holds the three relations the router keeps consistent: connection→user,
/// user→connections, and topic membership (per-connection subscriber sets
/// plus durable per-user topic memory that outlives any single connection).
/// Every failure surfaces as `StoreUnavailable`; nothing is dropped silently.
#[derive(Clone)]
pub struct SessionDirectory {
    pool: Arc<RedisPool>,
    history_limit: usize,
}

impl SessionDirectory {
    pub fn new(pool: Arc<RedisPool>, history_limit: usize) -> Self {
        Self {
            pool,
            history_limit: history_limit.max(1),
        }
    }

    /// Record a newly opened connection. Must happen before any subscribe.
    pub async fn register(&self, id: ConnectionId) -> AppResult<()> {
        let mut conn = self.pool.connection();
        conn.hset::<_, _, _, ()>(conn_key(id), "connectedAt", Utc::now().timestamp_millis())
            .await?;
        Ok(())
    }

    /// Bind a connection to a user. Idempotent.
    pub async fn bind_user(&self, id: ConnectionId, user: &UserId) -> AppResult<()> {
        let mut conn = self.pool.connection();
        conn.hset::<_, _, _, ()>(conn_key(id), "userId", user.as_str())
            .await?;
        conn.sadd::<_, _, ()>(user_connections_key(user), id.to_string())
            .await?;
        Ok(())
    }

    pub async fn user_of(&self, id: ConnectionId) -> AppResult<Option<UserId>> {
        let mut conn = self.pool.connection();
        let user: Option<String> = conn.hget(conn_key(id), "userId").await?;
        Ok(user.map(UserId::new))
    }

    pub async fn connections_of(&self, user: &UserId) -> AppResult<HashSet<ConnectionId>> {
        let mut conn = self.pool.connection();
        let raw: HashSet<String> = conn.smembers(user_connections_key(user)).await?;
        Ok(parse_connection_ids(raw))
    }

    /// Subscribe a connection to a topic.
    ///
    /// Fails with `NotFound` when the connection was never registered here.
    /// When the connection has a bound user, the topic also lands in that
    /// user's durable topic memory.
    pub async fn subscribe(&self, id: ConnectionId, topic: &str) -> AppResult<()> {
        let mut conn = self.pool.connection();
        let known: bool = conn.exists(conn_key(id)).await?;
        if !known {
            return Err(AppError::NotFound);
        }

        conn.sadd::<_, _, ()>(topic_key(topic), id.to_string())
            .await?;
        conn.sadd::<_, _, ()>(connection_topics_key(id), topic)
            .await?;

        if let Some(user) = self.user_of(id).await? {
            conn.sadd::<_, _, ()>(user_topics_key(&user), topic).await?;
        }
        Ok(())
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// Durable per-user memory is dropped only when none of the user's other
    /// live connections remain subscribed. That check is a scatter/gather
    /// over the sibling connections, not an atomic operation; a concurrent
    /// subscribe by a sibling can race it. Accepted, documented behavior.
    pub async fn unsubscribe(&self, id: ConnectionId, topic: &str) -> AppResult<()> {
        let mut conn = self.pool.connection();
        conn.srem::<_, _, ()>(topic_key(topic), id.to_string())
            .await?;
        conn.srem::<_, _, ()>(connection_topics_key(id), topic)
            .await?;

        let Some(user) = self.user_of(id).await? else {
            return Ok(());
        };

        let siblings: HashSet<String> = conn.smembers(user_connections_key(&user)).await?;
        let own = id.to_string();
        let mut still_subscribed = false;
        for sibling in siblings {
            if sibling == own {
                continue;
            }
            let member: bool = conn.sismember(topic_key(topic), &sibling).await?;
            if member {
                still_subscribed = true;
                break;
            }
        }

        if !still_subscribed {
            conn.srem::<_, _, ()>(user_topics_key(&user), topic).await?;
        }
        Ok(())
    }

    pub async fn subscribers(&self, topic: &str) -> AppResult<HashSet<ConnectionId>> {
        let mut conn = self.pool.connection();
        let raw: HashSet<String> = conn.smembers(topic_key(topic)).await?;
        Ok(parse_connection_ids(raw))
    }

    pub async fn user_topics(&self, user: &UserId) -> AppResult<HashSet<String>> {
        let mut conn = self.pool.connection();
        Ok(conn.smembers(user_topics_key(user)).await?)
    }

    pub async fn connection_topics(&self, id: ConnectionId) -> AppResult<HashSet<String>> {
        let mut conn = self.pool.connection();
        Ok(conn.smembers(connection_topics_key(id)).await?)
    }

    /// Drop the connection→user binding and the connection's directory keys.
    pub async fn unbind(&self, id: ConnectionId) -> AppResult<()> {
        let mut conn = self.pool.connection();
        if let Some(user) = self.user_of(id).await? {
            conn.srem::<_, _, ()>(user_connections_key(&user), id.to_string())
                .await?;
        }
        conn.del::<_, ()>(conn_key(id)).await?;
        conn.del::<_, ()>(connection_topics_key(id)).await?;
        Ok(())
    }

    /// Count registered connections across all instances. Diagnostics only.
    pub async fn total_connections(&self) -> AppResult<usize> {
        let mut conn = self.pool.connection();
        let mut count = 0usize;
        let mut iter = conn.scan_match::<_, String>("ws:conn:*").await?;
        while iter.next_item().await.is_some() {
            count += 1;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Topic catalog and bounded history
    // ------------------------------------------------------------------

    pub async fn upsert_topic(&self, info: &TopicInfo) -> AppResult<()> {
        let mut conn = self.pool.connection();
        conn.hset_multiple::<_, _, _, ()>(
            topic_meta_key(&info.id),
            &[
                ("name", info.name.as_str()),
                ("description", info.description.as_str()),
                ("category", info.category.as_str()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Seed the default topic catalog. Idempotent.
    pub async fn seed_default_topics(&self) -> AppResult<()> {
        for info in default_topics() {
            self.upsert_topic(&info).await?;
        }
        Ok(())
    }

    pub async fn list_topics(&self) -> AppResult<Vec<TopicInfo>> {
        let mut conn = self.pool.connection();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>("ws:meta:topic:*").await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut topics = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.rsplit(':').next().unwrap_or_default().to_string();
            let name: Option<String> = conn.hget(&key, "name").await?;
            let description: Option<String> = conn.hget(&key, "description").await?;
            let category: Option<String> = conn.hget(&key, "category").await?;
            topics.push(TopicInfo {
                id,
                name: name.unwrap_or_default(),
                description: description.unwrap_or_default(),
                category: category.unwrap_or_default(),
            });
        }
        topics.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(topics)
    }

    /// Append a broadcast payload to the topic's bounded recent window.
    pub async fn record_history(&self, topic: &str, payload: &str) -> AppResult<()> {
        let mut conn = self.pool.connection();
        let key = topic_history_key(topic);
        conn.rpush::<_, _, ()>(&key, payload).await?;
        conn.ltrim::<_, ()>(&key, -(self.history_limit as isize), -1)
            .await?;
        Ok(())
    }

    pub async fn recent_messages(&self, topic: &str, count: usize) -> AppResult<Vec<String>> {
        let count = count.clamp(1, self.history_limit);
        let mut conn = self.pool.connection();
        Ok(conn
            .lrange(topic_history_key(topic), -(count as isize), -1)
            .await?)
    }
}

fn parse_connection_ids(raw: HashSet<String>) -> HashSet<ConnectionId> {
    raw.into_iter()
        .filter_map(|s| match s.parse::<ConnectionId>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(member = %s, "skipping malformed connection id in directory set");
                None
            }
        })
        .collect()
}

fn default_topics() -> Vec<TopicInfo> {
    [
        ("general", "General", "General discussion channel", "Public"),
        (
            "announcements",
            "Announcements",
            "Important updates and announcements",
            "Public",
        ),
        ("support", "Support", "Technical support channel", "Support"),
        (
            "feedback",
            "Feedback",
            "Product feedback and suggestions",
            "Support",
        ),
        (
            "dev-updates",
            "Development Updates",
            "Latest development news",
            "Development",
        ),
        ("bugs", "Bug Reports", "Report and track bugs", "Development"),
    ]
    .into_iter()
    .map(|(id, name, description, category)| TopicInfo {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_are_a_stable_wire_contract() {
        let id: ConnectionId = "6f1c7d1e-0000-4000-8000-000000000001".parse().unwrap();
        let user = UserId::new("alice");
        assert_eq!(topic_key("general"), "ws:topic:general");
        assert_eq!(
            connection_topics_key(id),
            "ws:connection:6f1c7d1e-0000-4000-8000-000000000001:topics"
        );
        assert_eq!(user_topics_key(&user), "ws:user:alice:topics");
        assert_eq!(user_connections_key(&user), "ws:user:alice:connections");
        assert_eq!(conn_key(id), "ws:conn:6f1c7d1e-0000-4000-8000-000000000001");
        assert_eq!(topic_history_key("general"), "ws:topic:general:history");
    }

    #[test]
    fn malformed_directory_members_are_skipped() {
        let mut raw = HashSet::new();
        raw.insert("6f1c7d1e-0000-4000-8000-000000000001".to_string());
        raw.insert("garbage".to_string());
        let parsed = parse_connection_ids(raw);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn default_catalog_has_unique_ids() {
        let topics = default_topics();
        let ids: HashSet<_> = topics.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.len(), topics.len());
    }
}
