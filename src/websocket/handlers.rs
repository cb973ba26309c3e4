use std::sync::Arc;
use tracing::warn;

use crate::auth::SecurityService;
use crate::error::{AppError, AppResult};
use crate::services::directory::UserId;
use crate::services::session_manager::SessionManager;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::ConnectionId;

/// Dispatch one inbound event and produce the reply to hand back on the
/// same socket. Never fails: every error collapses into a reply carrying
/// only its public message.
pub async fn handle_event(
    manager: &Arc<SessionManager>,
    security: &SecurityService,
    id: ConnectionId,
    event: WsInboundEvent,
) -> WsOutboundEvent {
    match event {
        WsInboundEvent::SignIn {
            username,
            password: _,
            request_id,
        } => match sign_in(security, &username) {
            Ok(jwt) => WsOutboundEvent::SignedIn { jwt, request_id },
            Err(e) => failure_reply(e, id, "sign_in", Some(request_id)),
        },

        WsInboundEvent::Authenticate {
            user_id,
            token,
            request_id,
        } => authenticate(manager, security, id, user_id, &token, request_id).await,

        WsInboundEvent::Subscribe { topic, request_id } => {
            match subscribe(manager, id, &topic).await {
                Ok(()) => WsOutboundEvent::Subscribed { topic, request_id },
                Err(e) => failure_reply(e, id, "subscribe", Some(request_id)),
            }
        }

        WsInboundEvent::Unsubscribe { topic, request_id } => {
            match unsubscribe(manager, id, &topic).await {
                Ok(()) => WsOutboundEvent::Unsubscribed { topic, request_id },
                Err(e) => failure_reply(e, id, "unsubscribe", Some(request_id)),
            }
        }

        WsInboundEvent::Publish {
            topic,
            message,
            request_id,
        } => match manager.broadcast_to_topic(id, &topic, message).await {
            Ok(()) => WsOutboundEvent::Published { topic, request_id },
            Err(e) => failure_reply(e, id, "publish", Some(request_id)),
        },

        WsInboundEvent::History {
            topic,
            limit,
            request_id,
        } => match history(manager, &topic, limit).await {
            Ok(messages) => WsOutboundEvent::History {
                topic,
                messages,
                request_id,
            },
            Err(e) => failure_reply(e, id, "history", Some(request_id)),
        },

        WsInboundEvent::Ping => {
            if let Err(e) = manager.heartbeat(id).await {
                warn!(connection_id = %id, error = %e, "heartbeat refresh failed");
            }
            WsOutboundEvent::Pong
        }
    }
}

/// Topic membership changes require a bound identity.
async fn subscribe(
    manager: &Arc<SessionManager>,
    id: ConnectionId,
    topic: &str,
) -> AppResult<()> {
    require_identity(manager, id).await?;
    manager.subscribe(id, topic).await
}

async fn unsubscribe(
    manager: &Arc<SessionManager>,
    id: ConnectionId,
    topic: &str,
) -> AppResult<()> {
    require_identity(manager, id).await?;
    manager.unsubscribe(id, topic).await
}

async fn require_identity(manager: &Arc<SessionManager>, id: ConnectionId) -> AppResult<()> {
    match manager.bound_user(id).await {
        Some(_) => Ok(()),
        None => Err(AppError::Unauthorized),
    }
}

/// Identity is asserted, not looked up: any non-empty username gets a token.
fn sign_in(security: &SecurityService, username: &str) -> AppResult<String> {
    if username.trim().is_empty() {
        return Err(AppError::BadRequest("username must not be empty".into()));
    }
    security.issue(username.trim())
}

/// A bad token is an authentication OUTCOME, not a transport error: the
/// client gets `authenticated { success: false }` and keeps its socket
/// until the grace timer decides otherwise.
async fn authenticate(
    manager: &Arc<SessionManager>,
    security: &SecurityService,
    id: ConnectionId,
    user_id: String,
    token: &str,
    request_id: String,
) -> WsOutboundEvent {
    let rejected = |user_id: String, request_id: String| WsOutboundEvent::Authenticated {
        success: false,
        user_id,
        topics: Vec::new(),
        request_id,
    };

    let claims = match security.verify(token) {
        Ok(claims) => claims,
        Err(_) => return rejected(user_id, request_id),
    };
    if claims.sub != user_id {
        return rejected(user_id, request_id);
    }

    match manager.bind_user(id, &UserId::new(user_id.clone())).await {
        Ok(topics) => WsOutboundEvent::Authenticated {
            success: true,
            user_id,
            topics,
            request_id,
        },
        Err(e) => failure_reply(e, id, "authenticate", Some(request_id)),
    }
}

async fn history(
    manager: &Arc<SessionManager>,
    topic: &str,
    limit: Option<usize>,
) -> AppResult<Vec<serde_json::Value>> {
    let raw = manager
        .directory()
        .recent_messages(topic, limit.unwrap_or(usize::MAX))
        .await?;
    Ok(raw
        .into_iter()
        .map(|entry| {
            serde_json::from_str(&entry).unwrap_or(serde_json::Value::String(entry))
        })
        .collect())
}

fn failure_reply(
    err: AppError,
    id: ConnectionId,
    operation: &str,
    request_id: Option<String>,
) -> WsOutboundEvent {
    warn!(connection_id = %id, operation, error = %err, "operation failed");
    WsOutboundEvent::Error {
        message: err.public_message().to_string(),
        request_id,
    }
}
