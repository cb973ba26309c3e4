use serde::{Deserialize, Serialize};

/// Inbound WebSocket events from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    /// Exchange a username for a signed token. There is no user store in this
    /// core; identity is asserted, not looked up.
    #[serde(rename = "sign_in")]
    SignIn {
        username: String,
        #[serde(default)]
        password: String,
        request_id: String,
    },

    /// Bind this connection to a user identity, gated by the token.
    #[serde(rename = "authenticate")]
    Authenticate {
        user_id: String,
        token: String,
        request_id: String,
    },

    #[serde(rename = "subscribe")]
    Subscribe { topic: String, request_id: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String, request_id: String },

    /// Broadcast a payload to every subscriber of the topic, on any instance.
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        message: serde_json::Value,
        request_id: String,
    },

    /// Fetch the bounded recent-message window for a topic.
    #[serde(rename = "history")]
    History {
        topic: String,
        #[serde(default)]
        limit: Option<usize>,
        request_id: String,
    },

    /// Application-level heartbeat; refreshes the connection's state entry.
    #[serde(rename = "ping")]
    Ping,
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsOutboundEvent {
    #[serde(rename = "signed_in")]
    SignedIn { jwt: String, request_id: String },

    /// Authentication outcome. On success, `topics` carries the user's
    /// durable subscriptions replayed onto this connection.
    #[serde(rename = "authenticated")]
    Authenticated {
        success: bool,
        user_id: String,
        topics: Vec<String>,
        request_id: String,
    },

    #[serde(rename = "subscribed")]
    Subscribed { topic: String, request_id: String },

    #[serde(rename = "unsubscribed")]
    Unsubscribed { topic: String, request_id: String },

    #[serde(rename = "published")]
    Published { topic: String, request_id: String },

    #[serde(rename = "history")]
    History {
        topic: String,
        messages: Vec<serde_json::Value>,
        request_id: String,
    },

    /// Envelope every topic broadcast travels in.
    #[serde(rename = "topic_message")]
    TopicMessage {
        topic: String,
        user_id: String,
        timestamp: i64,
        payload: serde_json::Value,
    },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Sent just before the server drops the socket.
    #[serde(rename = "close")]
    Close { reason: String },
}

impl WsOutboundEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"internal server error"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_events_parse_by_type_tag() {
        let evt: WsInboundEvent = serde_json::from_str(
            r#"{"type":"subscribe","topic":"general","request_id":"r1"}"#,
        )
        .unwrap();
        match evt {
            WsInboundEvent::Subscribe { topic, request_id } => {
                assert_eq!(topic, "general");
                assert_eq!(request_id, "r1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_accepts_arbitrary_json_payload() {
        let evt: WsInboundEvent = serde_json::from_str(
            r#"{"type":"publish","topic":"general","message":{"text":"hi","n":3},"request_id":"r2"}"#,
        )
        .unwrap();
        match evt {
            WsInboundEvent::Publish { message, .. } => {
                assert_eq!(message["text"], "hi");
                assert_eq!(message["n"], 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_fails_to_parse() {
        assert!(serde_json::from_str::<WsInboundEvent>(r#"{"type":"launch_missiles"}"#).is_err());
    }

    #[test]
    fn topic_message_envelope_is_flat() {
        let evt = WsOutboundEvent::TopicMessage {
            topic: "general".into(),
            user_id: "alice".into(),
            timestamp: 1_700_000_000_000,
            payload: serde_json::json!({"text": "hello"}),
        };
        let parsed: serde_json::Value = serde_json::from_str(&evt.to_json()).unwrap();
        assert_eq!(parsed["type"], "topic_message");
        assert_eq!(parsed["topic"], "general");
        assert_eq!(parsed["user_id"], "alice");
        assert_eq!(parsed["payload"]["text"], "hello");
    }

    #[test]
    fn error_reply_omits_absent_request_id() {
        let evt = WsOutboundEvent::Error {
            message: "not authenticated".into(),
            request_id: None,
        };
        let parsed: serde_json::Value = serde_json::from_str(&evt.to_json()).unwrap();
        assert!(parsed.get("request_id").is_none());
    }
}
