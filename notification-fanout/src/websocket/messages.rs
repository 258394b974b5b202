/// WebSocket frame types, adapted from the teacher's
/// `websocket::messages::WebSocketMessage` (same tagged-enum shape), with
/// `PushNotification` added as the frame the spec requires the push
/// Delivery Worker to send: `{type: "push_notification", message: <str>}`
/// (§4.8).
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WebSocketMessage {
    #[serde(rename = "push_notification")]
    PushNotification { message: String },

    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
    Ack { message_id: Option<String> },
    Error { code: String, message: String },
    Connected { websocket_id: String, timestamp: i64 },
}

impl WebSocketMessage {
    pub fn push_notification(message: impl Into<String>) -> Self {
        WebSocketMessage::PushNotification {
            message: message.into(),
        }
    }

    pub fn ping() -> Self {
        WebSocketMessage::Ping {
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn pong(timestamp: i64) -> Self {
        WebSocketMessage::Pong { timestamp }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        WebSocketMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn connected(websocket_id: impl Into<String>) -> Self {
        WebSocketMessage::Connected {
            websocket_id: websocket_id.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_notification_round_trips_through_json() {
        let msg = WebSocketMessage::push_notification("hello");
        let json = msg.to_json().unwrap();
        assert!(json.contains("push_notification"));
        let back = WebSocketMessage::from_json(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn ping_pong_carry_timestamps() {
        let ping = WebSocketMessage::ping();
        assert!(matches!(ping, WebSocketMessage::Ping { .. }));
    }
}
