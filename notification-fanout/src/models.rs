use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Domain event type, as carried on the wire payload's `event_type` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Like,
    Comment,
    Share,
    Follow,
    Unfollow,
    Mention,
    Message,
    Post,
    Reply,
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Like => "like",
            EventType::Comment => "comment",
            EventType::Share => "share",
            EventType::Follow => "follow",
            EventType::Unfollow => "unfollow",
            EventType::Mention => "mention",
            EventType::Message => "message",
            EventType::Post => "post",
            EventType::Reply => "reply",
            EventType::Unknown => "unknown",
        }
    }

    /// Parses a raw, possibly-unrecognized wire string into an EventType,
    /// routing anything unrecognized to Unknown rather than rejecting it
    /// (see spec §4.5 edge cases).
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "LIKE" => EventType::Like,
            "COMMENT" => EventType::Comment,
            "SHARE" => EventType::Share,
            "FOLLOW" => EventType::Follow,
            "UNFOLLOW" => EventType::Unfollow,
            "MENTION" => EventType::Mention,
            "MESSAGE" => EventType::Message,
            "POST" => EventType::Post,
            "REPLY" => EventType::Reply,
            _ => EventType::Unknown,
        }
    }
}

/// User type, used by the priority predicate (§4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserType {
    Admin,
    Premium,
    Basic,
    Free,
}

impl UserType {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "ADMIN" => UserType::Admin,
            "PREMIUM" => UserType::Premium,
            "BASIC" => UserType::Basic,
            _ => UserType::Free,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, UserType::Admin | UserType::Premium)
    }
}

/// Delivery channel. `AsRef<str>` values double as SQL column-name suffixes
/// (`retry_count_<channel>`, `status_<channel>`) and queue-name prefixes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }

    pub const ALL: [Channel; 3] = [Channel::Sms, Channel::Email, Channel::Push];
}

/// Priority class decided once per event at ingress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Priority {
    Critical,
    NonCritical,
}

impl Priority {
    pub fn queue_suffix(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::NonCritical => "non_critical",
        }
    }
}

/// Event lifecycle status (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    Start,
    Processing,
    Success,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Start => "START",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Success => "SUCCESS",
            EventStatus::Failed => "FAILED",
        }
    }

    pub fn from_str_lenient(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "PROCESSING" => EventStatus::Processing,
            "SUCCESS" => EventStatus::Success,
            "FAILED" => EventStatus::Failed,
            _ => EventStatus::Start,
        }
    }

    /// SUCCESS/FAILED never regress once reached (§3 invariant).
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Success | EventStatus::Failed)
    }
}

/// Attribute bag nested inside the event payload (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventAttributes {
    pub parent_id: Option<String>,
    pub parent_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Option<String>,
}

/// Which channels a producer asked to notify on, from the wire payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct NotificationSelection {
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub push: bool,
}

impl NotificationSelection {
    pub fn enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Sms => self.sms,
            Channel::Email => self.email,
            Channel::Push => self.push,
        }
    }
}

/// The raw wire payload carried inside the fanout envelope's `Message`
/// field (§6). All fields but `event_type` and `user_id` are optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWirePayload {
    #[serde(default)]
    pub event_id: Option<String>,
    pub event_type: String,
    pub user_id: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count_sms: i32,
    #[serde(default)]
    pub retry_count_email: i32,
    #[serde(default)]
    pub retry_count_push: i32,
    #[serde(default)]
    pub notifications: NotificationSelection,
    #[serde(default)]
    pub target_clients: Vec<String>,
    /// `user_type` is only ever inlined by upstream producers who already
    /// know it; the router resolves the authoritative value itself.
    #[serde(default)]
    pub user_type: Option<String>,
}

/// Outer pub/sub fanout envelope (§6 / glossary "Fanout envelope"):
/// `{"Message": "<json-encoded payload as string>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutEnvelope {
    #[serde(rename = "Message")]
    pub message: String,
}

impl FanoutEnvelope {
    pub fn wrap(payload: &EventWirePayload) -> Result<Self, serde_json::Error> {
        Ok(FanoutEnvelope {
            message: serde_json::to_string(payload)?,
        })
    }

    pub fn unwrap_payload(&self) -> Result<EventWirePayload, serde_json::Error> {
        serde_json::from_str(&self.message)
    }
}

/// The durable Event record (§3), keyed by `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub status: EventStatus,
    pub status_sms: Option<EventStatus>,
    pub status_email: Option<EventStatus>,
    pub status_push: Option<EventStatus>,
    pub user_id: String,
    pub event_type: EventType,
    pub retry_count_sms: i32,
    pub retry_count_email: i32,
    pub retry_count_push: i32,
    pub payload: EventAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn retry_count(&self, channel: Channel) -> i32 {
        match channel {
            Channel::Sms => self.retry_count_sms,
            Channel::Email => self.retry_count_email,
            Channel::Push => self.retry_count_push,
        }
    }

    pub fn channel_status(&self, channel: Channel) -> Option<EventStatus> {
        match channel {
            Channel::Sms => self.status_sms,
            Channel::Email => self.status_email,
            Channel::Push => self.status_push,
        }
    }
}

/// Quiet-hours window, `"HH:MM"` boundaries that may cross midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_quiet_start")]
    pub start: String,
    #[serde(default = "default_quiet_end")]
    pub end: String,
}

fn default_quiet_start() -> String {
    "22:00".to_string()
}
fn default_quiet_end() -> String {
    "08:00".to_string()
}

impl Default for QuietHours {
    fn default() -> Self {
        QuietHours {
            enabled: false,
            start: default_quiet_start(),
            end: default_quiet_end(),
        }
    }
}

/// User notification preferences (§3). Missing preferences default to
/// all channels enabled, no suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default = "default_true")]
    pub sms: bool,
    #[serde(default = "default_true")]
    pub email: bool,
    #[serde(default = "default_true")]
    pub push: bool,
    #[serde(default)]
    pub priority_only: bool,
    #[serde(default)]
    pub quiet_hours: QuietHours,
}

fn default_true() -> bool {
    true
}

impl Default for UserPreferences {
    fn default() -> Self {
        UserPreferences {
            sms: true,
            email: true,
            push: true,
            priority_only: false,
            quiet_hours: QuietHours::default(),
        }
    }
}

impl UserPreferences {
    pub fn enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Sms => self.sms,
            Channel::Email => self.email,
            Channel::Push => self.push,
        }
    }
}

/// Device kind backing a connection record (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Web,
    Ios,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Web => "web",
            DeviceType::Ios => "ios",
        }
    }
}

/// A single registered connection (§3): a web socket or an iOS device
/// token, keyed by `(user_id, device_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub user_id: String,
    pub device_type: DeviceType,
    pub websocket_id: Option<String>,
    pub connection_url: Option<String>,
    pub device_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The message actually published onto a per-channel queue: the event
/// payload, plus the event_id minted/resolved at ingress so workers never
/// have to re-derive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub event_id: String,
    pub channel: Channel,
    pub payload: EventWirePayload,
}

/// A raw message handed back by the bus: body plus whatever the bus needs
/// to delete it later.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub receipt_handle: String,
    pub body: String,
}

pub type AttrMap = HashMap<String, serde_json::Value>;
