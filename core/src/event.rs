/// Notification events and the wire shapes they are parsed from
///
/// Every inbound source (push, socket, poll) is converted into a
/// `NotificationEvent` exactly once, here. Anything that cannot be turned into
/// an event with a stable id and a type is a `MalformedEvent` and goes no
/// further.
use crate::error::{NotifyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

/// Opaque key/value payload carried by an event
pub type Payload = serde_json::Map<String, Value>;

/// Kind of notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Like,
    Comment,
    Follow,
    Mention,
    Message,
    Share,
    General,
}

impl NotificationType {
    /// Map a wire string to a type. Unrecognized kinds become `General`.
    pub fn from_wire(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "like" => NotificationType::Like,
            "comment" => NotificationType::Comment,
            "follow" => NotificationType::Follow,
            "mention" => NotificationType::Mention,
            "message" => NotificationType::Message,
            "share" => NotificationType::Share,
            _ => NotificationType::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Like => "like",
            NotificationType::Comment => "comment",
            NotificationType::Follow => "follow",
            NotificationType::Mention => "mention",
            NotificationType::Message => "message",
            NotificationType::Share => "share",
            NotificationType::General => "general",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Push,
    Socket,
    Poll,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Push => "push",
            EventSource::Socket => "socket",
            EventSource::Poll => "poll",
        }
    }
}

/// A validated notification event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub payload: Payload,
    pub source: EventSource,
    pub received_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Create an event with an empty payload
    pub fn new(id: impl Into<String>, kind: NotificationType, source: EventSource) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: Payload::new(),
            source,
            received_at: Utc::now(),
        }
    }

    /// Builder-style payload field
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// First non-empty string value among `keys`
    pub fn field(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.payload.get(*k))
            .filter_map(Value::as_str)
            .find(|s| !s.is_empty())
    }

    /// Parse a push delivery
    pub fn from_push(push: PushPayload) -> Result<Self> {
        let PushPayload {
            message_id,
            from: _,
            sent_time,
            data,
            notification,
        } = push;

        let mut data = data.ok_or_else(|| {
            NotifyError::MalformedEvent("push payload has no data".to_string())
        })?;
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(NotificationType::from_wire)
            .ok_or_else(|| {
                NotifyError::MalformedEvent("push payload has no type".to_string())
            })?;

        let id = match message_id.filter(|m| !m.is_empty()) {
            Some(id) => id,
            None => {
                let sent = sent_time.as_ref().filter(|v| !v.is_null()).ok_or_else(|| {
                    NotifyError::MalformedEvent(
                        "push payload has neither messageId nor sentTime".to_string(),
                    )
                })?;
                derive_id(EventSource::Push, &value_token(sent), &dedup_token(&data))
            }
        };

        if let Some(notification) = notification {
            if let Some(title) = notification.title {
                data.entry("title").or_insert(Value::String(title));
            }
            if let Some(body) = notification.body {
                data.entry("body").or_insert(Value::String(body));
            }
        }

        Ok(Self {
            id,
            kind,
            payload: data,
            source: EventSource::Push,
            received_at: Utc::now(),
        })
    }
}

/// Derive a stable id for a payload without a provider message id
pub fn derive_id(source: EventSource, sent_time: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(sent_time.as_bytes());
    hasher.update(b"|");
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    format!("{}:{}", source.as_str(), bs58::encode(&digest[..]).into_string())
}

fn dedup_token(data: &Payload) -> String {
    ["notificationId", "_id"]
        .iter()
        .filter_map(|k| data.get(*k))
        .map(value_token)
        .find(|s| !s.is_empty())
        // serde_json maps are ordered by key, so this is canonical
        .unwrap_or_else(|| Value::Object(data.clone()).to_string())
}

fn value_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Visible part of a push delivery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: Option<String>,
    pub body: Option<String>,
}

/// Push delivery as handed over by the platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub sent_time: Option<Value>,
    #[serde(default)]
    pub data: Option<Payload>,
    #[serde(default)]
    pub notification: Option<PushNotification>,
}

/// New chat message announced on the realtime socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketMessage {
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    pub timestamp: Value,
    #[serde(default)]
    pub read: Option<bool>,
}

impl SocketMessage {
    /// Convert into a `message` event
    pub fn to_event(&self) -> Result<NotificationEvent> {
        if self.chat_id.is_empty() {
            return Err(NotifyError::MalformedEvent(
                "socket message has no chatId".to_string(),
            ));
        }
        let id = derive_id(
            EventSource::Socket,
            &value_token(&self.timestamp),
            &format!("{}:{}", self.chat_id, self.sender_id),
        );
        Ok(NotificationEvent {
            id,
            kind: NotificationType::Message,
            payload: Payload::new(),
            source: EventSource::Socket,
            received_at: Utc::now(),
        }
        .with_field("chatId", self.chat_id.clone())
        .with_field("senderId", self.sender_id.clone())
        .with_field("content", self.content.clone()))
    }
}

/// A chat was read on another device or screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub chat_id: String,
}

/// One notification as returned by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerNotification {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub read: bool,
    #[serde(flatten)]
    pub extra: Payload,
}

impl ServerNotification {
    pub fn notification_type(&self) -> NotificationType {
        NotificationType::from_wire(&self.kind)
    }

    pub fn to_event(&self) -> NotificationEvent {
        NotificationEvent {
            id: self.id.clone(),
            kind: self.notification_type(),
            payload: self.extra.clone(),
            source: EventSource::Poll,
            received_at: Utc::now(),
        }
    }
}

/// Page of `GET /notifications`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    /// Items that fail to parse are dropped; the rest of the page still counts
    #[serde(default, deserialize_with = "lenient_notifications")]
    pub notifications: Vec<ServerNotification>,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub current_page: u32,
}

fn lenient_notifications<'de, D>(deserializer: D) -> std::result::Result<Vec<ServerNotification>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ServerNotification>(item) {
            Ok(notification) => Some(notification),
            Err(e) => {
                debug!("Dropping malformed server notification: {}", e);
                None
            }
        })
        .collect())
}
