use chrono::Utc;
use serde::{Deserialize, Serialize};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// One tenant's webhook integration. The api key authenticates inbound webhook
/// calls; the webhook secret is the per-request signature material. Message
/// counters are only ever moved by atomic store-side increments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAccount {
    pub id: String,
    pub name: String,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub phone_number: String,
    pub status: AccountStatus,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Admin,
    Agent,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: AgentRole,
    pub created_at: String,
    pub last_signed_in: String,
}

/// The ongoing thread with one customer within one account. At most one
/// conversation exists per (account, normalized phone) pair; the store enforces
/// this with a unique key rather than a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub account_id: String,
    pub customer_phone: String,
    pub customer_phone_normalized: String,
    pub customer_name: String,
    pub last_message_at: String,
    pub unread_count: i64,
    pub is_new: bool,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            "sticker" => Some(Self::Sticker),
            _ => None,
        }
    }
}

/// Tagged message content. The plain-text preview for conversation lists is
/// derived from this, not the other way around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    Contact {
        name: String,
        phone: Option<String>,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
    Media {
        kind: MediaKind,
        url: Option<String>,
        caption: Option<String>,
    },
}

impl MessageContent {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Location { .. } => "location",
            Self::Contact { .. } => "contact",
            Self::Poll { .. } => "poll",
            Self::Media { kind, .. } => kind.as_str(),
        }
    }

    /// Plain-text rendering for list previews and the `content` column.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Location {
                latitude,
                longitude,
                name,
            } => match name {
                Some(name) if !name.is_empty() => {
                    format!("Location: {latitude}, {longitude} ({name})")
                }
                _ => format!("Location: {latitude}, {longitude}"),
            },
            Self::Contact { name, phone } => match phone {
                Some(phone) if !phone.is_empty() => format!("Contact: {name} ({phone})"),
                _ => format!("Contact: {name}"),
            },
            Self::Poll { question, .. } => format!("Poll: {question}"),
            Self::Media { caption, .. } => caption.clone().unwrap_or_default(),
        }
    }

    pub fn media_url(&self) -> Option<String> {
        match self {
            Self::Media { url, .. } => url.clone(),
            _ => None,
        }
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            Self::Media { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// One inbound or outbound event in a conversation. Immutable after creation
/// except for delivery-status transitions. `external_id` is the provider's
/// message id and exists solely for deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub content: Option<String>,
    pub body: MessageContent,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub agent_id: Option<String>,
    pub status: DeliveryStatus,
    pub external_id: Option<String>,
    pub timestamp: String,
}

/// Append-only audit record of a raw webhook event. Never read by the live
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLog {
    pub id: String,
    pub account_id: String,
    pub direction: Direction,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<String>,
    pub status: String,
    pub timestamp: String,
}

/// The one realtime event the inbox pushes: a new message in a conversation the
/// session's agent is entitled to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub conversation_id: String,
    pub account_id: String,
    pub message: PushMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub sender: String,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub timestamp: String,
}

impl NewMessageEvent {
    pub fn from_message(account_id: &str, message: &Message) -> Self {
        let sender = match message.direction {
            Direction::Inbound => message.from_number.clone().unwrap_or_default(),
            Direction::Outbound => message.agent_id.clone().unwrap_or_default(),
        };
        Self {
            conversation_id: message.conversation_id.clone(),
            account_id: account_id.to_string(),
            message: PushMessage {
                sender,
                content: message.content.clone().unwrap_or_default(),
                message_type: message.body.message_type().to_string(),
                media_url: message.media_url.clone(),
                timestamp: message.timestamp.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_preview_includes_name_parenthetical() {
        let content = MessageContent::Location {
            latitude: -23.55,
            longitude: -46.63,
            name: Some("Office".to_string()),
        };
        assert_eq!(content.preview(), "Location: -23.55, -46.63 (Office)");
    }

    #[test]
    fn location_preview_without_name() {
        let content = MessageContent::Location {
            latitude: 1.5,
            longitude: 2.5,
            name: None,
        };
        assert_eq!(content.preview(), "Location: 1.5, 2.5");
    }

    #[test]
    fn contact_preview() {
        let content = MessageContent::Contact {
            name: "Maria".to_string(),
            phone: Some("5511999990000".to_string()),
        };
        assert_eq!(content.preview(), "Contact: Maria (5511999990000)");
    }

    #[test]
    fn poll_preview() {
        let content = MessageContent::Poll {
            question: "Lunch?".to_string(),
            options: vec!["yes".to_string(), "no".to_string()],
        };
        assert_eq!(content.preview(), "Poll: Lunch?");
    }

    #[test]
    fn media_preview_is_caption_or_empty() {
        let with_caption = MessageContent::Media {
            kind: MediaKind::Image,
            url: Some("https://cdn.example/img.jpg".to_string()),
            caption: Some("receipt".to_string()),
        };
        assert_eq!(with_caption.preview(), "receipt");
        assert_eq!(with_caption.message_type(), "image");

        let bare = MessageContent::Media {
            kind: MediaKind::Sticker,
            url: None,
            caption: None,
        };
        assert_eq!(bare.preview(), "");
        assert_eq!(bare.message_type(), "sticker");
    }
}
