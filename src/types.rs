use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder used for missing sender / gift names, matching what the
/// dashboard already expects in stored records.
pub const UNKNOWN: &str = "unknown";

/// A viewer sent a virtual gift.
///
/// Every field is optional on the wire; use the accessor methods to get the
/// neutral defaults (count 1, value 0, `"unknown"` names).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftEvent {
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub gift_id: Option<Value>,
    #[serde(default)]
    pub gift_name: Option<String>,
    #[serde(default)]
    pub repeat_count: Option<u64>,
    #[serde(default)]
    pub diamond_count: Option<u64>,
}

impl GiftEvent {
    pub fn sender(&self) -> &str {
        non_empty(self.unique_id.as_deref()).unwrap_or(UNKNOWN)
    }

    pub fn name(&self) -> &str {
        non_empty(self.gift_name.as_deref()).unwrap_or(UNKNOWN)
    }

    /// Repeat count, with missing or zero treated as a single gift.
    pub fn count(&self) -> u64 {
        self.repeat_count.filter(|&n| n > 0).unwrap_or(1)
    }

    /// Per-unit diamond value, 0 when missing.
    pub fn unit_value(&self) -> u64 {
        self.diamond_count.unwrap_or(0)
    }

    /// Total diamond value: per-unit value x repeat count.
    pub fn total_value(&self) -> u64 {
        self.unit_value().saturating_mul(self.count())
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Payload shared by `member` (room join) and `follow` notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerEvent {
    #[serde(default)]
    pub unique_id: Option<String>,
}

impl ViewerEvent {
    pub fn viewer(&self) -> &str {
        non_empty(self.unique_id.as_deref()).unwrap_or(UNKNOWN)
    }
}

/// Notification delivered by a live session.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Gift(GiftEvent),
    Chat(ChatEvent),
    Member(ViewerEvent),
    Follow(ViewerEvent),
    /// Upstream reported a non-fatal error; the session stays up.
    Error { message: String },
    Disconnected,
}

impl LiveEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LiveEvent::Gift(_) => EventKind::Gift,
            LiveEvent::Chat(_) => EventKind::Chat,
            LiveEvent::Member(_) => EventKind::Member,
            LiveEvent::Follow(_) => EventKind::Follow,
            LiveEvent::Error { .. } => EventKind::Error,
            LiveEvent::Disconnected => EventKind::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Gift,
    Chat,
    Member,
    Follow,
    Error,
    Disconnected,
}

/// Descriptor of an established live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub room_id: String,
    /// Any extra fields the source sent with the handshake.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SessionInfo {
    /// Build from a handshake payload. `roomId` may arrive as a string or a
    /// number; returns `None` when it is missing.
    pub fn from_handshake(data: Value) -> Option<Self> {
        let Value::Object(mut extra) = data else {
            return None;
        };
        let room_id = match extra.remove("roomId")? {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self { room_id, extra })
    }
}

/// Type tag of a log entry under `logs/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    BotStarting,
    Connected,
    ConnectFailed,
    Disconnected,
    Error,
    GiftReceived,
    Chat,
    MemberJoin,
    Follow,
    NewHighestBid,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::BotStarting => "BOT_STARTING",
            LogKind::Connected => "CONNECTED",
            LogKind::ConnectFailed => "CONNECT_FAILED",
            LogKind::Disconnected => "DISCONNECTED",
            LogKind::Error => "ERROR",
            LogKind::GiftReceived => "GIFT_RECEIVED",
            LogKind::Chat => "CHAT",
            LogKind::MemberJoin => "MEMBER_JOIN",
            LogKind::Follow => "FOLLOW",
            LogKind::NewHighestBid => "NEW_HIGHEST_BID",
        }
    }
}

/// Append-only diagnostic record stored under `logs/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub data: Value,
    /// Epoch milliseconds.
    pub time: i64,
}

/// Append-only record of one gift, stored under `gifts/` or `donations/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftRecord {
    pub user: String,
    pub gift_id: Option<Value>,
    pub gift_name: String,
    pub repeat_count: u64,
    pub diamond_count: u64,
    pub total_diamond: u64,
    pub time: i64,
}

impl GiftRecord {
    pub fn from_event(gift: &GiftEvent, time: i64) -> Self {
        Self {
            user: gift.sender().to_string(),
            gift_id: gift.gift_id.clone().filter(|id| !id.is_null()),
            gift_name: gift.name().to_string(),
            repeat_count: gift.count(),
            diamond_count: gift.unit_value(),
            total_diamond: gift.total_value(),
            time,
        }
    }
}

/// Singleton "current leader" record at `auction/current`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionState {
    #[serde(default)]
    pub highest_bid: u64,
    #[serde(default)]
    pub highest_bidder: Option<String>,
    #[serde(default)]
    pub last_gift: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}
